//! Rule store and lead source adapters.
//! File-based: rules and leads are JSON documents, re-read on every call so
//! edits apply on the next tick without a restart.

use async_trait::async_trait;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::LeadSource;
use outreach_core::types::LeadProfile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::rules::{DialingRule, ReengagementRule, RuleRef};

/// Read-only source of rule definitions. The engine never writes rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_active_dialing_rules(&self) -> Result<Vec<DialingRule>>;

    async fn list_active_reengagement_rules(&self) -> Result<Vec<ReengagementRule>>;
}

/// Rule file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub dialing: Vec<DialingRule>,
    #[serde(default)]
    pub reengagement: Vec<ReengagementRule>,
}

/// JSON-file rule store.
pub struct FileRuleStore {
    path: PathBuf,
}

impl FileRuleStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Default store path (~/.outreach/rules.json).
    pub fn default_path() -> PathBuf {
        outreach_core::config::OutreachConfig::home_dir().join("rules.json")
    }

    /// Read the whole file. A missing file is an empty rule set.
    pub fn load_file(&self) -> Result<RulesFile> {
        if !self.path.exists() {
            return Ok(RulesFile::default());
        }
        let json = std::fs::read_to_string(&self.path)
            .map_err(|e| OutreachError::RuleStore(format!("read {}: {e}", self.path.display())))?;
        serde_json::from_str(&json)
            .map_err(|e| OutreachError::RuleStore(format!("parse {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn list_active_dialing_rules(&self) -> Result<Vec<DialingRule>> {
        let mut rules = self.load_file()?.dialing;
        rules.retain(|r| r.enabled);
        Ok(rules)
    }

    async fn list_active_reengagement_rules(&self) -> Result<Vec<ReengagementRule>> {
        let mut rules = self.load_file()?.reengagement;
        rules.retain(|r| r.is_active());
        Ok(rules)
    }
}

/// A rule rejected at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRule {
    pub rule_id: String,
    pub reason: String,
}

/// Validated rules for one tick.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    pub rules: Vec<RuleRef>,
    pub skipped: Vec<SkippedRule>,
}

impl RuleSnapshot {
    /// Pull both rule kinds and keep only the valid, enabled ones.
    /// Invalid rules are dropped whole, never partially applied.
    pub async fn load(store: &dyn RuleStore) -> Result<Self> {
        let dialing = store.list_active_dialing_rules().await?;
        let reengagement = store.list_active_reengagement_rules().await?;
        let candidates = dialing
            .into_iter()
            .map(|r| RuleRef::Dialing(Arc::new(r)))
            .chain(reengagement.into_iter().map(|r| RuleRef::Reengagement(Arc::new(r))));
        Ok(Self::from_rules(candidates))
    }

    pub fn from_rules(candidates: impl IntoIterator<Item = RuleRef>) -> Self {
        let mut snapshot = RuleSnapshot::default();
        for rule in candidates {
            if !rule.enabled() {
                continue;
            }
            if snapshot.get(rule.id()).is_some() {
                snapshot.skipped.push(SkippedRule {
                    rule_id: rule.id().to_string(),
                    reason: "duplicate rule id".into(),
                });
                continue;
            }
            match rule.validate() {
                Ok(()) => snapshot.rules.push(rule),
                Err(e) => snapshot.skipped.push(SkippedRule {
                    rule_id: rule.id().to_string(),
                    reason: match e {
                        OutreachError::InvalidRule { reason, .. } => reason,
                        other => other.to_string(),
                    },
                }),
            }
        }
        snapshot
    }

    pub fn get(&self, rule_id: &str) -> Option<&RuleRef> {
        self.rules.iter().find(|r| r.id() == rule_id)
    }

    pub fn dialing(&self) -> impl Iterator<Item = &Arc<DialingRule>> {
        self.rules.iter().filter_map(|r| match r {
            RuleRef::Dialing(d) => Some(d),
            RuleRef::Reengagement(_) => None,
        })
    }

    pub fn reengagement(&self) -> impl Iterator<Item = &Arc<ReengagementRule>> {
        self.rules.iter().filter_map(|r| match r {
            RuleRef::Reengagement(r) => Some(r),
            RuleRef::Dialing(_) => None,
        })
    }
}

/// One lead as stored in the leads file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRecord {
    #[serde(flatten)]
    pub profile: LeadProfile,
    /// Dialing rules targeting this lead.
    #[serde(default)]
    pub campaigns: Vec<String>,
}

/// JSON-file lead source (`[LeadRecord, ...]`).
pub struct FileLeadSource {
    path: PathBuf,
}

impl FileLeadSource {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Vec<LeadRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let json = std::fs::read_to_string(&self.path)
            .map_err(|e| OutreachError::LeadSource(format!("read {}: {e}", self.path.display())))?;
        serde_json::from_str(&json)
            .map_err(|e| OutreachError::LeadSource(format!("parse {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl LeadSource for FileLeadSource {
    async fn campaign_leads(&self, rule_id: &str) -> Result<Vec<LeadProfile>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.campaigns.iter().any(|c| c == rule_id))
            .map(|r| r.profile)
            .collect())
    }

    async fn list_leads(&self) -> Result<Vec<LeadProfile>> {
        Ok(self.load()?.into_iter().map(|r| r.profile).collect())
    }

    async fn get_lead(&self, lead_id: &str) -> Result<Option<LeadProfile>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|r| r.profile.id == lead_id)
            .map(|r| r.profile))
    }
}
