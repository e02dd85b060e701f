//! Outreach configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{OutreachError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutreachConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl OutreachConfig {
    /// Load config from the default path (~/.outreach/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OutreachError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| OutreachError::Config(format!("Failed to parse config: {e}")))?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the outreach home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".outreach")
    }
}

/// Scheduler loop and dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Per-attempt provider timeout; expiry counts as an `error` outcome.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Global worker bound. Per-rule caps apply on top of it.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Size of the in-memory transition event ring.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

fn default_tick_interval() -> u64 { 5 }
fn default_sweep_interval() -> u64 { 3600 }
fn default_attempt_timeout() -> u64 { 60 }
fn default_shutdown_grace() -> u64 { 30 }
fn default_max_workers() -> usize { 32 }
fn default_event_history() -> usize { 100 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            sweep_interval_secs: default_sweep_interval(),
            attempt_timeout_secs: default_attempt_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            max_workers: default_max_workers(),
            event_history: default_event_history(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(OutreachError::Config("engine.tick_interval_secs must be > 0".into()));
        }
        if self.sweep_interval_secs < self.tick_interval_secs {
            return Err(OutreachError::Config(
                "engine.sweep_interval_secs must not be shorter than the tick interval".into(),
            ));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(OutreachError::Config("engine.attempt_timeout_secs must be > 0".into()));
        }
        if self.max_workers == 0 {
            return Err(OutreachError::Config("engine.max_workers must be > 0".into()));
        }
        Ok(())
    }
}

/// Where the host keeps its files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,
    #[serde(default = "default_rules_path")]
    pub rules_path: String,
    #[serde(default = "default_leads_path")]
    pub leads_path: String,
}

fn default_ledger_path() -> String { "~/.outreach/ledger.db".into() }
fn default_rules_path() -> String { "~/.outreach/rules.json".into() }
fn default_leads_path() -> String { "~/.outreach/leads.json".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            rules_path: default_rules_path(),
            leads_path: default_leads_path(),
        }
    }
}

impl StorageConfig {
    pub fn ledger_path(&self) -> PathBuf {
        expand(&self.ledger_path)
    }

    pub fn rules_path(&self) -> PathBuf {
        expand(&self.rules_path)
    }

    pub fn leads_path(&self) -> PathBuf {
        expand(&self.leads_path)
    }
}

fn expand(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Provider settings per channel. A missing section means no adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub voice: Option<VoiceConfig>,
    #[serde(default)]
    pub whatsapp: Option<WhatsAppConfig>,
    #[serde(default)]
    pub sms: Option<SmsConfig>,
    #[serde(default)]
    pub mail: Option<MailConfig>,
}

/// HTTP telephony provider that places a call and reports its disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub api_url: String,
    pub api_key: String,
    pub caller_id: String,
    /// Spoken script per template ref, for providers with TTS.
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

/// WhatsApp Business Cloud API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    #[serde(default = "default_graph_url")]
    pub api_base: String,
    /// Language code for approved templates.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_graph_url() -> String { "https://graph.facebook.com/v21.0".into() }
fn default_language() -> String { "en".into() }

/// Generic HTTP SMS gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_key: String,
    pub sender: String,
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

/// SMTP mail delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

fn default_smtp_port() -> u16 { 587 }
fn default_subject() -> String { "We miss you".into() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = OutreachConfig::parse("").unwrap();
        assert_eq!(config.engine.tick_interval_secs, 5);
        assert_eq!(config.engine.attempt_timeout_secs, 60);
        assert!(config.channels.voice.is_none());
        assert!(config.storage.ledger_path.ends_with("ledger.db"));
    }

    #[test]
    fn test_parse_channels() {
        let config = OutreachConfig::parse(
            r#"
            [engine]
            tick_interval_secs = 2
            sweep_interval_secs = 60

            [channels.sms]
            api_url = "https://sms.example.com/send"
            api_key = "k"
            sender = "SCHOOL"

            [channels.sms.templates]
            welcome_back = "Hi, your course is waiting for you."
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.tick_interval_secs, 2);
        let sms = config.channels.sms.unwrap();
        assert_eq!(sms.sender, "SCHOOL");
        assert!(sms.templates.contains_key("welcome_back"));
    }

    #[test]
    fn test_rejects_sweep_faster_than_tick() {
        let err = OutreachConfig::parse(
            "[engine]\ntick_interval_secs = 10\nsweep_interval_secs = 5\n",
        )
        .unwrap_err();
        assert!(matches!(err, OutreachError::Config(_)));
    }
}
