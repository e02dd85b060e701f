//! Error type shared by every outreach crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OutreachError>;

#[derive(Debug, Error)]
pub enum OutreachError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid rule '{rule_id}': {reason}")]
    InvalidRule { rule_id: String, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Rule store error: {0}")]
    RuleStore(String),

    #[error("Lead source error: {0}")]
    LeadSource(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Another writer saved the entry since we last read it.
    #[error("Ledger write conflict on entry {entry_id}")]
    LedgerConflict { entry_id: String },

    #[error("Ledger store unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OutreachError {
    pub fn invalid_rule(rule_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule_id: rule_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same ledger write can succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::LedgerConflict { .. })
    }
}
