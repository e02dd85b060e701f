//! Value types shared between the engine and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Contact channel an attempt goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Voice,
    Whatsapp,
    Sms,
    Mail,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Voice, Channel::Whatsapp, Channel::Sms, Channel::Mail];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Voice => "voice",
            Channel::Whatsapp => "whatsapp",
            Channel::Sms => "sms",
            Channel::Mail => "mail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voice" | "call" => Some(Channel::Voice),
            "whatsapp" => Some(Channel::Whatsapp),
            "sms" => Some(Channel::Sms),
            "mail" | "email" => Some(Channel::Mail),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a lead can be reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadContact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Attributes used by reengagement segmentation filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentAttributes {
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// Read-only view of a lead as returned by the lead source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadProfile {
    pub id: String,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: SegmentAttributes,
    #[serde(default)]
    pub contact: LeadContact,
}

/// Message tagging carried by reengagement dispatches.
/// The adapter renders `template_ref` in the given `tone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSpec {
    pub template_ref: String,
    #[serde(default)]
    pub tone: Option<String>,
}

/// One contact attempt handed to a channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRequest {
    pub lead_id: String,
    pub rule_id: String,
    pub channel: Channel,
    pub contact: LeadContact,
    pub message: Option<MessageSpec>,
}

/// Raw provider answer for one attempt, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub provider_result: String,
    pub duration: Option<Duration>,
}

impl AttemptReport {
    pub fn new(provider_result: impl Into<String>) -> Self {
        Self {
            provider_result: provider_result.into(),
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!(Channel::parse("WhatsApp"), Some(Channel::Whatsapp));
        assert_eq!(Channel::parse("email"), Some(Channel::Mail));
        assert_eq!(Channel::parse("fax"), None);
        assert_eq!(Channel::Sms.to_string(), "sms");
    }

    #[test]
    fn test_channel_serde_lowercase() {
        let json = serde_json::to_string(&Channel::Voice).unwrap();
        assert_eq!(json, "\"voice\"");
        let back: Channel = serde_json::from_str("\"mail\"").unwrap();
        assert_eq!(back, Channel::Mail);
    }
}
