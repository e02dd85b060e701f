//! Attempt outcomes and the provider-result classifier.

use serde::{Deserialize, Serialize};

/// Classified result of one contact attempt. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Voicemail,
    NoAnswer,
    Busy,
    Failure,
    Error,
    InvalidNumber,
    Answered,
}

impl AttemptOutcome {
    pub const ALL: [AttemptOutcome; 7] = [
        AttemptOutcome::Voicemail,
        AttemptOutcome::NoAnswer,
        AttemptOutcome::Busy,
        AttemptOutcome::Failure,
        AttemptOutcome::Error,
        AttemptOutcome::InvalidNumber,
        AttemptOutcome::Answered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Voicemail => "voicemail",
            AttemptOutcome::NoAnswer => "no-answer",
            AttemptOutcome::Busy => "busy",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Error => "error",
            AttemptOutcome::InvalidNumber => "invalid-number",
            AttemptOutcome::Answered => "answered",
        }
    }

    /// Outcomes that may go through the backoff table.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AttemptOutcome::Answered | AttemptOutcome::InvalidNumber)
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a provider-reported result to an outcome.
///
/// Total: anything unrecognized becomes `Error` so it still flows through
/// the retry path instead of being dropped.
pub fn classify(provider_result: &str) -> AttemptOutcome {
    let normalized: String = provider_result
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '_' || c == ' ' { '-' } else { c })
        .collect();

    match normalized.as_str() {
        "answered" | "completed" | "human" | "connected" | "delivered" | "read" | "sent" => {
            AttemptOutcome::Answered
        }
        "voicemail" | "machine" | "machine-start" | "machine-end-beep" | "answering-machine" => {
            AttemptOutcome::Voicemail
        }
        "no-answer" | "noanswer" | "ring-no-answer" | "unanswered" => AttemptOutcome::NoAnswer,
        "busy" | "user-busy" => AttemptOutcome::Busy,
        "failure" | "failed" | "canceled" | "cancelled" | "rejected" => AttemptOutcome::Failure,
        "invalid-number" | "invalid" | "unallocated" | "not-in-service" | "undeliverable"
        | "bounced" => AttemptOutcome::InvalidNumber,
        _ => {
            if normalized != "error" && normalized != "timeout" {
                tracing::debug!("Unrecognized provider result '{provider_result}', classified as error");
            }
            AttemptOutcome::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_results() {
        assert_eq!(classify("answered"), AttemptOutcome::Answered);
        assert_eq!(classify("no-answer"), AttemptOutcome::NoAnswer);
        assert_eq!(classify("NO_ANSWER"), AttemptOutcome::NoAnswer);
        assert_eq!(classify("busy"), AttemptOutcome::Busy);
        assert_eq!(classify("voicemail"), AttemptOutcome::Voicemail);
        assert_eq!(classify("machine_end_beep"), AttemptOutcome::Voicemail);
        assert_eq!(classify("failed"), AttemptOutcome::Failure);
        assert_eq!(classify("invalid number"), AttemptOutcome::InvalidNumber);
        assert_eq!(classify("delivered"), AttemptOutcome::Answered);
        assert_eq!(classify("bounced"), AttemptOutcome::InvalidNumber);
    }

    #[test]
    fn test_classify_unknown_is_error() {
        assert_eq!(classify(""), AttemptOutcome::Error);
        assert_eq!(classify("timeout"), AttemptOutcome::Error);
        assert_eq!(classify("carrier said something odd"), AttemptOutcome::Error);
    }

    #[test]
    fn test_as_str_roundtrips_through_classify() {
        for outcome in AttemptOutcome::ALL {
            assert_eq!(classify(outcome.as_str()), outcome);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(AttemptOutcome::Busy.is_retryable());
        assert!(!AttemptOutcome::Answered.is_retryable());
        assert!(!AttemptOutcome::InvalidNumber.is_retryable());
    }
}
