//! Per-outcome retry intervals and attempt caps.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::outcome::AttemptOutcome;

/// Longest accepted backoff interval or dispatch spacing: ten years.
pub const MAX_INTERVAL_SECS: u64 = 10 * 366 * 24 * 60 * 60;

/// Seconds as a chrono duration, clamped to [`MAX_INTERVAL_SECS`].
pub(crate) fn capped_seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_INTERVAL_SECS) as i64)
}

/// Retry policy for a single outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffEntry {
    /// Wait before the lead becomes eligible again.
    pub interval_secs: u64,
    /// Attempts that may end in this outcome before the line is exhausted.
    pub max_attempts_for_outcome: u32,
}

impl BackoffEntry {
    pub fn new(interval: Duration, max_attempts_for_outcome: u32) -> Self {
        Self {
            interval_secs: interval.num_seconds().max(0) as u64,
            max_attempts_for_outcome,
        }
    }

    pub fn interval(&self) -> Duration {
        capped_seconds(self.interval_secs)
    }

    /// Entry used for outcomes the table does not mention.
    pub const NON_RETRYABLE: BackoffEntry = BackoffEntry {
        interval_secs: 0,
        max_attempts_for_outcome: 0,
    };
}

/// Outcome-keyed backoff table owned by a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackoffTable {
    entries: BTreeMap<AttemptOutcome, BackoffEntry>,
}

impl BackoffTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, outcome: AttemptOutcome, interval: Duration, max_attempts: u32) -> Self {
        self.entries.insert(outcome, BackoffEntry::new(interval, max_attempts));
        self
    }

    pub fn insert(&mut self, outcome: AttemptOutcome, entry: BackoffEntry) {
        self.entries.insert(outcome, entry);
    }

    /// Look up the policy for an outcome. Missing entries fail closed.
    pub fn lookup(&self, outcome: AttemptOutcome) -> BackoffEntry {
        self.entries
            .get(&outcome)
            .copied()
            .unwrap_or(BackoffEntry::NON_RETRYABLE)
    }

    pub fn contains(&self, outcome: AttemptOutcome) -> bool {
        self.entries.contains_key(&outcome)
    }

    /// Retryable outcomes with no entry; they will exhaust on first hit.
    pub fn missing_outcomes(&self) -> Vec<AttemptOutcome> {
        AttemptOutcome::ALL
            .into_iter()
            .filter(|o| o.is_retryable() && !self.entries.contains_key(o))
            .collect()
    }

    /// Structural problems that make the table unusable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(entry) = self.entries.get(&AttemptOutcome::InvalidNumber)
            && entry.max_attempts_for_outcome > 0
        {
            problems.push("invalid-number must carry max_attempts_for_outcome = 0".to_string());
        }
        if self.entries.contains_key(&AttemptOutcome::Answered) {
            problems.push("answered is terminal and cannot have a backoff entry".to_string());
        }
        for (outcome, entry) in &self.entries {
            if entry.interval_secs > MAX_INTERVAL_SECS {
                problems.push(format!("{outcome} interval_secs exceeds {MAX_INTERVAL_SECS}"));
            }
        }
        problems
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttemptOutcome, &BackoffEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_present_entry() {
        let table = BackoffTable::new().with(AttemptOutcome::NoAnswer, Duration::minutes(30), 3);
        let entry = table.lookup(AttemptOutcome::NoAnswer);
        assert_eq!(entry.interval(), Duration::minutes(30));
        assert_eq!(entry.max_attempts_for_outcome, 3);
    }

    #[test]
    fn test_missing_entry_fails_closed() {
        let table = BackoffTable::new().with(AttemptOutcome::NoAnswer, Duration::minutes(30), 3);
        assert_eq!(table.lookup(AttemptOutcome::Busy), BackoffEntry::NON_RETRYABLE);
        let missing = table.missing_outcomes();
        assert!(missing.contains(&AttemptOutcome::Busy));
        assert!(!missing.contains(&AttemptOutcome::NoAnswer));
        assert!(!missing.contains(&AttemptOutcome::InvalidNumber));
    }

    #[test]
    fn test_problems() {
        let table = BackoffTable::new()
            .with(AttemptOutcome::InvalidNumber, Duration::zero(), 2)
            .with(AttemptOutcome::Answered, Duration::zero(), 1);
        assert_eq!(table.problems().len(), 2);

        let ok = BackoffTable::new().with(AttemptOutcome::InvalidNumber, Duration::zero(), 0);
        assert!(ok.problems().is_empty());
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{"no-answer": {"interval_secs": 1800, "max_attempts_for_outcome": 3},
                       "busy": {"interval_secs": 600, "max_attempts_for_outcome": 2}}"#;
        let table: BackoffTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.lookup(AttemptOutcome::Busy).interval_secs, 600);
        assert_eq!(table.lookup(AttemptOutcome::NoAnswer).max_attempts_for_outcome, 3);
    }
}
