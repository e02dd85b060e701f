//! Per-rule dispatch lanes: in-flight slots and pacing.
//!
//! One lane per rule. A lane caps concurrent attempts at the rule's
//! `simultaneous_channels` and remembers the last dispatch start for
//! `min_spacing`. Lanes live inside the engine's state lock, so acquiring a
//! slot and marking the entry in flight happen atomically.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::rules::DeliveryPolicy;

/// Per-lane state.
#[derive(Debug, Default)]
struct LaneState {
    active: usize,
    max_concurrent: usize,
    last_dispatch_at: Option<DateTime<Utc>>,
    total_dispatched: u64,
    total_completed: u64,
}

impl LaneState {
    fn has_capacity(&self) -> bool {
        self.active < self.max_concurrent
    }

    fn spacing_elapsed(&self, policy: &DeliveryPolicy, now: DateTime<Utc>) -> bool {
        self.last_dispatch_at.is_none_or(|last| {
            last.checked_add_signed(policy.min_spacing())
                .is_some_and(|ready| now >= ready)
        })
    }
}

/// All rule lanes.
#[derive(Debug, Default)]
pub struct RuleLanes {
    lanes: BTreeMap<String, LaneState>,
}

impl RuleLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh a lane's cap from the current rule snapshot.
    pub fn configure(&mut self, rule_id: &str, policy: &DeliveryPolicy) {
        let lane = self.lanes.entry(rule_id.to_string()).or_default();
        lane.max_concurrent = policy.simultaneous_channels as usize;
    }

    /// Whether one more dispatch may start under the rule right now:
    /// a free slot and the pacing gap elapsed.
    pub fn can_dispatch(&self, rule_id: &str, policy: &DeliveryPolicy, now: DateTime<Utc>) -> bool {
        match self.lanes.get(rule_id) {
            Some(lane) => lane.has_capacity() && lane.spacing_elapsed(policy, now),
            None => policy.simultaneous_channels > 0,
        }
    }

    /// Take a slot. Returns false (and takes nothing) when the lane is full
    /// or paced out.
    pub fn acquire(&mut self, rule_id: &str, policy: &DeliveryPolicy, now: DateTime<Utc>) -> bool {
        let lane = self.lanes.entry(rule_id.to_string()).or_default();
        lane.max_concurrent = policy.simultaneous_channels as usize;
        if !lane.has_capacity() || !lane.spacing_elapsed(policy, now) {
            return false;
        }
        lane.active += 1;
        lane.total_dispatched += 1;
        lane.last_dispatch_at = Some(now);
        tracing::debug!(
            "📥 Lane[{}] acquire (active: {}/{})",
            rule_id, lane.active, lane.max_concurrent
        );
        true
    }

    /// Free a slot after an outcome is recorded.
    pub fn release(&mut self, rule_id: &str) {
        if let Some(lane) = self.lanes.get_mut(rule_id) {
            lane.active = lane.active.saturating_sub(1);
            lane.total_completed += 1;
        }
    }

    pub fn in_flight(&self, rule_id: &str) -> usize {
        self.lanes.get(rule_id).map(|l| l.active).unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        self.lanes
            .iter()
            .map(|(rule_id, lane)| LaneStats {
                rule_id: rule_id.clone(),
                in_flight: lane.active,
                max_concurrent: lane.max_concurrent,
                last_dispatch_at: lane.last_dispatch_at,
                total_dispatched: lane.total_dispatched,
                total_completed: lane.total_completed,
            })
            .collect()
    }
}

/// Statistics for a single rule lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub rule_id: String,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub total_dispatched: u64,
    pub total_completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 12, 0, 0).unwrap()
    }

    fn policy(slots: u32, spacing_secs: u64) -> DeliveryPolicy {
        DeliveryPolicy {
            simultaneous_channels: slots,
            min_spacing_secs: spacing_secs,
            ..DeliveryPolicy::default()
        }
    }

    #[test]
    fn test_concurrency_limits() {
        let mut lanes = RuleLanes::new();
        let p = policy(2, 0);
        assert!(lanes.acquire("r", &p, now()));
        assert!(lanes.acquire("r", &p, now()));
        assert!(!lanes.acquire("r", &p, now()));
        assert_eq!(lanes.in_flight("r"), 2);

        lanes.release("r");
        assert!(lanes.can_dispatch("r", &p, now()));
        assert!(lanes.acquire("r", &p, now()));
    }

    #[test]
    fn test_min_spacing() {
        let mut lanes = RuleLanes::new();
        let p = policy(5, 60);
        assert!(lanes.acquire("r", &p, now()));
        assert!(!lanes.acquire("r", &p, now() + Duration::seconds(59)));
        assert!(lanes.acquire("r", &p, now() + Duration::seconds(60)));
    }

    #[test]
    fn test_oversized_spacing_blocks_without_panicking() {
        let mut lanes = RuleLanes::new();
        let p = policy(5, 100_000_000_000_000_000);
        assert!(lanes.acquire("r", &p, now()));
        assert!(!lanes.can_dispatch("r", &p, now() + Duration::days(365)));
        assert!(!lanes.acquire("r", &p, now() + Duration::days(365)));
    }

    #[test]
    fn test_lanes_are_independent() {
        let mut lanes = RuleLanes::new();
        let p = policy(1, 0);
        assert!(lanes.acquire("a", &p, now()));
        assert!(lanes.acquire("b", &p, now()));
        assert_eq!(lanes.in_flight("a") + lanes.in_flight("b"), 2);
        let stats = lanes.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].rule_id, "a");
    }
}
