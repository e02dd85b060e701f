//! Eligibility filter: which ledger lines may be dispatched now.
//!
//! All checks are conjunctive: rule enabled and inside its windows, line
//! ready (pending, or retrying with backoff elapsed) and within budget,
//! rule pacing elapsed, and a free in-flight slot.

use chrono::{DateTime, Utc};

use crate::ledger::{LeadLedgerEntry, LedgerKey};
use crate::lanes::RuleLanes;
use crate::rules::{DeliveryPolicy, RuleRef};

/// Rule-level gate: enabled and inside the active and daily windows.
pub fn rule_open(rule: &RuleRef, now: DateTime<Utc>) -> bool {
    rule.enabled() && rule.policy().window_open(now)
}

/// The line has attempts left under the rule's per-lead cap.
pub fn within_budget(entry: &LeadLedgerEntry, policy: &DeliveryPolicy) -> bool {
    entry.attempts_total < policy.max_attempts_per_lead
}

/// Line-level gate, independent of other lines.
pub fn entry_ready(entry: &LeadLedgerEntry, rule: &RuleRef, now: DateTime<Utc>) -> bool {
    entry.rule_id == rule.id() && entry.is_ready(now) && within_budget(entry, rule.policy())
}

/// Full check for a single line.
pub fn eligible(entry: &LeadLedgerEntry, rule: &RuleRef, lanes: &RuleLanes, now: DateTime<Utc>) -> bool {
    rule_open(rule, now)
        && entry_ready(entry, rule, now)
        && lanes.can_dispatch(rule.id(), rule.policy(), now)
}

/// Ready lines of a rule, longest-waiting first.
///
/// Ties on `next_eligible_at` fall back to creation time and then the key,
/// so the order is fully deterministic.
pub fn ready_in_order<'a>(
    entries: impl Iterator<Item = &'a LeadLedgerEntry>,
    rule: &RuleRef,
    now: DateTime<Utc>,
) -> Vec<LedgerKey> {
    if !rule_open(rule, now) {
        return Vec::new();
    }
    let mut ready: Vec<&LeadLedgerEntry> = entries.filter(|e| entry_ready(e, rule, now)).collect();
    ready.sort_by(|a, b| {
        a.next_eligible_at
            .cmp(&b.next_eligible_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.key().cmp(&b.key()))
    });
    ready.into_iter().map(|e| e.key()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffTable;
    use crate::ledger::LeadOutreachState;
    use crate::outcome::AttemptOutcome;
    use crate::rules::{DailyWindow, DialingRule};
    use chrono::{Duration, NaiveTime, TimeZone};
    use outreach_core::types::Channel;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap()
    }

    fn rule(enabled: bool) -> RuleRef {
        let mut r = DialingRule::new(
            "dial",
            "Dial",
            DeliveryPolicy {
                simultaneous_channels: 1,
                daily_window: DailyWindow {
                    start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                },
                backoff: BackoffTable::new().with(AttemptOutcome::Busy, Duration::minutes(5), 3),
                ..DeliveryPolicy::default()
            },
        );
        r.enabled = enabled;
        RuleRef::Dialing(Arc::new(r))
    }

    fn entry(lead: &str, created: DateTime<Utc>) -> LeadLedgerEntry {
        LeadLedgerEntry::new(&LedgerKey::new(lead, "dial", Channel::Voice), None, created)
    }

    #[test]
    fn test_disabled_rule_never_eligible() {
        let lanes = RuleLanes::new();
        let e = entry("a", now());
        assert!(eligible(&e, &rule(true), &lanes, now()));
        assert!(!eligible(&e, &rule(false), &lanes, now()));
    }

    #[test]
    fn test_outside_daily_window() {
        let lanes = RuleLanes::new();
        let e = entry("a", now());
        let night = Utc.with_ymd_and_hms(2026, 4, 1, 22, 0, 0).unwrap();
        assert!(!eligible(&e, &rule(true), &lanes, night));
    }

    #[test]
    fn test_retrying_waits_for_backoff() {
        let lanes = RuleLanes::new();
        let r = rule(true);
        let mut e = entry("a", now());
        e.mark_in_flight(now());
        assert!(!eligible(&e, &r, &lanes, now()));
        e.apply_outcome(AttemptOutcome::Busy, r.policy(), now());
        assert_eq!(e.state, LeadOutreachState::Retrying);
        assert!(!eligible(&e, &r, &lanes, now() + Duration::minutes(4)));
        assert!(eligible(&e, &r, &lanes, now() + Duration::minutes(5)));
    }

    #[test]
    fn test_full_lane_blocks() {
        let mut lanes = RuleLanes::new();
        let r = rule(true);
        assert!(lanes.acquire("dial", r.policy(), now()));
        assert!(!eligible(&entry("b", now()), &r, &lanes, now()));
    }

    #[test]
    fn test_terminal_entries_never_eligible() {
        let lanes = RuleLanes::new();
        let r = rule(true);
        let mut e = entry("a", now());
        e.mark_in_flight(now());
        e.apply_outcome(AttemptOutcome::Answered, r.policy(), now());
        for days in 0..3 {
            assert!(!eligible(&e, &r, &lanes, now() + Duration::days(days)));
        }
    }

    #[test]
    fn test_oldest_first_ordering() {
        let r = rule(true);
        let newest = entry("c", now() - Duration::minutes(1));
        let oldest = entry("b", now() - Duration::minutes(30));
        let middle_a = entry("a", now() - Duration::minutes(10));
        let middle_z = entry("z", now() - Duration::minutes(10));
        let entries = [newest, middle_z, oldest, middle_a];
        let order: Vec<String> = ready_in_order(entries.iter(), &r, now())
            .into_iter()
            .map(|k| k.lead_id)
            .collect();
        assert_eq!(order, vec!["b", "a", "z", "c"]);
    }
}
