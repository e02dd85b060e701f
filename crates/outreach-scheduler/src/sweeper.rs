//! Reengagement sweeper: turns inactive leads into new ledger lines.
//!
//! A lead triggers a rule when it has been inactive for `inactivity_days`,
//! passes the rule's segmentation, and has no line under the rule created
//! within the last `inactivity_days` (the re-trigger cool-down). Each
//! trigger opens one line per configured channel.

use chrono::{DateTime, Utc};
use outreach_core::types::{Channel, LeadProfile};

use crate::ledger::{LeadLedger, LeadLedgerEntry, LedgerKey};
use crate::rules::ReengagementRule;

/// Lead has been silent for at least the rule's threshold.
pub fn is_inactive(lead: &LeadProfile, rule: &ReengagementRule, now: DateTime<Utc>) -> bool {
    now - lead.last_activity_at >= rule.inactivity()
}

/// Any line of the lead under the rule created inside the cool-down, or
/// still being worked.
pub fn in_cooldown(ledger: &LeadLedger, lead_id: &str, rule: &ReengagementRule, now: DateTime<Utc>) -> bool {
    Channel::ALL.iter().any(|channel| {
        ledger
            .get(&LedgerKey::new(lead_id, &rule.id, *channel))
            .is_some_and(|e| !e.state.is_terminal() || now - e.created_at < rule.inactivity())
    })
}

/// New entries for one rule, one per (triggered lead, channel).
pub fn plan_triggers(
    rule: &ReengagementRule,
    leads: &[LeadProfile],
    ledger: &LeadLedger,
    now: DateTime<Utc>,
) -> Vec<LeadLedgerEntry> {
    if !rule.is_active() {
        return Vec::new();
    }
    let mut planned = Vec::new();
    for lead in leads {
        if !is_inactive(lead, rule, now) {
            continue;
        }
        if !rule.segment_matches(&lead.attributes) {
            tracing::debug!("Lead {} outside segment of '{}'", lead.id, rule.name);
            continue;
        }
        if in_cooldown(ledger, &lead.id, rule, now) {
            tracing::debug!("Lead {} in cool-down for '{}'", lead.id, rule.name);
            continue;
        }
        for channel in &rule.channels {
            let key = LedgerKey::new(&lead.id, &rule.id, *channel);
            planned.push(LeadLedgerEntry::new(&key, Some(rule.message()), now));
        }
    }
    planned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryLedgerStore;
    use crate::rules::{DeliveryPolicy, Segmentation};
    use chrono::{Duration, TimeZone};
    use outreach_core::types::SegmentAttributes;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 9, 0, 0).unwrap()
    }

    fn rule() -> ReengagementRule {
        ReengagementRule {
            id: "winback".into(),
            name: "Win back".into(),
            enabled: true,
            paused: false,
            inactivity_days: 14,
            channels: BTreeSet::from([Channel::Whatsapp, Channel::Mail]),
            message_template_ref: "miss-you".into(),
            tone: Some("warm".into()),
            segmentation: None,
            last_triggered_at: None,
            policy: DeliveryPolicy::default(),
        }
    }

    fn lead(id: &str, days_idle: i64, course: Option<&str>) -> LeadProfile {
        LeadProfile {
            id: id.into(),
            last_activity_at: now() - Duration::days(days_idle),
            attributes: SegmentAttributes {
                course: course.map(String::from),
                ..Default::default()
            },
            contact: Default::default(),
        }
    }

    fn ledger() -> LeadLedger {
        LeadLedger::open(Arc::new(MemoryLedgerStore::new())).unwrap()
    }

    #[test]
    fn test_inactive_lead_gets_line_per_channel() {
        let planned = plan_triggers(&rule(), &[lead("a", 20, None), lead("b", 3, None)], &ledger(), now());
        assert_eq!(planned.len(), 2);
        assert!(planned.iter().all(|e| e.lead_id == "a"));
        let channels: Vec<Channel> = planned.iter().map(|e| e.channel).collect();
        assert_eq!(channels, vec![Channel::Whatsapp, Channel::Mail]);
        let message = planned[0].message.as_ref().unwrap();
        assert_eq!(message.template_ref, "miss-you");
        assert_eq!(message.tone.as_deref(), Some("warm"));
    }

    #[tokio::test]
    async fn test_no_duplicate_next_day() {
        let r = rule();
        let leads = [lead("a", 20, None)];
        let mut ledger = ledger();
        for entry in plan_triggers(&r, &leads, &ledger, now()) {
            ledger.insert(entry, now()).await.unwrap();
        }
        let tomorrow = now() + Duration::days(1);
        assert!(plan_triggers(&r, &leads, &ledger, tomorrow).is_empty());
    }

    #[tokio::test]
    async fn test_retrigger_after_cooldown_once_terminal() {
        let r = rule();
        let leads = [lead("a", 20, None)];
        let mut ledger = ledger();
        for entry in plan_triggers(&r, &leads, &ledger, now()) {
            let key = entry.key();
            ledger.insert(entry, now()).await.unwrap();
            ledger.get_mut(&key).unwrap().cancel("no reply", now());
            ledger.persist(&key, now()).await.unwrap();
        }
        let later = now() + Duration::days(15);
        let again = plan_triggers(&r, &[lead("a", 35, None)], &ledger, later);
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_open_line_blocks_retrigger() {
        let r = rule();
        let mut ledger = ledger();
        for entry in plan_triggers(&r, &[lead("a", 20, None)], &ledger, now()) {
            ledger.insert(entry, now()).await.unwrap();
        }
        let later = now() + Duration::days(30);
        assert!(plan_triggers(&r, &[lead("a", 50, None)], &ledger, later).is_empty());
    }

    #[test]
    fn test_segmentation_and_pause() {
        let mut r = rule();
        r.segmentation = Some(Segmentation {
            courses: vec!["mba".into()],
            ..Default::default()
        });
        let leads = [lead("a", 20, Some("MBA")), lead("b", 20, Some("Law")), lead("c", 20, None)];
        let planned = plan_triggers(&r, &leads, &ledger(), now());
        assert_eq!(planned.len(), 2);
        assert!(planned.iter().all(|e| e.lead_id == "a"));

        r.paused = true;
        assert!(plan_triggers(&r, &leads, &ledger(), now()).is_empty());
    }
}
