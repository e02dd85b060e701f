//! Transition events: one per ledger state change, for external audit.
//! Lightweight: a ring buffer for dashboards, a tracing sink, and fan-out.

use chrono::{DateTime, Utc};
use outreach_core::types::Channel;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::ledger::{LeadLedgerEntry, LeadOutreachState, Transition};
use crate::outcome::AttemptOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub lead_id: String,
    pub rule_id: String,
    pub channel: Channel,
    /// `None` when the entry was just created.
    pub from_state: Option<LeadOutreachState>,
    pub to_state: LeadOutreachState,
    pub outcome: Option<AttemptOutcome>,
    pub at: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn from_transition(entry: &LeadLedgerEntry, transition: &Transition) -> Self {
        Self {
            lead_id: entry.lead_id.clone(),
            rule_id: entry.rule_id.clone(),
            channel: entry.channel,
            from_state: transition.from,
            to_state: transition.to,
            outcome: transition.outcome,
            at: transition.at,
        }
    }

    pub fn created(entry: &LeadLedgerEntry) -> Self {
        Self {
            lead_id: entry.lead_id.clone(),
            rule_id: entry.rule_id.clone(),
            channel: entry.channel,
            from_state: None,
            to_state: entry.state,
            outcome: None,
            at: entry.created_at,
        }
    }
}

/// Receives every transition. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TransitionEvent);
}

/// In-memory ring buffer of recent events.
pub struct EventLog {
    capacity: usize,
    history: Mutex<VecDeque<TransitionEvent>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Most recent events, oldest first.
    pub fn history(&self) -> Vec<TransitionEvent> {
        match self.history.lock() {
            Ok(h) => h.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(100)
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: &TransitionEvent) {
        if let Ok(mut history) = self.history.lock() {
            history.push_back(event.clone());
            while history.len() > self.capacity {
                history.pop_front();
            }
        }
    }
}

/// Logs each transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &TransitionEvent) {
        let from = event.from_state.map(|s| s.as_str()).unwrap_or("new");
        let outcome = event.outcome.map(|o| o.as_str()).unwrap_or("-");
        if event.to_state.is_terminal() {
            tracing::info!(
                "🏁 {}/{}/{}: {} → {} (outcome: {})",
                event.lead_id, event.rule_id, event.channel, from, event.to_state, outcome
            );
        } else {
            tracing::debug!(
                "🔀 {}/{}/{}: {} → {} (outcome: {})",
                event.lead_id, event.rule_id, event.channel, from, event.to_state, outcome
            );
        }
    }
}

/// Forwards to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &TransitionEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerKey;

    fn event(n: i64) -> TransitionEvent {
        let entry = LeadLedgerEntry::new(
            &LedgerKey::new(&format!("lead-{n}"), "r", Channel::Sms),
            None,
            Utc::now(),
        );
        TransitionEvent::created(&entry)
    }

    #[test]
    fn test_ring_buffer_keeps_latest() {
        let log = EventLog::new(3);
        for n in 0..5 {
            log.emit(&event(n));
        }
        let history = log.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].lead_id, "lead-2");
        assert_eq!(history[2].lead_id, "lead-4");
    }

    #[test]
    fn test_fanout() {
        let a = Arc::new(EventLog::new(10));
        let b = Arc::new(EventLog::new(10));
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone()).with(Arc::new(TracingSink));
        fanout.emit(&event(1));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a.history()[0].from_state, None);
    }
}
