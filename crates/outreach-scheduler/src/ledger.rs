//! Lead ledger: per (lead, rule, channel) scheduling state and its state machine.
//!
//! ```text
//! Pending ──dispatch──▶ InFlight ──answered──────────▶ Resolved
//!    ▲                     │      ──invalid-number────▶ Exhausted
//!    │                     │      ──budget left───────▶ Retrying ──backoff elapsed──▶ InFlight
//!    └─ created            └───── ──budget spent──────▶ Exhausted
//! ```
//!
//! Entries are never deleted. Terminal entries stay in the store as the
//! audit trail; the in-memory index only tracks the current entry per key.

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{Channel, MessageSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::outcome::AttemptOutcome;
use crate::persistence::LedgerStore;
use crate::rules::DeliveryPolicy;

/// Writes retried on version conflicts before the entry is left dirty.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Scheduling line identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub lead_id: String,
    pub rule_id: String,
    pub channel: Channel,
}

impl LedgerKey {
    pub fn new(lead_id: &str, rule_id: &str, channel: Channel) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            rule_id: rule_id.to_string(),
            channel,
        }
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.lead_id, self.rule_id, self.channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadOutreachState {
    Pending,
    InFlight,
    Retrying,
    Exhausted,
    Resolved,
}

impl LeadOutreachState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadOutreachState::Exhausted | LeadOutreachState::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadOutreachState::Pending => "pending",
            LeadOutreachState::InFlight => "in_flight",
            LeadOutreachState::Retrying => "retrying",
            LeadOutreachState::Exhausted => "exhausted",
            LeadOutreachState::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LeadOutreachState::Pending),
            "in_flight" => Some(LeadOutreachState::InFlight),
            "retrying" => Some(LeadOutreachState::Retrying),
            "exhausted" => Some(LeadOutreachState::Exhausted),
            "resolved" => Some(LeadOutreachState::Resolved),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeadOutreachState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change, reported to event sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: Option<LeadOutreachState>,
    pub to: LeadOutreachState,
    pub outcome: Option<AttemptOutcome>,
    pub at: DateTime<Utc>,
}

/// Mutable scheduling state for one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadLedgerEntry {
    pub id: String,
    pub lead_id: String,
    pub rule_id: String,
    pub channel: Channel,
    pub attempts_total: u32,
    pub attempts_by_outcome: BTreeMap<AttemptOutcome, u32>,
    pub last_outcome: Option<AttemptOutcome>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    pub state: LeadOutreachState,
    /// Template and tone for reengagement lines.
    pub message: Option<MessageSpec>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every save.
    pub version: u64,
}

impl LeadLedgerEntry {
    pub fn new(key: &LedgerKey, message: Option<MessageSpec>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            lead_id: key.lead_id.clone(),
            rule_id: key.rule_id.clone(),
            channel: key.channel,
            attempts_total: 0,
            attempts_by_outcome: BTreeMap::new(),
            last_outcome: None,
            last_attempt_at: None,
            next_eligible_at: now,
            state: LeadOutreachState::Pending,
            message,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(&self.lead_id, &self.rule_id, self.channel)
    }

    pub fn attempts_for(&self, outcome: AttemptOutcome) -> u32 {
        self.attempts_by_outcome.get(&outcome).copied().unwrap_or(0)
    }

    /// Waiting for a dispatch slot: never attempted, or backoff elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            LeadOutreachState::Pending => true,
            LeadOutreachState::Retrying => now >= self.next_eligible_at,
            _ => false,
        }
    }

    /// Pending/Retrying → InFlight.
    pub fn mark_in_flight(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if !matches!(self.state, LeadOutreachState::Pending | LeadOutreachState::Retrying) {
            return None;
        }
        let from = self.state;
        self.state = LeadOutreachState::InFlight;
        self.last_attempt_at = Some(now);
        Some(Transition {
            from: Some(from),
            to: LeadOutreachState::InFlight,
            outcome: None,
            at: now,
        })
    }

    /// Record the outcome of the attempt in flight and move to the next state.
    ///
    /// A terminal entry (cancelled while the attempt was running) keeps its
    /// state; only the attempt counters are updated.
    pub fn apply_outcome(
        &mut self,
        outcome: AttemptOutcome,
        policy: &DeliveryPolicy,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        match self.state {
            LeadOutreachState::InFlight => {}
            s if s.is_terminal() => {
                self.count_attempt(outcome);
                return None;
            }
            s => {
                tracing::warn!("Outcome {outcome} for {} ignored: entry is {s}, not in flight", self.key());
                return None;
            }
        }

        self.count_attempt(outcome);
        let next = match outcome {
            AttemptOutcome::Answered => LeadOutreachState::Resolved,
            AttemptOutcome::InvalidNumber => LeadOutreachState::Exhausted,
            other => {
                let backoff = policy.backoff.lookup(other);
                if self.attempts_total < policy.max_attempts_per_lead
                    && self.attempts_for(other) < backoff.max_attempts_for_outcome
                {
                    self.next_eligible_at = now
                        .checked_add_signed(backoff.interval())
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    LeadOutreachState::Retrying
                } else {
                    LeadOutreachState::Exhausted
                }
            }
        };
        self.state = next;
        Some(Transition {
            from: Some(LeadOutreachState::InFlight),
            to: next,
            outcome: Some(outcome),
            at: now,
        })
    }

    /// Resolve from outside the outcome path (opt-out, conversion, manual close).
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        let from = self.state;
        self.state = LeadOutreachState::Resolved;
        self.cancel_reason = Some(reason.to_string());
        Some(Transition {
            from: Some(from),
            to: LeadOutreachState::Resolved,
            outcome: None,
            at: now,
        })
    }

    fn count_attempt(&mut self, outcome: AttemptOutcome) {
        self.attempts_total += 1;
        *self.attempts_by_outcome.entry(outcome).or_insert(0) += 1;
        self.last_outcome = Some(outcome);
    }
}

/// Indexed ledger with write-through persistence.
///
/// Only the engine mutates it, under its state lock. A failed write keeps
/// the entry dirty and halts the ledger until the store answers again.
pub struct LeadLedger {
    entries: HashMap<LedgerKey, LeadLedgerEntry>,
    store: Arc<dyn LedgerStore>,
    dirty: BTreeSet<LedgerKey>,
    halted: bool,
}

impl LeadLedger {
    /// Load the current entry of every line from the store.
    pub fn open(store: Arc<dyn LedgerStore>) -> Result<Self> {
        let loaded = store.load_current()?;
        let entries = loaded.into_iter().map(|e| (e.key(), e)).collect::<HashMap<_, _>>();
        tracing::info!("📒 Ledger opened with {} lines", entries.len());
        Ok(Self {
            entries,
            store,
            dirty: BTreeSet::new(),
            halted: false,
        })
    }

    pub fn get(&self, key: &LedgerKey) -> Option<&LeadLedgerEntry> {
        self.entries.get(key)
    }

    /// Mutable access; the caller must [`persist`](Self::persist) afterwards.
    pub fn get_mut(&mut self, key: &LedgerKey) -> Option<&mut LeadLedgerEntry> {
        self.entries.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LeadLedgerEntry> {
        self.entries.values()
    }

    pub fn entries_for_rule<'a>(&'a self, rule_id: &'a str) -> impl Iterator<Item = &'a LeadLedgerEntry> {
        self.entries.values().filter(move |e| e.rule_id == rule_id)
    }

    /// Lines left `InFlight` by a previous process.
    pub fn orphaned_in_flight(&self) -> Vec<LedgerKey> {
        let mut keys: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.state == LeadOutreachState::InFlight)
            .map(|e| e.key())
            .collect();
        keys.sort();
        keys
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Put a new entry in the index, replacing the key's previous entry,
    /// and persist it.
    pub async fn insert(&mut self, entry: LeadLedgerEntry, now: DateTime<Utc>) -> Result<()> {
        let key = entry.key();
        self.entries.insert(key.clone(), entry);
        self.persist(&key, now).await
    }

    /// Put back a copy taken before a change whose write failed.
    pub fn restore(&mut self, entry: LeadLedgerEntry) {
        let key = entry.key();
        self.dirty.remove(&key);
        self.entries.insert(key, entry);
    }

    /// Write one entry, retrying version conflicts.
    pub async fn persist(&mut self, key: &LedgerKey, now: DateTime<Utc>) -> Result<()> {
        if self.halted {
            self.dirty.insert(key.clone());
            return Err(OutreachError::LedgerUnavailable("ledger halted".into()));
        }
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(());
        };
        entry.updated_at = now;
        entry.version += 1;

        let mut last_err = None;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let row = entry.clone();
            match on_store(&self.store, move |store| store.save_entry(&row)).await {
                Ok(()) => {
                    self.dirty.remove(key);
                    tracing::debug!("💾 Saved {} ({}, v{})", key, entry.state, entry.version);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    tracing::warn!("⚠️ Ledger conflict on {key} (attempt {attempt}/{MAX_WRITE_ATTEMPTS})");
                    let entry_id = entry.id.clone();
                    match on_store(&self.store, move |store| store.stored_version(&entry_id)).await {
                        Ok(stored) => entry.version = stored.unwrap_or(0).max(entry.version) + 1,
                        Err(e) => {
                            last_err = Some(e);
                            break;
                        }
                    }
                    last_err = Some(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        self.dirty.insert(key.clone());
        let err = last_err.unwrap_or_else(|| OutreachError::Ledger(format!("write failed for {key}")));
        if !err.is_conflict() {
            tracing::error!("🛑 Ledger store unavailable, halting dispatch: {err}");
            self.halted = true;
        }
        Err(err)
    }

    /// Retry dirty entries; lift the halt once the store answers.
    /// Returns true when the ledger is usable for new dispatch.
    pub async fn flush(&mut self, now: DateTime<Utc>) -> bool {
        if self.halted {
            if let Err(e) = on_store(&self.store, |store| store.ping()).await {
                tracing::warn!("⚠️ Ledger store still unavailable: {e}");
                return false;
            }
            tracing::info!("✅ Ledger store reachable again, resuming");
            self.halted = false;
        }
        let dirty: Vec<LedgerKey> = self.dirty.iter().cloned().collect();
        for key in dirty {
            if self.persist(&key, now).await.is_err() && self.halted {
                return false;
            }
        }
        !self.halted
    }

    pub fn counts_by_state(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.state.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

/// Run one store call on tokio's blocking pool.
async fn on_store<T, F>(store: &Arc<dyn LedgerStore>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn LedgerStore) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || call(store.as_ref()))
        .await
        .map_err(|e| OutreachError::LedgerUnavailable(format!("ledger store task failed: {e}")))?
}
