//! Outreach Engine: the tick loop that turns rules and ledger state into
//! dispatched attempts, plus the slower reengagement sweep.
//!
//! All ledger and lane mutations happen under one state lock: selecting a
//! line, taking its lane slot and marking it in flight is a single step, and
//! so is recording an outcome and freeing the slot. Rule and lead reads and
//! the attempts themselves run outside the lock. Ledger writes and event
//! delivery run on tokio's blocking pool while the lock is held, so a line
//! is never dispatched before its `InFlight` state is durable.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outreach_core::config::EngineConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{Clock, LeadSource, SystemClock};
use outreach_core::types::Channel;
use tokio::sync::{Mutex, watch};

use crate::dispatch::{AdapterSet, DispatchJob, Dispatcher, OutcomeRecorder};
use crate::eligibility::{eligible, ready_in_order};
use crate::events::{EventSink, TracingSink, TransitionEvent};
use crate::lanes::{LaneStats, RuleLanes};
use crate::ledger::{LeadLedger, LeadLedgerEntry, LeadOutreachState, LedgerKey};
use crate::outcome::AttemptOutcome;
use crate::persistence::LedgerStore;
use crate::rules::{ReengagementRule, RuleRef};
use crate::store::{RuleSnapshot, RuleStore};
use crate::sweeper;

/// Mutable engine state, guarded by one lock.
struct EngineState {
    ledger: LeadLedger,
    lanes: RuleLanes,
    /// Lines a previous run left in flight; settled once their rule loads.
    orphans: BTreeSet<LedgerKey>,
    known_rules: HashSet<String>,
    reported_invalid: HashSet<String>,
    last_triggered: BTreeMap<String, DateTime<Utc>>,
}

struct EngineCore {
    state: Mutex<EngineState>,
    rules: Arc<dyn RuleStore>,
    leads: Arc<dyn LeadSource>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

/// The scheduling engine.
pub struct OutreachEngine {
    core: Arc<EngineCore>,
    dispatcher: Dispatcher,
    tick_interval: Duration,
    sweep_interval: Duration,
    shutdown_grace: Duration,
}

/// Wiring for [`OutreachEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    rules: Arc<dyn RuleStore>,
    leads: Arc<dyn LeadSource>,
    ledger_store: Arc<dyn LedgerStore>,
    adapters: AdapterSet,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    attempt_timeout: Duration,
}

impl EngineBuilder {
    pub fn events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override `attempt_timeout_secs` with a finer-grained value.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Load the ledger and start the dispatcher. Needs a tokio runtime.
    pub fn build(self) -> Result<OutreachEngine> {
        self.config.validate()?;
        let ledger = LeadLedger::open(self.ledger_store)?;
        let orphans: BTreeSet<LedgerKey> = ledger.orphaned_in_flight().into_iter().collect();
        if !orphans.is_empty() {
            tracing::warn!(
                "⚠️ {} attempts were in flight at last shutdown; they will be settled as errors",
                orphans.len()
            );
        }

        let core = Arc::new(EngineCore {
            state: Mutex::new(EngineState {
                ledger,
                lanes: RuleLanes::new(),
                orphans,
                known_rules: HashSet::new(),
                reported_invalid: HashSet::new(),
                last_triggered: BTreeMap::new(),
            }),
            rules: self.rules,
            leads: self.leads.clone(),
            events: self.events,
            clock: self.clock,
        });
        let dispatcher = Dispatcher::spawn(
            self.adapters,
            self.leads,
            core.clone(),
            self.config.max_workers,
            self.attempt_timeout,
        );

        Ok(OutreachEngine {
            core,
            dispatcher,
            tick_interval: Duration::from_secs(self.config.tick_interval_secs),
            sweep_interval: Duration::from_secs(self.config.sweep_interval_secs),
            shutdown_grace: Duration::from_secs(self.config.shutdown_grace_secs),
        })
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub rules: usize,
    pub created: usize,
    pub dispatched: usize,
    pub reconciled: usize,
    /// Ledger store unreachable; nothing was dispatched.
    pub halted: bool,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub rules_scanned: usize,
    pub leads_triggered: usize,
    pub entries_created: usize,
    pub halted: bool,
}

/// Dashboard view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub lanes: Vec<LaneStats>,
    pub states: BTreeMap<&'static str, usize>,
    pub halted: bool,
    pub dirty_entries: usize,
    pub unsettled_orphans: usize,
    pub last_triggered: BTreeMap<String, DateTime<Utc>>,
}

impl OutreachEngine {
    pub fn builder(
        config: &EngineConfig,
        rules: Arc<dyn RuleStore>,
        leads: Arc<dyn LeadSource>,
        ledger_store: Arc<dyn LedgerStore>,
        adapters: AdapterSet,
    ) -> EngineBuilder {
        EngineBuilder {
            config: config.clone(),
            rules,
            leads,
            ledger_store,
            adapters,
            events: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }

    /// One scheduling pass: settle orphans, open lines for campaign leads,
    /// and dispatch every eligible line a lane has room for.
    pub async fn tick(&self) -> Result<TickReport> {
        let core = &self.core;
        let now = core.clock.now();
        let snapshot = RuleSnapshot::load(core.rules.as_ref()).await?;

        let open_dialing: Vec<_> = snapshot
            .dialing()
            .filter(|r| r.policy.window_open(now))
            .cloned()
            .collect();
        let fetched =
            futures::future::join_all(open_dialing.iter().map(|r| core.leads.campaign_leads(&r.id))).await;
        let mut targets: HashMap<String, Vec<String>> = HashMap::new();
        for (rule, result) in open_dialing.iter().zip(fetched) {
            match result {
                Ok(leads) => {
                    targets.insert(rule.id.clone(), leads.into_iter().map(|l| l.id).collect());
                }
                Err(e) => tracing::warn!("⚠️ Campaign leads for '{}' unavailable: {e}", rule.name),
            }
        }

        let mut report = TickReport {
            rules: snapshot.rules.len(),
            ..TickReport::default()
        };
        let jobs = {
            let mut guard = core.state.lock().await;
            let state = &mut *guard;
            core.note_rules(state, &snapshot);
            if !state.ledger.flush(now).await {
                report.halted = true;
                return Ok(report);
            }
            let mut events = Vec::new();
            report.reconciled = core.reconcile_orphans(state, &snapshot, now, &mut events).await;

            let mut jobs = Vec::new();
            'rules: for rule in &snapshot.rules {
                state.lanes.configure(rule.id(), rule.policy());

                for lead_id in targets.get(rule.id()).into_iter().flatten() {
                    let key = LedgerKey::new(lead_id, rule.id(), Channel::Voice);
                    if state.ledger.get(&key).is_some() {
                        continue;
                    }
                    let entry = LeadLedgerEntry::new(&key, None, now);
                    let event = TransitionEvent::created(&entry);
                    match state.ledger.insert(entry, now).await {
                        Ok(()) => {
                            events.push(event);
                            report.created += 1;
                        }
                        Err(e) if state.ledger.is_halted() => {
                            tracing::error!("❌ Could not open line {key}: {e}");
                            report.halted = true;
                            break 'rules;
                        }
                        Err(e) => tracing::warn!("⚠️ Could not open line {key}: {e}"),
                    }
                }

                for key in ready_in_order(state.ledger.entries_for_rule(rule.id()), rule, now) {
                    let admitted = state
                        .ledger
                        .get(&key)
                        .is_some_and(|entry| eligible(entry, rule, &state.lanes, now));
                    if !admitted {
                        break;
                    }
                    match core.start_attempt(state, rule, &key, now).await {
                        Ok(Some((job, event))) => {
                            events.push(event);
                            jobs.push(job);
                        }
                        Ok(None) => {}
                        Err(e) if state.ledger.is_halted() => {
                            tracing::error!("❌ Dispatch of {key} aborted: {e}");
                            report.halted = true;
                            break 'rules;
                        }
                        Err(e) => tracing::warn!("⚠️ Dispatch of {key} skipped: {e}"),
                    }
                }
            }
            core.publish(events).await;
            jobs
        };

        report.dispatched = jobs.len();
        for job in jobs {
            if let Err(job) = self.dispatcher.submit(job).await {
                tracing::warn!("⚠️ Dispatcher closed, settling {} as error", job.key);
                core.record(&job, AttemptOutcome::Error).await;
            }
        }
        if report.dispatched > 0 || report.created > 0 {
            tracing::info!(
                "⏱️ Tick: {} rules, {} new lines, {} dispatched",
                report.rules, report.created, report.dispatched
            );
        }
        Ok(report)
    }

    /// Reengagement pass: open lines for inactive leads of every active
    /// reengagement rule. The next tick dispatches them.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let core = &self.core;
        let now = core.clock.now();
        let snapshot = RuleSnapshot::load(core.rules.as_ref()).await?;
        let rules: Vec<Arc<ReengagementRule>> = snapshot.reengagement().cloned().collect();
        let mut report = SweepReport::default();
        if rules.is_empty() {
            return Ok(report);
        }
        let leads = core.leads.list_leads().await?;

        let mut guard = core.state.lock().await;
        let state = &mut *guard;
        core.note_rules(state, &snapshot);
        if !state.ledger.flush(now).await {
            report.halted = true;
            return Ok(report);
        }

        let mut events = Vec::new();
        'rules: for rule in &rules {
            report.rules_scanned += 1;
            let planned = sweeper::plan_triggers(rule, &leads, &state.ledger, now);
            if planned.is_empty() {
                continue;
            }
            let triggered: BTreeSet<String> = planned.iter().map(|e| e.lead_id.clone()).collect();
            for entry in planned {
                let key = entry.key();
                let event = TransitionEvent::created(&entry);
                match state.ledger.insert(entry, now).await {
                    Ok(()) => {
                        events.push(event);
                        report.entries_created += 1;
                    }
                    Err(e) if state.ledger.is_halted() => {
                        tracing::error!("❌ Sweep stopped at {key}: {e}");
                        report.halted = true;
                        break 'rules;
                    }
                    Err(e) => tracing::warn!("⚠️ Could not open line {key}: {e}"),
                }
            }
            report.leads_triggered += triggered.len();
            state.last_triggered.insert(rule.id.clone(), now);
            tracing::info!(
                "🔁 Reengagement '{}' triggered {} leads on {} channels",
                rule.name,
                triggered.len(),
                rule.channels.len()
            );
        }
        core.publish(events).await;
        Ok(report)
    }

    /// Resolve a line from outside the outcome path (opt-out, conversion).
    /// Returns false when the line was already terminal. A failed write
    /// leaves the line untouched.
    pub async fn cancel_entry(&self, key: &LedgerKey, reason: &str) -> Result<bool> {
        let now = self.core.clock.now();
        let mut guard = self.core.state.lock().await;
        let state = &mut *guard;
        let entry = state
            .ledger
            .get_mut(key)
            .ok_or_else(|| OutreachError::Ledger(format!("no ledger entry for {key}")))?;
        let before = entry.clone();
        let Some(transition) = entry.cancel(reason, now) else {
            return Ok(false);
        };
        let event = TransitionEvent::from_transition(entry, &transition);
        if let Err(e) = state.ledger.persist(key, now).await {
            state.ledger.restore(before);
            tracing::warn!("⚠️ Cancel of {key} not saved: {e}");
            return Err(e);
        }
        self.core.publish(vec![event]).await;
        tracing::info!("🚫 Cancelled {key}: {reason}");
        Ok(true)
    }

    /// Current entry of a line.
    pub async fn entry(&self, key: &LedgerKey) -> Option<LeadLedgerEntry> {
        self.core.state.lock().await.ledger.get(key).cloned()
    }

    /// Current entries of every line, sorted by key.
    pub async fn entries(&self) -> Vec<LeadLedgerEntry> {
        let state = self.core.state.lock().await;
        let mut entries: Vec<_> = state.ledger.entries().cloned().collect();
        entries.sort_by_key(|e| e.key());
        entries
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.core.state.lock().await;
        EngineStats {
            lanes: state.lanes.stats(),
            states: state.ledger.counts_by_state(),
            halted: state.ledger.is_halted(),
            dirty_entries: state.ledger.dirty_count(),
            unsettled_orphans: state.orphans.len(),
            last_triggered: state.last_triggered.clone(),
        }
    }

    /// Run the tick and sweep loops until `shutdown` flips to true, then
    /// drain the dispatcher.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            "⏰ Outreach engine started (tick every {}s, sweep every {}s)",
            self.tick_interval.as_secs(),
            self.sweep_interval.as_secs()
        );
        let sweeps = tokio::spawn(spawn_sweeper(self.clone(), shutdown.clone()));

        let mut shutdown = shutdown;
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!("⚠️ Tick failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = sweeps.await {
            tracing::warn!("⚠️ Sweep loop ended abnormally: {e}");
        }
        self.shutdown().await
    }

    /// Stop dispatching and wait for running attempts to record outcomes.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("🛑 Outreach engine stopping, draining in-flight attempts");
        let drained = self.dispatcher.shutdown(self.shutdown_grace).await;

        let mut state = self.core.state.lock().await;
        let now = self.core.clock.now();
        if !state.ledger.flush(now).await {
            tracing::error!(
                "❌ {} ledger entries could not be written before shutdown",
                state.ledger.dirty_count()
            );
        }
        let unsettled = state
            .ledger
            .entries()
            .filter(|e| e.state == LeadOutreachState::InFlight)
            .count();
        if unsettled > 0 {
            tracing::warn!("⚠️ {unsettled} attempts still in flight; they will be settled as errors on restart");
        }
        drained
    }
}

/// Periodic reengagement sweep. A sweep that opens lines is followed by an
/// immediate tick so they enter the dispatcher without waiting.
async fn spawn_sweeper(engine: Arc<OutreachEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(engine.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.sweep().await {
                    Ok(report) if report.entries_created > 0 => {
                        if let Err(e) = engine.tick().await {
                            tracing::warn!("⚠️ Post-sweep tick failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("⚠️ Reengagement sweep failed: {e}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

impl EngineCore {
    /// Log newly seen rules and newly rejected ones, once each, and pick up
    /// reengagement trigger times the rule store already knows.
    fn note_rules(&self, state: &mut EngineState, snapshot: &RuleSnapshot) {
        for rule in &snapshot.rules {
            if state.known_rules.insert(rule.id().to_string()) {
                let missing = rule.policy().backoff.missing_outcomes();
                if missing.is_empty() {
                    tracing::info!("📋 Rule '{}' ({}) loaded", rule.name(), rule.id());
                } else {
                    let names: Vec<&str> = missing.iter().map(|o| o.as_str()).collect();
                    tracing::warn!(
                        "⚠️ Rule '{}' has no backoff for [{}]; those outcomes end the line",
                        rule.id(),
                        names.join(", ")
                    );
                }
            }
        }
        for rule in snapshot.reengagement() {
            if let Some(stored) = rule.last_triggered_at {
                let seen = state.last_triggered.entry(rule.id.clone()).or_insert(stored);
                *seen = (*seen).max(stored);
            }
        }
        state.reported_invalid.retain(|id| snapshot.skipped.iter().any(|s| &s.rule_id == id));
        for skipped in &snapshot.skipped {
            if state.reported_invalid.insert(skipped.rule_id.clone()) {
                tracing::warn!("⚠️ Rule '{}' skipped: {}", skipped.rule_id, skipped.reason);
            }
        }
    }

    /// Hand transition events to the sink on the blocking pool, in order.
    async fn publish(&self, events: Vec<TransitionEvent>) {
        if events.is_empty() {
            return;
        }
        let sink = self.events.clone();
        let delivered = tokio::task::spawn_blocking(move || {
            for event in &events {
                sink.emit(event);
            }
        })
        .await;
        if let Err(e) = delivered {
            tracing::warn!("⚠️ Transition events lost: {e}");
        }
    }

    /// Settle lines a previous run left in flight as `error` outcomes.
    async fn reconcile_orphans(
        &self,
        state: &mut EngineState,
        snapshot: &RuleSnapshot,
        now: DateTime<Utc>,
        events: &mut Vec<TransitionEvent>,
    ) -> usize {
        let ready: Vec<(LedgerKey, RuleRef)> = state
            .orphans
            .iter()
            .filter_map(|k| snapshot.get(&k.rule_id).map(|r| (k.clone(), r.clone())))
            .collect();
        let mut settled = 0;
        for (key, rule) in ready {
            state.orphans.remove(&key);
            let Some(entry) = state.ledger.get_mut(&key) else {
                continue;
            };
            let Some(transition) = entry.apply_outcome(AttemptOutcome::Error, rule.policy(), now) else {
                continue;
            };
            events.push(TransitionEvent::from_transition(entry, &transition));
            if let Err(e) = state.ledger.persist(&key, now).await {
                tracing::warn!("⚠️ Settled {key} kept in memory: {e}");
            }
            tracing::info!("♻️ Interrupted attempt {key} settled as error → {}", transition.to);
            settled += 1;
        }
        settled
    }

    /// Mark one line in flight and take its lane slot. The caller has
    /// checked the lane has room. A failed write rolls the line back.
    async fn start_attempt(
        &self,
        state: &mut EngineState,
        rule: &RuleRef,
        key: &LedgerKey,
        now: DateTime<Utc>,
    ) -> Result<Option<(DispatchJob, TransitionEvent)>> {
        let Some(entry) = state.ledger.get_mut(key) else {
            return Ok(None);
        };
        let before = entry.clone();
        let Some(transition) = entry.mark_in_flight(now) else {
            return Ok(None);
        };
        let event = TransitionEvent::from_transition(entry, &transition);
        let job = DispatchJob {
            key: key.clone(),
            entry_id: entry.id.clone(),
            rule: rule.clone(),
            message: entry.message.clone(),
        };

        if let Err(e) = state.ledger.persist(key, now).await {
            state.ledger.restore(before);
            return Err(e);
        }
        if !state.lanes.acquire(rule.id(), rule.policy(), now) {
            tracing::warn!("⚠️ Lane for '{}' filled during dispatch of {key}", rule.id());
        }
        tracing::debug!("🚀 Dispatching {key} (attempt {})", before.attempts_total + 1);
        Ok(Some((job, event)))
    }
}

#[async_trait]
impl OutcomeRecorder for EngineCore {
    async fn record(&self, job: &DispatchJob, outcome: AttemptOutcome) {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.lanes.release(job.rule.id());

        let Some(entry) = state.ledger.get_mut(&job.key) else {
            tracing::warn!("⚠️ Outcome {outcome} for unknown line {}", job.key);
            return;
        };
        if entry.id != job.entry_id {
            tracing::warn!("⚠️ Outcome {outcome} for superseded entry of {} dropped", job.key);
            return;
        }
        let transition = entry.apply_outcome(outcome, job.rule.policy(), now);
        let event = transition.as_ref().map(|t| TransitionEvent::from_transition(entry, t));
        if let Err(e) = state.ledger.persist(&job.key, now).await {
            tracing::error!("❌ Outcome for {} kept in memory until the store recovers: {e}", job.key);
        }
        self.publish(event.into_iter().collect()).await;
    }
}
