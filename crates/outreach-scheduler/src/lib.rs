//! # Outreach Scheduler
//!
//! Decides, for every lead, when the next outbound contact attempt may
//! happen: dialing campaigns with retry backoff, and inactivity-triggered
//! reengagement across messaging channels.
//!
//! ## Design Principles
//! - One ledger line per (lead, rule, channel), persisted on every change
//! - Rules are read-only snapshots, reloaded every tick
//! - Per-rule in-flight caps, enforced atomically with dispatch
//! - Unknown provider results and store outages fail closed
//!
//! ## Architecture
//! ```text
//! Tick (tokio interval)
//!   ├── RuleStore → RuleSnapshot (invalid rules skipped)
//!   ├── LeadSource → Pending lines for dialing campaigns
//!   ├── Eligibility filter (windows, backoff, budget, lanes)
//!   └── Dispatcher (bounded worker pool)
//!         ├── Voice (telephony API)
//!         ├── WhatsApp / SMS / Mail
//!         └── outcome → classify → LeadLedger state machine
//!
//! Sweep (slower interval)
//!   └── inactive leads × ReengagementRule → new lines → next tick
//! ```

pub mod backoff;
pub mod dispatch;
pub mod eligibility;
pub mod engine;
pub mod events;
pub mod lanes;
pub mod ledger;
pub mod outcome;
pub mod persistence;
pub mod rules;
pub mod store;
pub mod sweeper;

pub use backoff::{BackoffEntry, BackoffTable};
pub use dispatch::{AdapterSet, DispatchJob, Dispatcher, OutcomeRecorder};
pub use engine::{EngineBuilder, EngineStats, OutreachEngine, SweepReport, TickReport};
pub use events::{EventLog, EventSink, FanoutSink, TracingSink, TransitionEvent};
pub use lanes::{LaneStats, RuleLanes};
pub use ledger::{LeadLedger, LeadLedgerEntry, LeadOutreachState, LedgerKey};
pub use outcome::{AttemptOutcome, classify};
pub use persistence::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore};
pub use rules::{ActiveWindow, DailyWindow, DeliveryPolicy, DialingRule, ReengagementRule, RuleRef, Segmentation};
pub use store::{FileLeadSource, FileRuleStore, RuleSnapshot, RuleStore, RulesFile};
