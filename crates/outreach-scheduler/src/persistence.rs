//! Ledger persistence: SQLite-backed store for ledger entries and transition
//! events. Survives restarts so `Retrying` schedules resume where they left off.

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{Channel, MessageSpec};
use rusqlite::OptionalExtension;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::events::{EventSink, TransitionEvent};
use crate::ledger::{LeadLedgerEntry, LeadOutreachState, LedgerKey};
use crate::outcome::AttemptOutcome;

/// Durable storage for ledger entries.
///
/// `save_entry` must reject a write whose `version` is not newer than the
/// stored one with [`OutreachError::LedgerConflict`].
pub trait LedgerStore: Send + Sync {
    /// Latest entry for a line.
    fn load_entry(&self, key: &LedgerKey) -> Result<Option<LeadLedgerEntry>>;

    /// Latest entry of every line.
    fn load_current(&self) -> Result<Vec<LeadLedgerEntry>>;

    /// Every entry of a lead, oldest first, including superseded ones.
    fn load_history(&self, lead_id: &str) -> Result<Vec<LeadLedgerEntry>>;

    fn save_entry(&self, entry: &LeadLedgerEntry) -> Result<()>;

    fn stored_version(&self, entry_id: &str) -> Result<Option<u64>>;

    /// Liveness check used to lift a halt.
    fn ping(&self) -> Result<()>;
}

/// SQLite-backed ledger store.
pub struct SqliteLedgerStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteLedgerStore {
    /// Open or create the ledger database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| OutreachError::LedgerUnavailable(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| OutreachError::LedgerUnavailable(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_millis(500))
            .map_err(|e| OutreachError::Ledger(format!("busy_timeout: {e}")))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|e| OutreachError::LedgerUnavailable(format!("connection lock poisoned: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- One row per scheduling line generation; never deleted
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts_total INTEGER NOT NULL DEFAULT 0,
                attempts_by_outcome TEXT NOT NULL DEFAULT '{}',  -- JSON: {outcome: count}
                last_outcome TEXT,
                last_attempt_at TEXT,
                next_eligible_at TEXT NOT NULL,
                message TEXT,                                   -- JSON: {template_ref, tone}
                cancel_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_line
                ON ledger_entries (lead_id, rule_id, channel, created_at);

            -- Transition audit trail
            CREATE TABLE IF NOT EXISTS ledger_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                from_state TEXT,
                to_state TEXT NOT NULL,
                outcome TEXT,
                at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| OutreachError::Ledger(format!("Migration: {e}")))?;
        Ok(())
    }

    const COLUMNS: &'static str = "id, lead_id, rule_id, channel, state, attempts_total, attempts_by_outcome, \
         last_outcome, last_attempt_at, next_eligible_at, message, cancel_reason, created_at, updated_at, version";

    fn query_entries(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<LeadLedgerEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(unavailable)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(RawEntry {
                    id: row.get(0)?,
                    lead_id: row.get(1)?,
                    rule_id: row.get(2)?,
                    channel: row.get(3)?,
                    state: row.get(4)?,
                    attempts_total: row.get(5)?,
                    attempts_by_outcome: row.get(6)?,
                    last_outcome: row.get(7)?,
                    last_attempt_at: row.get(8)?,
                    next_eligible_at: row.get(9)?,
                    message: row.get(10)?,
                    cancel_reason: row.get(11)?,
                    created_at: row.get(12)?,
                    updated_at: row.get(13)?,
                    version: row.get(14)?,
                })
            })
            .map_err(unavailable)?;

        let mut entries = Vec::new();
        for raw in rows {
            let raw = raw.map_err(unavailable)?;
            match raw.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable ledger row: {e}"),
            }
        }
        Ok(entries)
    }

    /// Recent transition events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<TransitionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT lead_id, rule_id, channel, from_state, to_state, outcome, at
                 FROM ledger_events ORDER BY id DESC LIMIT ?1",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(unavailable)?;

        let mut events = Vec::new();
        for row in rows {
            let (lead_id, rule_id, channel, from, to, outcome, at) = row.map_err(unavailable)?;
            let (Some(channel), Some(to_state)) = (Channel::parse(&channel), LeadOutreachState::parse(&to)) else {
                continue;
            };
            events.push(TransitionEvent {
                lead_id,
                rule_id,
                channel,
                from_state: from.as_deref().and_then(LeadOutreachState::parse),
                to_state,
                outcome: outcome.as_deref().map(crate::outcome::classify),
                at: parse_ts(&at)?,
            });
        }
        Ok(events)
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn load_entry(&self, key: &LedgerKey) -> Result<Option<LeadLedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE lead_id = ?1 AND rule_id = ?2 AND channel = ?3
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            Self::COLUMNS
        );
        let channel = key.channel.as_str();
        Ok(self
            .query_entries(&sql, &[&key.lead_id, &key.rule_id, &channel])?
            .into_iter()
            .next())
    }

    fn load_current(&self) -> Result<Vec<LeadLedgerEntry>> {
        let sql = format!("SELECT {} FROM ledger_entries ORDER BY created_at, rowid", Self::COLUMNS);
        let mut latest: HashMap<LedgerKey, LeadLedgerEntry> = HashMap::new();
        for entry in self.query_entries(&sql, &[])? {
            latest.insert(entry.key(), entry);
        }
        let mut entries: Vec<_> = latest.into_values().collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(entries)
    }

    fn load_history(&self, lead_id: &str) -> Result<Vec<LeadLedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE lead_id = ?1 ORDER BY created_at, rowid",
            Self::COLUMNS
        );
        self.query_entries(&sql, &[&lead_id])
    }

    fn save_entry(&self, entry: &LeadLedgerEntry) -> Result<()> {
        let by_outcome = serde_json::to_string(&entry.attempts_by_outcome)?;
        let message = entry.message.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "INSERT INTO ledger_entries
                 (id, lead_id, rule_id, channel, state, attempts_total, attempts_by_outcome,
                  last_outcome, last_attempt_at, next_eligible_at, message, cancel_reason,
                  created_at, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    attempts_total = excluded.attempts_total,
                    attempts_by_outcome = excluded.attempts_by_outcome,
                    last_outcome = excluded.last_outcome,
                    last_attempt_at = excluded.last_attempt_at,
                    next_eligible_at = excluded.next_eligible_at,
                    message = excluded.message,
                    cancel_reason = excluded.cancel_reason,
                    updated_at = excluded.updated_at,
                    version = excluded.version
                 WHERE ledger_entries.version < excluded.version",
                rusqlite::params![
                    entry.id,
                    entry.lead_id,
                    entry.rule_id,
                    entry.channel.as_str(),
                    entry.state.as_str(),
                    entry.attempts_total,
                    by_outcome,
                    entry.last_outcome.map(|o| o.as_str()),
                    entry.last_attempt_at.map(|t| t.to_rfc3339()),
                    entry.next_eligible_at.to_rfc3339(),
                    message,
                    entry.cancel_reason,
                    entry.created_at.to_rfc3339(),
                    entry.updated_at.to_rfc3339(),
                    entry.version as i64,
                ],
            )
            .map_err(write_error)?;

        if changed == 0 {
            return Err(OutreachError::LedgerConflict {
                entry_id: entry.id.clone(),
            });
        }
        Ok(())
    }

    fn stored_version(&self, entry_id: &str) -> Result<Option<u64>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT version FROM ledger_entries WHERE id = ?1",
            [entry_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|v| v.map(|v| v.max(0) as u64))
        .map_err(unavailable)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(unavailable)
    }
}

impl EventSink for SqliteLedgerStore {
    fn emit(&self, event: &TransitionEvent) {
        let result = self.conn().and_then(|conn| {
            conn.execute(
                "INSERT INTO ledger_events (lead_id, rule_id, channel, from_state, to_state, outcome, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    event.lead_id,
                    event.rule_id,
                    event.channel.as_str(),
                    event.from_state.map(|s| s.as_str()),
                    event.to_state.as_str(),
                    event.outcome.map(|o| o.as_str()),
                    event.at.to_rfc3339(),
                ],
            )
            .map_err(unavailable)
        });
        if let Err(e) = result {
            tracing::warn!("⚠️ Failed to record transition event: {e}");
        }
    }
}

/// Row as stored, before parsing.
struct RawEntry {
    id: String,
    lead_id: String,
    rule_id: String,
    channel: String,
    state: String,
    attempts_total: u32,
    attempts_by_outcome: String,
    last_outcome: Option<String>,
    last_attempt_at: Option<String>,
    next_eligible_at: String,
    message: Option<String>,
    cancel_reason: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl RawEntry {
    fn into_entry(self) -> Result<LeadLedgerEntry> {
        let channel = Channel::parse(&self.channel)
            .ok_or_else(|| OutreachError::Ledger(format!("unknown channel '{}'", self.channel)))?;
        let state = LeadOutreachState::parse(&self.state)
            .ok_or_else(|| OutreachError::Ledger(format!("unknown state '{}'", self.state)))?;
        let attempts_by_outcome: BTreeMap<AttemptOutcome, u32> =
            serde_json::from_str(&self.attempts_by_outcome)?;
        let message: Option<MessageSpec> = self.message.as_deref().map(serde_json::from_str).transpose()?;
        Ok(LeadLedgerEntry {
            id: self.id,
            lead_id: self.lead_id,
            rule_id: self.rule_id,
            channel,
            attempts_total: self.attempts_total,
            attempts_by_outcome,
            last_outcome: self.last_outcome.as_deref().map(crate::outcome::classify),
            last_attempt_at: self.last_attempt_at.as_deref().map(parse_ts).transpose()?,
            next_eligible_at: parse_ts(&self.next_eligible_at)?,
            state,
            message,
            cancel_reason: self.cancel_reason,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            version: self.version.max(0) as u64,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| OutreachError::Ledger(format!("bad timestamp '{s}': {e}")))
}

fn unavailable(e: rusqlite::Error) -> OutreachError {
    OutreachError::LedgerUnavailable(e.to_string())
}

/// Busy/locked databases are transient and retried like version conflicts.
fn write_error(e: rusqlite::Error) -> OutreachError {
    match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            OutreachError::LedgerConflict {
                entry_id: String::from("<locked>"),
            }
        }
        _ => unavailable(e),
    }
}

/// Non-durable store for tests and throwaway hosts. Can simulate an outage.
#[derive(Default)]
pub struct MemoryLedgerStore {
    rows: Mutex<Vec<LeadLedgerEntry>>,
    unavailable: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, Vec<LeadLedgerEntry>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OutreachError::LedgerUnavailable("memory store offline".into()));
        }
        self.rows
            .lock()
            .map_err(|e| OutreachError::LedgerUnavailable(e.to_string()))
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load_entry(&self, key: &LedgerKey) -> Result<Option<LeadLedgerEntry>> {
        Ok(self.rows()?.iter().rev().find(|e| e.key() == *key).cloned())
    }

    fn load_current(&self) -> Result<Vec<LeadLedgerEntry>> {
        let mut latest: HashMap<LedgerKey, LeadLedgerEntry> = HashMap::new();
        for entry in self.rows()?.iter() {
            latest.insert(entry.key(), entry.clone());
        }
        let mut entries: Vec<_> = latest.into_values().collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(entries)
    }

    fn load_history(&self, lead_id: &str) -> Result<Vec<LeadLedgerEntry>> {
        Ok(self.rows()?.iter().filter(|e| e.lead_id == lead_id).cloned().collect())
    }

    fn save_entry(&self, entry: &LeadLedgerEntry) -> Result<()> {
        let mut rows = self.rows()?;
        match rows.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) if existing.version >= entry.version => Err(OutreachError::LedgerConflict {
                entry_id: entry.id.clone(),
            }),
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => {
                rows.push(entry.clone());
                Ok(())
            }
        }
    }

    fn stored_version(&self, entry_id: &str) -> Result<Option<u64>> {
        Ok(self.rows()?.iter().find(|e| e.id == entry_id).map(|e| e.version))
    }

    fn ping(&self) -> Result<()> {
        self.rows().map(|_| ())
    }
}
