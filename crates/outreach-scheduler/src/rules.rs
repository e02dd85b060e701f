//! Rule definitions: the read-only policies the engine schedules against.
//!
//! Two shapes share one [`DeliveryPolicy`]: dialing rules (voice campaigns
//! over a fixed lead list) and reengagement rules (inactivity-triggered,
//! multi-channel). The engine only ever reads them.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{Channel, MessageSpec, SegmentAttributes};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backoff::{BackoffTable, MAX_INTERVAL_SECS, capped_seconds};

/// Calendar range a rule is live. Both ends inclusive; no end means open-ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl ActiveWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date && self.end_date.is_none_or(|end| date <= end)
    }
}

impl Default for ActiveWindow {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::MIN,
            end_date: None,
        }
    }
}

/// Time of day dispatch is permitted. Both ends inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyWindow {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl DailyWindow {
    pub fn all_day() -> Self {
        Self {
            start_time: NaiveTime::MIN,
            end_time: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start_time && time <= self.end_time
    }
}

impl Default for DailyWindow {
    fn default() -> Self {
        Self::all_day()
    }
}

/// Widest accepted `utc_offset_minutes`, either side of UTC.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 23 * 60 + 59;

fn default_simultaneous() -> u32 { 1 }
fn default_max_attempts() -> u32 { 3 }

/// Scheduling knobs shared by both rule shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    /// Max attempts in flight under the rule at once.
    #[serde(default = "default_simultaneous")]
    pub simultaneous_channels: u32,
    #[serde(default)]
    pub active_window: ActiveWindow,
    #[serde(default)]
    pub daily_window: DailyWindow,
    /// Offset of the rule's local time from UTC, for both windows.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Hard cap across all outcome types.
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_lead: u32,
    /// Minimum gap between two dispatch starts under the rule.
    #[serde(default)]
    pub min_spacing_secs: u64,
    #[serde(default)]
    pub backoff: BackoffTable,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            simultaneous_channels: default_simultaneous(),
            active_window: ActiveWindow::default(),
            daily_window: DailyWindow::default(),
            utc_offset_minutes: 0,
            max_attempts_per_lead: default_max_attempts(),
            min_spacing_secs: 0,
            backoff: BackoffTable::default(),
        }
    }
}

impl DeliveryPolicy {
    pub fn min_spacing(&self) -> Duration {
        capped_seconds(self.min_spacing_secs)
    }

    /// `now` expressed in the rule's local time.
    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveDateTime {
        match self.utc_offset_minutes.checked_mul(60).and_then(FixedOffset::east_opt) {
            Some(offset) => now.with_timezone(&offset).naive_local(),
            None => now.naive_utc(),
        }
    }

    /// Whether `now` falls inside both the active and the daily window.
    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        let local = self.local_time(now);
        self.active_window.contains(local.date()) && self.daily_window.contains(local.time())
    }

    pub fn validate(&self, rule_id: &str) -> Result<()> {
        if self.simultaneous_channels == 0 {
            return Err(OutreachError::invalid_rule(rule_id, "simultaneous_channels must be > 0"));
        }
        if self.max_attempts_per_lead == 0 {
            return Err(OutreachError::invalid_rule(rule_id, "max_attempts_per_lead must be > 0"));
        }
        if self.daily_window.end_time < self.daily_window.start_time {
            return Err(OutreachError::invalid_rule(
                rule_id,
                format!(
                    "daily window ends ({}) before it starts ({})",
                    self.daily_window.end_time, self.daily_window.start_time
                ),
            ));
        }
        if let Some(end) = self.active_window.end_date
            && end < self.active_window.start_date
        {
            return Err(OutreachError::invalid_rule(rule_id, "active window ends before it starts"));
        }
        if !(-MAX_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES).contains(&self.utc_offset_minutes) {
            return Err(OutreachError::invalid_rule(
                rule_id,
                format!("utc_offset_minutes must be within ±{MAX_UTC_OFFSET_MINUTES}"),
            ));
        }
        if self.min_spacing_secs > MAX_INTERVAL_SECS {
            return Err(OutreachError::invalid_rule(
                rule_id,
                format!("min_spacing_secs exceeds {MAX_INTERVAL_SECS}"),
            ));
        }
        if let Some(problem) = self.backoff.problems().into_iter().next() {
            return Err(OutreachError::invalid_rule(rule_id, problem));
        }
        Ok(())
    }
}

/// A voice campaign policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialingRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub policy: DeliveryPolicy,
}

impl DialingRule {
    pub fn new(id: &str, name: &str, policy: DeliveryPolicy) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            policy,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(OutreachError::invalid_rule(&self.name, "rule id is empty"));
        }
        self.policy.validate(&self.id)
    }
}

/// Course/location/source filters. An empty list accepts anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segmentation {
    #[serde(default)]
    pub courses: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Segmentation {
    pub fn matches(&self, attrs: &SegmentAttributes) -> bool {
        filter_matches(&self.courses, attrs.course.as_deref())
            && filter_matches(&self.locations, attrs.location.as_deref())
            && filter_matches(&self.sources, attrs.source.as_deref())
    }
}

fn filter_matches(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match value {
        Some(v) => allowed.iter().any(|a| a.eq_ignore_ascii_case(v.trim())),
        None => false,
    }
}

/// An inactivity-triggered multi-channel policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReengagementRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub paused: bool,
    /// Trigger threshold, also the re-trigger cool-down.
    pub inactivity_days: u32,
    pub channels: BTreeSet<Channel>,
    pub message_template_ref: String,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub segmentation: Option<Segmentation>,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub policy: DeliveryPolicy,
}

impl ReengagementRule {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.paused
    }

    pub fn inactivity(&self) -> Duration {
        Duration::days(self.inactivity_days as i64)
    }

    pub fn message(&self) -> MessageSpec {
        MessageSpec {
            template_ref: self.message_template_ref.clone(),
            tone: self.tone.clone(),
        }
    }

    pub fn segment_matches(&self, attrs: &SegmentAttributes) -> bool {
        self.segmentation.as_ref().is_none_or(|s| s.matches(attrs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(OutreachError::invalid_rule(&self.name, "rule id is empty"));
        }
        if self.inactivity_days == 0 {
            return Err(OutreachError::invalid_rule(&self.id, "inactivity_days must be > 0"));
        }
        if u64::from(self.inactivity_days) * 24 * 60 * 60 > MAX_INTERVAL_SECS {
            return Err(OutreachError::invalid_rule(&self.id, "inactivity_days is too large"));
        }
        if self.channels.is_empty() {
            return Err(OutreachError::invalid_rule(&self.id, "no channels configured"));
        }
        self.policy.validate(&self.id)
    }
}

/// Which shape a rule has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Dialing,
    Reengagement,
}

/// A rule snapshot of either shape, cheap to clone into dispatch jobs.
#[derive(Debug, Clone)]
pub enum RuleRef {
    Dialing(Arc<DialingRule>),
    Reengagement(Arc<ReengagementRule>),
}

impl RuleRef {
    pub fn id(&self) -> &str {
        match self {
            RuleRef::Dialing(r) => &r.id,
            RuleRef::Reengagement(r) => &r.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RuleRef::Dialing(r) => &r.name,
            RuleRef::Reengagement(r) => &r.name,
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            RuleRef::Dialing(_) => RuleKind::Dialing,
            RuleRef::Reengagement(_) => RuleKind::Reengagement,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            RuleRef::Dialing(r) => r.enabled,
            RuleRef::Reengagement(r) => r.is_active(),
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        match self {
            RuleRef::Dialing(r) => &r.policy,
            RuleRef::Reengagement(r) => &r.policy,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RuleRef::Dialing(r) => r.validate(),
            RuleRef::Reengagement(r) => r.validate(),
        }
    }
}
