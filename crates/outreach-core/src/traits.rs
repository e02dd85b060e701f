//! Collaborator traits the engine consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{AttemptReport, AttemptRequest, Channel, LeadProfile, SegmentAttributes};

/// Performs the actual send/call for one channel.
///
/// Implementations return the provider's raw result string; the engine
/// classifies it. Transport failures should be returned as `Err`, the
/// engine treats them like an `error` outcome.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn attempt(&self, request: &AttemptRequest) -> Result<AttemptReport>;
}

/// Read-only access to lead attributes.
#[async_trait]
pub trait LeadSource: Send + Sync {
    /// Leads targeted by a dialing campaign.
    async fn campaign_leads(&self, rule_id: &str) -> Result<Vec<LeadProfile>>;

    /// Every lead the reengagement sweeper may consider.
    async fn list_leads(&self) -> Result<Vec<LeadProfile>>;

    async fn get_lead(&self, lead_id: &str) -> Result<Option<LeadProfile>>;

    async fn last_activity(&self, lead_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get_lead(lead_id).await?.map(|l| l.last_activity_at))
    }

    async fn segment_attributes(&self, lead_id: &str) -> Result<Option<SegmentAttributes>> {
        Ok(self.get_lead(lead_id).await?.map(|l| l.attributes))
    }
}

/// Time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
