//! Dispatcher: bounded worker pool that performs attempts through channel
//! adapters and reports classified outcomes back to the ledger.
//!
//! Jobs arrive already marked `InFlight` with a lane slot taken, so the
//! pool itself only bounds total concurrency (`max_workers`); per-rule caps
//! are enforced before a job is ever submitted.

use async_trait::async_trait;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{ChannelAdapter, LeadSource};
use outreach_core::types::{AttemptReport, AttemptRequest, Channel, LeadContact, MessageSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::ledger::LedgerKey;
use crate::outcome::{AttemptOutcome, classify};
use crate::rules::RuleRef;

/// One attempt to perform.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub key: LedgerKey,
    /// Entry generation the attempt belongs to.
    pub entry_id: String,
    /// Rule snapshot taken at dispatch; the outcome is judged against it
    /// even if the rule is disabled or edited meanwhile.
    pub rule: RuleRef,
    pub message: Option<MessageSpec>,
}

/// Receives the single outcome of each dispatched job.
#[async_trait]
pub trait OutcomeRecorder: Send + Sync {
    async fn record(&self, job: &DispatchJob, outcome: AttemptOutcome);
}

/// Channel adapters by channel.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let channel = adapter.channel();
        if self.adapters.insert(channel, adapter).is_some() {
            tracing::warn!("⚠️ Replacing adapter for channel {channel}");
        }
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.adapters.keys().copied().collect();
        channels.sort();
        channels
    }
}

impl FromIterator<Arc<dyn ChannelAdapter>> for AdapterSet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn ChannelAdapter>>>(iter: I) -> Self {
        let mut set = AdapterSet::new();
        for adapter in iter {
            set.register(adapter);
        }
        set
    }
}

/// Handle to the running dispatcher.
pub struct Dispatcher {
    tx: Mutex<Option<mpsc::UnboundedSender<DispatchJob>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the dispatcher loop on the current tokio runtime.
    pub fn spawn(
        adapters: AdapterSet,
        leads: Arc<dyn LeadSource>,
        recorder: Arc<dyn OutcomeRecorder>,
        max_workers: usize,
        attempt_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            adapters,
            leads,
            recorder,
            attempt_timeout,
        };
        let task = tokio::spawn(run_pool(rx, Arc::new(worker), max_workers.max(1)));
        tracing::info!(
            "🚚 Dispatcher started ({} workers, {}s attempt timeout)",
            max_workers.max(1),
            attempt_timeout.as_secs_f32()
        );
        Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a job. Never waits for a worker.
    pub async fn submit(&self, job: DispatchJob) -> std::result::Result<(), DispatchJob> {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Stop accepting jobs and wait up to `grace` for queued and running
    /// attempts to record their outcomes.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.tx.lock().await.take();
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => {
                tracing::info!("🛑 Dispatcher drained");
                Ok(())
            }
            Ok(Err(e)) => Err(OutreachError::Channel(format!("dispatcher task failed: {e}"))),
            Err(_) => {
                abort.abort();
                tracing::warn!(
                    "⚠️ Dispatcher drain exceeded {}s; unfinished attempts stay in flight until restart",
                    grace.as_secs()
                );
                Err(OutreachError::Channel("shutdown grace period exceeded".into()))
            }
        }
    }
}

struct Worker {
    adapters: AdapterSet,
    leads: Arc<dyn LeadSource>,
    recorder: Arc<dyn OutcomeRecorder>,
    attempt_timeout: Duration,
}

async fn run_pool(mut rx: mpsc::UnboundedReceiver<DispatchJob>, worker: Arc<Worker>, max_workers: usize) {
    let permits = Arc::new(Semaphore::new(max_workers));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            job = rx.recv() => {
                let Some(job) = job else { break };
                let Ok(permit) = permits.clone().acquire_owned().await else { break };
                let worker = worker.clone();
                running.spawn(async move {
                    let _permit = permit;
                    worker.execute(job).await;
                });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("❌ Dispatch worker panicked: {e}");
                }
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            tracing::error!("❌ Dispatch worker panicked: {e}");
        }
    }
}

impl Worker {
    async fn execute(&self, job: DispatchJob) {
        let started = Instant::now();
        let outcome = match self.attempt(&job).await {
            Ok(report) => {
                let outcome = classify(&report.provider_result);
                tracing::info!(
                    "📞 {} via {}: '{}' → {} ({:.1}s)",
                    job.key,
                    job.key.channel,
                    report.provider_result,
                    outcome,
                    report.duration.unwrap_or_else(|| started.elapsed()).as_secs_f32()
                );
                outcome
            }
            Err(e) => {
                tracing::warn!("⚠️ Attempt {} failed: {e}", job.key);
                AttemptOutcome::Error
            }
        };
        self.recorder.record(&job, outcome).await;
    }

    async fn attempt(&self, job: &DispatchJob) -> Result<AttemptReport> {
        let adapter = self
            .adapters
            .get(job.key.channel)
            .ok_or_else(|| OutreachError::Channel(format!("no adapter for channel {}", job.key.channel)))?;

        let contact = match self.leads.get_lead(&job.key.lead_id).await {
            Ok(Some(lead)) => lead.contact,
            Ok(None) => {
                tracing::warn!("⚠️ Lead {} not found, attempting without contact data", job.key.lead_id);
                LeadContact::default()
            }
            Err(e) => return Err(e),
        };

        let request = AttemptRequest {
            lead_id: job.key.lead_id.clone(),
            rule_id: job.key.rule_id.clone(),
            channel: job.key.channel,
            contact,
            message: job.message.clone(),
        };

        tokio::time::timeout(self.attempt_timeout, adapter.attempt(&request))
            .await
            .map_err(|_| {
                OutreachError::Provider(format!(
                    "{} attempt timed out after {}s",
                    job.key.channel,
                    self.attempt_timeout.as_secs_f32()
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{DeliveryPolicy, DialingRule};
    use chrono::{DateTime, Utc};
    use outreach_core::types::LeadProfile;
    use std::sync::Mutex as StdMutex;

    struct FixedAdapter {
        channel: Channel,
        result: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl ChannelAdapter for FixedAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn attempt(&self, request: &AttemptRequest) -> Result<AttemptReport> {
            tokio::time::sleep(self.delay).await;
            if request.contact.phone.is_none() {
                return Ok(AttemptReport::new("invalid-number"));
            }
            Ok(AttemptReport::new(self.result))
        }
    }

    struct NoLeads;

    #[async_trait]
    impl LeadSource for NoLeads {
        async fn campaign_leads(&self, _rule_id: &str) -> Result<Vec<LeadProfile>> {
            Ok(Vec::new())
        }
        async fn list_leads(&self) -> Result<Vec<LeadProfile>> {
            Ok(Vec::new())
        }
        async fn get_lead(&self, lead_id: &str) -> Result<Option<LeadProfile>> {
            Ok(Some(LeadProfile {
                id: lead_id.to_string(),
                last_activity_at: DateTime::<Utc>::UNIX_EPOCH,
                attributes: Default::default(),
                contact: LeadContact {
                    phone: Some("+15550100".into()),
                    ..Default::default()
                },
            }))
        }
    }

    #[derive(Default)]
    struct Collect(StdMutex<Vec<(String, AttemptOutcome)>>);

    #[async_trait]
    impl OutcomeRecorder for Collect {
        async fn record(&self, job: &DispatchJob, outcome: AttemptOutcome) {
            self.0.lock().unwrap().push((job.key.lead_id.clone(), outcome));
        }
    }

    fn job(lead: &str, channel: Channel) -> DispatchJob {
        DispatchJob {
            key: LedgerKey::new(lead, "r", channel),
            entry_id: format!("entry-{lead}"),
            rule: RuleRef::Dialing(Arc::new(DialingRule::new("r", "R", DeliveryPolicy::default()))),
            message: None,
        }
    }

    #[tokio::test]
    async fn test_outcomes_recorded_and_drained() {
        let adapters = AdapterSet::new().with(Arc::new(FixedAdapter {
            channel: Channel::Voice,
            result: "busy",
            delay: Duration::from_millis(5),
        }));
        let recorder = Arc::new(Collect::default());
        let dispatcher = Dispatcher::spawn(adapters, Arc::new(NoLeads), recorder.clone(), 2, Duration::from_secs(5));
        for lead in ["a", "b", "c"] {
            dispatcher.submit(job(lead, Channel::Voice)).await.unwrap();
        }
        dispatcher.shutdown(Duration::from_secs(5)).await.unwrap();

        let mut recorded = recorder.0.lock().unwrap().clone();
        recorded.sort();
        assert_eq!(recorded.len(), 3);
        assert!(recorded.iter().all(|(_, o)| *o == AttemptOutcome::Busy));
        assert!(dispatcher.submit(job("d", Channel::Voice)).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_and_missing_adapter_are_errors() {
        let adapters = AdapterSet::new().with(Arc::new(FixedAdapter {
            channel: Channel::Voice,
            result: "answered",
            delay: Duration::from_millis(500),
        }));
        let recorder = Arc::new(Collect::default());
        let dispatcher =
            Dispatcher::spawn(adapters, Arc::new(NoLeads), recorder.clone(), 4, Duration::from_millis(20));
        dispatcher.submit(job("slow", Channel::Voice)).await.unwrap();
        dispatcher.submit(job("nosms", Channel::Sms)).await.unwrap();
        dispatcher.shutdown(Duration::from_secs(5)).await.unwrap();

        let recorded = recorder.0.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|(_, o)| *o == AttemptOutcome::Error));
    }
}
