//! Voice channel: places a call through an HTTP telephony API.
//!
//! The provider answers synchronously with the call's disposition
//! (`answered`, `no-answer`, `busy`, `voicemail`, `failed`, ...).

use async_trait::async_trait;
use outreach_core::config::VoiceConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::ChannelAdapter;
use outreach_core::types::{AttemptReport, AttemptRequest, Channel};
use serde::Deserialize;
use std::time::Duration;

use crate::{NO_ADDRESS, render_template};

/// Disposition returned by the telephony API.
#[derive(Debug, Deserialize)]
struct CallResult {
    status: String,
    #[serde(default)]
    duration_secs: Option<f64>,
}

pub struct VoiceAdapter {
    config: VoiceConfig,
    client: reqwest::Client,
}

impl VoiceAdapter {
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Request body for one call.
    pub fn call_payload(&self, request: &AttemptRequest, to: &str) -> serde_json::Value {
        let script = request
            .message
            .as_ref()
            .and_then(|m| render_template(&self.config.templates, m, &request.contact));
        serde_json::json!({
            "to": to,
            "from": self.config.caller_id,
            "reference": format!("{}:{}", request.rule_id, request.lead_id),
            "script": script,
        })
    }
}

#[async_trait]
impl ChannelAdapter for VoiceAdapter {
    fn channel(&self) -> Channel {
        Channel::Voice
    }

    async fn attempt(&self, request: &AttemptRequest) -> Result<AttemptReport> {
        let Some(to) = request.contact.phone.as_deref().filter(|p| !p.trim().is_empty()) else {
            tracing::debug!("Lead {} has no phone number", request.lead_id);
            return Ok(AttemptReport::new(NO_ADDRESS));
        };

        let url = format!("{}/calls", self.config.api_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&self.call_payload(request, to))
            .send()
            .await
            .map_err(|e| OutreachError::Provider(format!("Telephony request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(OutreachError::Provider(format!(
                "Telephony API error {status}: {error_text}"
            )));
        }

        let result: CallResult = response
            .json()
            .await
            .map_err(|e| OutreachError::Provider(format!("Invalid telephony response: {e}")))?;

        let mut report = AttemptReport::new(result.status);
        if let Some(secs) = result.duration_secs.filter(|s| s.is_finite() && *s >= 0.0) {
            report = report.with_duration(Duration::from_secs_f64(secs));
        }
        Ok(report)
    }
}
