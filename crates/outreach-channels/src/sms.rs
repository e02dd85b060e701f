//! SMS channel: generic HTTP gateway (`POST api_url` with JSON body).

use async_trait::async_trait;
use outreach_core::config::SmsConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::ChannelAdapter;
use outreach_core::types::{AttemptReport, AttemptRequest, Channel};
use serde::Deserialize;

use crate::{NO_ADDRESS, render_template};

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    status: Option<String>,
}

pub struct SmsAdapter {
    config: SmsConfig,
    client: reqwest::Client,
}

impl SmsAdapter {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn sms_payload(&self, request: &AttemptRequest, to: &str) -> Result<serde_json::Value> {
        let message = request
            .message
            .as_ref()
            .ok_or_else(|| OutreachError::Channel("SMS attempt without a message template".into()))?;
        let text = render_template(&self.config.templates, message, &request.contact).ok_or_else(|| {
            OutreachError::Channel(format!("No SMS template '{}' configured", message.template_ref))
        })?;
        Ok(serde_json::json!({
            "from": self.config.sender,
            "to": to,
            "text": text,
        }))
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn attempt(&self, request: &AttemptRequest) -> Result<AttemptReport> {
        let Some(to) = request.contact.phone.as_deref().filter(|p| !p.trim().is_empty()) else {
            return Ok(AttemptReport::new(NO_ADDRESS));
        };
        let body = self.sms_payload(request, to)?;

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| OutreachError::Provider(format!("SMS gateway request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(OutreachError::Provider(format!("SMS gateway error {status}: {error_text}")));
        }

        let result: GatewayResponse = response
            .json()
            .await
            .map_err(|e| OutreachError::Provider(format!("Invalid SMS gateway response: {e}")))?;
        let status = result.status.unwrap_or_else(|| "sent".into());
        tracing::debug!("SMS to {to}: {status}");
        Ok(AttemptReport::new(status))
    }
}
