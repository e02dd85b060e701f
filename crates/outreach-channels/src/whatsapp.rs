//! WhatsApp Business Cloud API channel.
//!
//! Reengagement messages go out as approved template messages (outside the
//! 24h customer-service window free text is rejected). The template name is
//! the rule's template ref; the lead's name fills the first body parameter.
//! Requires: Access Token + Phone Number ID from Meta Business Suite.

use async_trait::async_trait;
use outreach_core::config::WhatsAppConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::ChannelAdapter;
use outreach_core::types::{AttemptReport, AttemptRequest, Channel};

use crate::NO_ADDRESS;

/// Cloud API error codes meaning the recipient cannot be reached.
const UNDELIVERABLE_CODES: [i64; 3] = [131026, 131030, 131021];

pub struct WhatsAppAdapter {
    config: WhatsAppConfig,
    client: reqwest::Client,
}

impl WhatsAppAdapter {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Template message body.
    pub fn template_payload(&self, request: &AttemptRequest, to: &str) -> Result<serde_json::Value> {
        let message = request
            .message
            .as_ref()
            .ok_or_else(|| OutreachError::Channel("WhatsApp attempt without a message template".into()))?;
        let name = request.contact.name.as_deref().unwrap_or("there");
        Ok(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to.trim_start_matches('+'),
            "type": "template",
            "template": {
                "name": message.template_ref,
                "language": { "code": self.config.language },
                "components": [{
                    "type": "body",
                    "parameters": [{ "type": "text", "text": name }]
                }]
            }
        }))
    }
}

/// Map a Cloud API error body to a provider result, if it is a recipient problem.
pub fn classify_error(body: &serde_json::Value) -> Option<&'static str> {
    let code = body["error"]["code"].as_i64()?;
    UNDELIVERABLE_CODES.contains(&code).then_some("undeliverable")
}

#[async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn attempt(&self, request: &AttemptRequest) -> Result<AttemptReport> {
        let Some(to) = request.contact.phone.as_deref().filter(|p| !p.trim().is_empty()) else {
            return Ok(AttemptReport::new(NO_ADDRESS));
        };
        if self.config.access_token.is_empty() || self.config.phone_number_id.is_empty() {
            return Err(OutreachError::Config(
                "WhatsApp access_token/phone_number_id not configured".into(),
            ));
        }

        let url = format!(
            "{}/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            self.config.phone_number_id
        );
        let body = self.template_payload(request, to)?;

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.access_token))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| OutreachError::Provider(format!("WhatsApp API request failed: {e}")))?;

        let status = response.status();
        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OutreachError::Provider(format!("Invalid WhatsApp response: {e}")))?;

        if !status.is_success() {
            if let Some(outcome) = classify_error(&result) {
                tracing::debug!("WhatsApp recipient {to} unreachable: {}", result["error"]["message"]);
                return Ok(AttemptReport::new(outcome));
            }
            return Err(OutreachError::Provider(format!("WhatsApp API error {status}: {result}")));
        }

        let msg_id = result["messages"][0]["id"].as_str().unwrap_or("unknown");
        tracing::debug!("WhatsApp template sent: {msg_id} → {to}");
        Ok(AttemptReport::new("sent"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::types::{LeadContact, MessageSpec};

    fn adapter() -> WhatsAppAdapter {
        WhatsAppAdapter::new(WhatsAppConfig {
            access_token: "token".into(),
            phone_number_id: "12345".into(),
            api_base: "https://graph.facebook.com/v21.0".into(),
            language: "es".into(),
        })
    }

    fn request(message: Option<MessageSpec>) -> AttemptRequest {
        AttemptRequest {
            lead_id: "lead-1".into(),
            rule_id: "winback".into(),
            channel: Channel::Whatsapp,
            contact: LeadContact {
                name: Some("Lucia".into()),
                phone: Some("+34600111222".into()),
                email: None,
            },
            message,
        }
    }

    #[test]
    fn test_template_payload() {
        let message = MessageSpec {
            template_ref: "miss_you".into(),
            tone: Some("warm".into()),
        };
        let payload = adapter().template_payload(&request(Some(message)), "+34600111222").unwrap();
        assert_eq!(payload["to"], "34600111222");
        assert_eq!(payload["type"], "template");
        assert_eq!(payload["template"]["name"], "miss_you");
        assert_eq!(payload["template"]["language"]["code"], "es");
        assert_eq!(payload["template"]["components"][0]["parameters"][0]["text"], "Lucia");
    }

    #[test]
    fn test_payload_requires_template() {
        assert!(adapter().template_payload(&request(None), "+34600111222").is_err());
    }

    #[test]
    fn test_classify_error() {
        let undeliverable = serde_json::json!({"error": {"code": 131026, "message": "Message undeliverable"}});
        assert_eq!(classify_error(&undeliverable), Some("undeliverable"));
        let auth = serde_json::json!({"error": {"code": 190, "message": "Invalid OAuth access token"}});
        assert_eq!(classify_error(&auth), None);
        assert_eq!(classify_error(&serde_json::json!({})), None);
    }

    #[tokio::test]
    async fn test_missing_phone_is_invalid_number() {
        let mut req = request(None);
        req.contact.phone = None;
        let report = adapter().attempt(&req).await.unwrap();
        assert_eq!(report.provider_result, NO_ADDRESS);
    }
}
