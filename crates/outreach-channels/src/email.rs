//! Mail channel: SMTP sending via async lettre.
//!
//! A malformed recipient address is reported as `invalid-number` and a
//! permanent SMTP rejection as `bounced`; transient SMTP failures are
//! errors and retried under the rule's `error` backoff.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use outreach_core::config::MailConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::ChannelAdapter;
use outreach_core::types::{AttemptReport, AttemptRequest, Channel};

use crate::{NO_ADDRESS, render_template};

pub struct MailAdapter {
    config: MailConfig,
}

impl MailAdapter {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    fn from_mailbox(&self) -> Result<Mailbox> {
        let from = match &self.config.display_name {
            Some(name) => format!("{name} <{}>", self.config.from_address),
            None => self.config.from_address.clone(),
        };
        from.parse()
            .map_err(|e| OutreachError::Config(format!("Invalid mail from address: {e}")))
    }

    /// Build the message. `Ok(None)` when the recipient address is unusable.
    pub fn build_message(&self, request: &AttemptRequest) -> Result<Option<LettreMessage>> {
        let Some(to) = request.contact.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) else {
            return Ok(None);
        };
        let to_mailbox: Mailbox = match to.parse() {
            Ok(mailbox) => mailbox,
            Err(e) => {
                tracing::debug!("Lead {} has an invalid address '{to}': {e}", request.lead_id);
                return Ok(None);
            }
        };

        let message = request
            .message
            .as_ref()
            .ok_or_else(|| OutreachError::Channel("Mail attempt without a message template".into()))?;
        let body = render_template(&self.config.templates, message, &request.contact).ok_or_else(|| {
            OutreachError::Channel(format!("No mail template '{}' configured", message.template_ref))
        })?;

        let email = LettreMessage::builder()
            .from(self.from_mailbox()?)
            .to(to_mailbox)
            .subject(self.config.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| OutreachError::Channel(format!("Build email: {e}")))?;
        Ok(Some(email))
    }
}

#[async_trait]
impl ChannelAdapter for MailAdapter {
    fn channel(&self) -> Channel {
        Channel::Mail
    }

    async fn attempt(&self, request: &AttemptRequest) -> Result<AttemptReport> {
        let Some(email) = self.build_message(request)? else {
            return Ok(AttemptReport::new(NO_ADDRESS));
        };

        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)
            .map_err(|e| OutreachError::Provider(format!("SMTP relay: {e}")))?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        match mailer.send(email).await {
            Ok(_) => {
                tracing::debug!("📤 Mail sent for lead {}", request.lead_id);
                Ok(AttemptReport::new("sent"))
            }
            Err(e) if e.is_permanent() => {
                tracing::debug!("Mail for lead {} rejected: {e}", request.lead_id);
                Ok(AttemptReport::new("bounced"))
            }
            Err(e) => Err(OutreachError::Provider(format!("SMTP send: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::types::{LeadContact, MessageSpec};
    use std::collections::HashMap;

    fn adapter() -> MailAdapter {
        MailAdapter::new(MailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: "outreach".into(),
            password: "pw".into(),
            from_address: "admissions@example.com".into(),
            display_name: Some("Admissions".into()),
            subject: "We miss you".into(),
            templates: HashMap::from([("miss-you".to_string(), "Dear {name}, come back!".to_string())]),
        })
    }

    fn request(email: Option<&str>) -> AttemptRequest {
        AttemptRequest {
            lead_id: "l".into(),
            rule_id: "winback".into(),
            channel: Channel::Mail,
            contact: LeadContact {
                name: Some("Noor".into()),
                phone: None,
                email: email.map(String::from),
            },
            message: Some(MessageSpec {
                template_ref: "miss-you".into(),
                tone: None,
            }),
        }
    }

    #[test]
    fn test_build_message() {
        let message = adapter().build_message(&request(Some("noor@example.com"))).unwrap().unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("To: noor@example.com"));
        assert!(raw.contains("Subject: We miss you"));
        assert!(raw.contains("Dear Noor, come back!"));
    }

    #[test]
    fn test_bad_address_yields_none() {
        assert!(adapter().build_message(&request(Some("not an address"))).unwrap().is_none());
        assert!(adapter().build_message(&request(None)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_address_is_invalid_number() {
        let report = adapter().attempt(&request(Some(""))).await.unwrap();
        assert_eq!(report.provider_result, NO_ADDRESS);
    }
}
