//! # Outreach Channels
//! Channel adapters that perform one outreach attempt each and report the
//! provider's raw result for the engine to classify.
//!
//! - `voice`: HTTP telephony API (call disposition)
//! - `whatsapp`: WhatsApp Business Cloud API template messages
//! - `sms`: HTTP SMS gateway
//! - `email`: SMTP via lettre

pub mod email;
pub mod sms;
pub mod voice;
pub mod whatsapp;

use outreach_core::config::ChannelsConfig;
use outreach_core::traits::ChannelAdapter;
use outreach_core::types::{LeadContact, MessageSpec};
use std::collections::HashMap;
use std::sync::Arc;

pub use email::MailAdapter;
pub use sms::SmsAdapter;
pub use voice::VoiceAdapter;
pub use whatsapp::WhatsAppAdapter;

/// Result reported when the lead has no usable address for the channel.
pub const NO_ADDRESS: &str = "invalid-number";

/// Build an adapter for every configured channel.
pub fn adapters_from_config(config: &ChannelsConfig) -> Vec<Arc<dyn ChannelAdapter>> {
    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = Vec::new();
    if let Some(voice) = &config.voice {
        adapters.push(Arc::new(VoiceAdapter::new(voice.clone())));
    }
    if let Some(whatsapp) = &config.whatsapp {
        adapters.push(Arc::new(WhatsAppAdapter::new(whatsapp.clone())));
    }
    if let Some(sms) = &config.sms {
        adapters.push(Arc::new(SmsAdapter::new(sms.clone())));
    }
    if let Some(mail) = &config.mail {
        adapters.push(Arc::new(MailAdapter::new(mail.clone())));
    }
    let names: Vec<&str> = adapters.iter().map(|a| a.channel().as_str()).collect();
    tracing::info!("📡 Channel adapters: [{}]", names.join(", "));
    adapters
}

/// Render a message template for a lead.
///
/// Looks up `"<template_ref>.<tone>"` first, then `"<template_ref>"`, and
/// substitutes `{name}`. `None` when no template text is configured.
pub fn render_template(
    templates: &HashMap<String, String>,
    message: &MessageSpec,
    contact: &LeadContact,
) -> Option<String> {
    let toned = message
        .tone
        .as_ref()
        .and_then(|tone| templates.get(&format!("{}.{}", message.template_ref, tone)));
    let text = toned.or_else(|| templates.get(&message.template_ref))?;
    let name = contact.name.as_deref().unwrap_or("there");
    Some(text.replace("{name}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::config::SmsConfig;
    use outreach_core::types::Channel;

    fn templates() -> HashMap<String, String> {
        HashMap::from([
            ("miss-you".to_string(), "Hello {name}, we miss you.".to_string()),
            ("miss-you.playful".to_string(), "Hey {name}! Where did you go?".to_string()),
        ])
    }

    #[test]
    fn test_render_prefers_tone_variant() {
        let contact = LeadContact {
            name: Some("Ana".into()),
            ..Default::default()
        };
        let playful = MessageSpec {
            template_ref: "miss-you".into(),
            tone: Some("playful".into()),
        };
        assert_eq!(
            render_template(&templates(), &playful, &contact).as_deref(),
            Some("Hey Ana! Where did you go?")
        );

        let formal = MessageSpec {
            template_ref: "miss-you".into(),
            tone: Some("formal".into()),
        };
        assert_eq!(
            render_template(&templates(), &formal, &LeadContact::default()).as_deref(),
            Some("Hello there, we miss you.")
        );

        let unknown = MessageSpec {
            template_ref: "other".into(),
            tone: None,
        };
        assert!(render_template(&templates(), &unknown, &contact).is_none());
    }

    #[test]
    fn test_adapters_from_config() {
        let config = ChannelsConfig {
            sms: Some(SmsConfig {
                api_url: "https://sms.example.com/send".into(),
                api_key: "k".into(),
                sender: "SCHOOL".into(),
                templates: HashMap::new(),
            }),
            ..Default::default()
        };
        let adapters = adapters_from_config(&config);
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].channel(), Channel::Sms);
    }
}
