use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;
use waddle_core::types::{InboundEvent, MessageType};

/// Fire-and-log client for the external reputation service.
///
/// Reputation is advisory: any failure is reported in the response
/// envelope but never fails the event.
pub struct ReputationClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ReputationClient {
    pub fn new(client: Client, base_url: String, timeout_secs: u64) -> Self {
        Self {
            client,
            base_url,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Forward one event. Returns `{success, data?}` or `{success: false,
    /// error}` — never an Err.
    pub async fn process(&self, user_id: &str, entity_id: &str, event: &InboundEvent) -> Value {
        let payload = build_payload(user_id, entity_id, event);
        let url = format!("{}/process", self.base_url);

        match self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let data = response.json::<Value>().await.unwrap_or(Value::Null);
                json!({ "success": true, "data": data })
            }
            Ok(response) => {
                warn!(status = %response.status(), "reputation processing failed");
                json!({ "success": false, "error": format!("HTTP {}", response.status().as_u16()) })
            }
            Err(e) => {
                warn!(error = %e, "reputation request failed");
                json!({ "success": false, "error": e.to_string() })
            }
        }
    }
}

fn build_payload(user_id: &str, entity_id: &str, event: &InboundEvent) -> Value {
    let mut event_data = json!({
        "platform": event.platform,
        "server_id": event.server_id,
        "channel_id": event.channel_id,
        "message_content": event.message_content,
        "timestamp": Utc::now().to_rfc3339(),
    });

    // Event-specific magnitudes the scorer weighs.
    match event.message_type {
        MessageType::Cheer => {
            if let Some(bits) = event.bits {
                event_data["bits"] = bits.into();
            }
        }
        MessageType::VoiceTime => {
            if let Some(minutes) = event.minutes {
                event_data["minutes"] = minutes.into();
            }
        }
        MessageType::Donation => {
            if let Some(amount) = event.amount {
                event_data["amount"] = amount.into();
            }
        }
        _ => {}
    }

    json!({
        "user_id": user_id,
        "entity_id": entity_id,
        "event_name": event.message_type.reputation_event_name(),
        "event_data": event_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(message_type: MessageType) -> InboundEvent {
        InboundEvent {
            platform: "twitch".to_string(),
            server_id: "42".to_string(),
            channel_id: String::new(),
            user_id: "u1".to_string(),
            user_name: "alice".to_string(),
            message_content: "hi".to_string(),
            message_type,
            bits: Some(500),
            minutes: Some(12),
            amount: Some(5.0),
        }
    }

    #[test]
    fn chat_messages_map_to_message_events() {
        let payload = build_payload("u1", "twitch+42", &event(MessageType::ChatMessage));
        assert_eq!(payload["event_name"], "message");
        assert!(payload["event_data"].get("bits").is_none());
    }

    #[test]
    fn magnitude_fields_follow_event_type() {
        let cheer = build_payload("u1", "twitch+42", &event(MessageType::Cheer));
        assert_eq!(cheer["event_name"], "cheer");
        assert_eq!(cheer["event_data"]["bits"], 500);
        assert!(cheer["event_data"].get("amount").is_none());

        let donation = build_payload("u1", "twitch+42", &event(MessageType::Donation));
        assert_eq!(donation["event_data"]["amount"], 5.0);

        let voice = build_payload("u1", "twitch+42", &event(MessageType::VoiceTime));
        assert_eq!(voice["event_data"]["minutes"], 12);
    }
}
