//! Event ingest — the router's main entry points for collectors.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::Value;
use waddle_core::types::{InboundEvent, MessageType};

use crate::app::AppState;
use crate::error::ApiError;

const REQUIRED_FIELDS: [&str; 6] = [
    "platform",
    "server_id",
    "user_id",
    "user_name",
    "message_content",
    "message_type",
];

/// POST /router/events — process one collector event.
pub async fn post_event(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let event = validate_event(&body)?;
    let envelope = state.pipeline.handle_event(event).await?;
    Ok(Json(envelope))
}

/// POST /router/events/batch — up to 100 events in one call.
pub async fn post_event_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let events = body
        .get("events")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ApiError::bad_request("No events provided in batch"))?
        .clone();
    let summary = state.pipeline.handle_batch(events).await?;
    Ok(Json(summary))
}

/// Field-by-field validation so collectors get actionable 400s rather
/// than a generic deserialization failure.
fn validate_event(body: &Value) -> Result<InboundEvent, ApiError> {
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .filter(|field| body.get(**field).is_none())
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::bad_request(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }

    if let Some(message_type) = body.get("message_type").and_then(|v| v.as_str()) {
        if serde_json::from_value::<MessageType>(Value::String(message_type.to_string())).is_err()
        {
            return Err(ApiError::bad_request(format!(
                "Invalid message_type '{}'",
                message_type
            )));
        }
    }

    serde_json::from_value(body.clone())
        .map_err(|e| ApiError::bad_request(format!("Invalid event payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_body() -> Value {
        json!({
            "platform": "twitch",
            "server_id": "42",
            "user_id": "u1",
            "user_name": "alice",
            "message_content": "!help",
            "message_type": "chatMessage",
        })
    }

    #[test]
    fn accepts_valid_events() {
        let event = validate_event(&valid_body()).unwrap();
        assert_eq!(event.platform, "twitch");
        assert_eq!(event.message_type, MessageType::ChatMessage);
        assert_eq!(event.channel_id, "");
    }

    #[test]
    fn reports_all_missing_fields() {
        let err = validate_event(&json!({"platform": "twitch"})).unwrap_err();
        assert!(err.message.contains("server_id"));
        assert!(err.message.contains("message_type"));
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rejects_unknown_message_types() {
        let mut body = valid_body();
        body["message_type"] = json!("telepathy");
        let err = validate_event(&body).unwrap_err();
        assert!(err.message.contains("telepathy"));
    }
}
