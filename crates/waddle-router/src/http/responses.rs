//! Module / webhook reply submission and retrieval.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use waddle_registry::{ModuleResponseDraft, ModuleResponseRow, ResponseAction};

use crate::app::AppState;
use crate::error::ApiError;

const REQUIRED_FIELDS: [&str; 5] = [
    "execution_id",
    "module_name",
    "success",
    "response_action",
    "session_id",
];

/// POST /router/responses — a module reports the outcome of an execution.
///
/// The reply is accepted only when the referenced execution exists and the
/// presented session was minted for the same entity the execution ran in.
pub async fn submit_response(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
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

    let action_name = body["response_action"].as_str().unwrap_or_default();
    let action = ResponseAction::parse(action_name).ok_or_else(|| {
        ApiError::bad_request(format!(
            "Invalid response_action '{}'. Must be one of: chat, media, ticker, form, general",
            action_name
        ))
    })?;

    let execution_id = body["execution_id"].as_str().unwrap_or_default();
    let execution = state
        .registry
        .execution_by_id(execution_id)?
        .ok_or_else(|| ApiError::not_found(format!("Execution ID {} not found", execution_id)))?;

    let session_id = body["session_id"].as_str().unwrap_or_default();
    state
        .sessions
        .get(session_id)?
        .ok_or_else(|| ApiError::not_found(format!("Session ID {} not found or expired", session_id)))?;

    if !state.sessions.validate(session_id, &execution.entity_id)? {
        return Err(ApiError::forbidden(format!(
            "Session ID {} does not match execution entity",
            session_id
        )));
    }
    state.sessions.touch(session_id)?;

    let draft: ModuleResponseDraft = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid response payload: {}", e)))?;
    let response_id = state.registry.insert_module_response(action, &draft)?;

    Ok(Json(json!({
        "success": true,
        "response_id": response_id,
        "message": "Module response recorded successfully",
    })))
}

/// GET /router/responses/{execution_id} — all replies for one execution.
pub async fn get_responses(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let responses: Vec<Value> = state
        .registry
        .responses_for_execution(&execution_id)?
        .iter()
        .map(response_json)
        .collect();
    Ok(Json(json!({
        "execution_id": execution_id,
        "total": responses.len(),
        "responses": responses,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub module_name: Option<String>,
    pub response_action: Option<String>,
    #[serde(default)]
    pub success_only: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /router/responses/recent — browse the latest replies.
pub async fn recent_responses(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Value>, ApiError> {
    let action = match query.response_action.as_deref() {
        Some(name) => Some(ResponseAction::parse(name).ok_or_else(|| {
            ApiError::bad_request(format!("Invalid response_action '{}'", name))
        })?),
        None => None,
    };

    let responses: Vec<Value> = state
        .registry
        .recent_responses(
            query.module_name.as_deref(),
            action,
            query.success_only,
            query.limit,
        )?
        .iter()
        .map(response_json)
        .collect();

    Ok(Json(json!({
        "total": responses.len(),
        "responses": responses,
        "filters": {
            "module_name": query.module_name,
            "response_action": query.response_action,
            "success_only": query.success_only,
            "limit": query.limit,
        },
    })))
}

/// API shape for a stored reply: common fields plus only the fields that
/// belong to the row's action.
fn response_json(row: &ModuleResponseRow) -> Value {
    let draft = &row.draft;
    let mut value = json!({
        "id": row.id,
        "execution_id": draft.execution_id,
        "module_name": draft.module_name,
        "success": draft.success,
        "response_action": row.action.as_str(),
        "response_data": draft.response_data,
        "processing_time_ms": draft.processing_time_ms,
        "created_at": row.created_at,
    });

    match row.action {
        ResponseAction::Chat => {
            value["chat_message"] = json!(draft.chat_message);
        }
        ResponseAction::Media => {
            value["media_type"] = json!(draft.media_type);
            value["media_url"] = json!(draft.media_url);
        }
        ResponseAction::Ticker => {
            value["ticker_text"] = json!(draft.ticker_text);
            value["ticker_duration"] = json!(draft.ticker_duration);
        }
        ResponseAction::Form => {
            value["form_title"] = json!(draft.form_title);
            value["form_description"] = json!(draft.form_description);
            value["form_fields"] = json!(draft.form_fields);
            value["form_submit_url"] = json!(draft.form_submit_url);
            value["form_submit_method"] = json!(draft.form_submit_method);
            value["form_callback_url"] = json!(draft.form_callback_url);
        }
        ResponseAction::General => {
            value["content_type"] = json!(draft.content_type);
            value["content"] = json!(draft.content);
            value["duration"] = json!(draft.duration);
            value["style"] = json!(draft.style);
        }
    }

    if let Some(error) = &draft.error_message {
        value["error_message"] = json!(error);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use axum::http::StatusCode;
    use rusqlite::Connection;
    use waddle_accounts::AccountStore;
    use waddle_cache::TtlCache;
    use waddle_coordination::Coordinator;
    use waddle_core::config::WaddleConfig;
    use waddle_core::types::{parse_message, CommandResult};
    use waddle_execution::ExecutionEngine;
    use waddle_ratelimit::RateLimiter;
    use waddle_rbac::RbacService;
    use waddle_registry::{
        CommandDraft, CommandType, ExecutionMode, RegistryStore, TriggerType,
    };
    use waddle_sessions::SessionStore;
    use waddle_strings::StringMatcher;

    use crate::pipeline::CommandPipeline;
    use crate::reputation::ReputationClient;

    fn test_state() -> Arc<AppState> {
        let cache = Arc::new(TtlCache::new(
            Duration::from_secs(300),
            Duration::from_secs(600),
        ));
        let registry =
            Arc::new(RegistryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let sessions =
            Arc::new(SessionStore::new(Connection::open_in_memory().unwrap(), 3600).unwrap());
        let rbac = Arc::new(RbacService::new(Connection::open_in_memory().unwrap()).unwrap());
        rbac.initialize().unwrap();
        let accounts =
            Arc::new(AccountStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let coordination =
            Arc::new(Coordinator::new(Connection::open_in_memory().unwrap()).unwrap());
        let strings = Arc::new(
            StringMatcher::new(Connection::open_in_memory().unwrap(), cache.clone()).unwrap(),
        );
        let limiter =
            Arc::new(RateLimiter::new(60, Connection::open_in_memory().unwrap()).unwrap());
        let engine = Arc::new(ExecutionEngine::new(2, 0, None));
        let reputation = ReputationClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/reputation".to_string(),
            1,
        );
        let pipeline = Arc::new(CommandPipeline::new(
            registry.clone(),
            cache.clone(),
            limiter.clone(),
            engine,
            strings.clone(),
            sessions.clone(),
            rbac,
            reputation,
            4,
            5,
            2,
        ));

        Arc::new(AppState {
            config: WaddleConfig::default(),
            registry,
            sessions,
            accounts,
            coordination,
            strings,
            cache,
            limiter,
            pipeline,
            started_at: Instant::now(),
        })
    }

    /// Seed an execution for entity `twitch+42` and return its id.
    fn seed_execution(state: &AppState) -> String {
        let draft = CommandDraft {
            command: "help".to_string(),
            prefix: "!".to_string(),
            description: None,
            location_url: "http://127.0.0.1:9/help".to_string(),
            location: "internal".to_string(),
            kind: CommandType::Container,
            method: "POST".to_string(),
            timeout_secs: 1,
            headers: None,
            auth_required: false,
            rate_limit: 0,
            module_type: "local".to_string(),
            module_id: None,
            version: "1.0".to_string(),
            trigger_type: TriggerType::Command,
            event_types: Vec::new(),
            priority: 100,
            execution_mode: ExecutionMode::Sequential,
        };
        let command = state.registry.create_command(&draft).unwrap();
        state
            .registry
            .ensure_entity("twitch", "42", "", "alice")
            .unwrap();

        let request = parse_message("!help", "twitch", "42", "", "u1", "alice").unwrap();
        let result = CommandResult {
            success: true,
            response_data: json!({"text": "ok"}),
            execution_time_ms: 5,
            status_code: 200,
            error_message: None,
            retry_count: 0,
        };
        state
            .registry
            .record_execution(&request, &command, &result, &json!({}))
            .unwrap();
        request.message_id
    }

    fn reply_body(execution_id: &str, session_id: &str) -> Value {
        json!({
            "execution_id": execution_id,
            "module_name": "helper",
            "success": true,
            "response_action": "chat",
            "session_id": session_id,
            "chat_message": "hi",
        })
    }

    #[tokio::test]
    async fn reply_with_matching_session_is_recorded() {
        let state = test_state();
        let execution_id = seed_execution(&state);
        let session_id = state.sessions.create("twitch+42").unwrap();

        let response = submit_response(
            State(state.clone()),
            Json(reply_body(&execution_id, &session_id)),
        )
        .await
        .unwrap();
        assert_eq!(response.0["success"], true);

        let stored = state.registry.responses_for_execution(&execution_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].draft.chat_message.as_deref(), Some("hi"));
        // Accepting a reply counts as session activity.
        let session = state.sessions.get(&session_id).unwrap().unwrap();
        assert_eq!(session.request_count, 1);
    }

    #[tokio::test]
    async fn reply_with_foreign_session_is_rejected() {
        let state = test_state();
        let execution_id = seed_execution(&state);
        // Session minted for a different entity than the execution's.
        let session_id = state.sessions.create("discord+g+c").unwrap();

        let err = submit_response(
            State(state.clone()),
            Json(reply_body(&execution_id, &session_id)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        // No reply row was written.
        assert!(state
            .registry
            .responses_for_execution(&execution_id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let state = test_state();
        let execution_id = seed_execution(&state);
        let session_id = state.sessions.create("twitch+42").unwrap();

        let err = submit_response(State(state.clone()), Json(reply_body("missing", &session_id)))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = submit_response(State(state.clone()), Json(reply_body(&execution_id, "missing")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_action_is_rejected() {
        let state = test_state();
        let execution_id = seed_execution(&state);
        let session_id = state.sessions.create("twitch+42").unwrap();

        let mut body = reply_body(&execution_id, &session_id);
        body["response_action"] = json!("dance");
        let err = submit_response(State(state), Json(body)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
