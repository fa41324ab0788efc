//! Coordinator operations for collector containers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::error::ApiError;

fn required_str<'a>(body: &'a Value, field: &str) -> Result<&'a str, ApiError> {
    body.get(field)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{} is required", field)))
}

/// POST /router/coordination/claim
pub async fn claim(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let platform = required_str(&body, "platform")?;
    let container_id = required_str(&body, "container_id")?;
    let max_claims = body
        .get("max_claims")
        .and_then(|v| v.as_u64())
        .unwrap_or(5) as usize;

    let result = state.coordination.claim(container_id, platform, max_claims)?;
    Ok(Json(json!({
        "success": true,
        "claimed_count": result.claimed_entities.len(),
        "claimed_entities": result.claimed_entities,
        "container_id": container_id,
        "platform": platform,
    })))
}

/// POST /router/coordination/release
pub async fn release(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let container_id = required_str(&body, "container_id")?;
    let entity_ids: Option<Vec<String>> = body
        .get("entity_ids")
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    let released = state
        .coordination
        .release(container_id, entity_ids.as_deref())?;
    Ok(Json(json!({
        "success": true,
        "container_id": container_id,
        "released_count": released,
        "released_entities": entity_ids.map(Value::from).unwrap_or_else(|| json!("all")),
    })))
}

/// POST /router/coordination/checkin
pub async fn checkin(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let container_id = required_str(&body, "container_id")?;
    let updated = state.coordination.checkin(container_id)?;
    Ok(Json(json!({
        "success": true,
        "container_id": container_id,
        "entities_renewed": updated,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// POST /router/coordination/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let container_id = required_str(&body, "container_id")?;
    let extend = body
        .get("extend_claims")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let snapshot = state.coordination.heartbeat(container_id, extend)?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

/// POST /router/coordination/status
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let container_id = required_str(&body, "container_id")?;
    let entity_id = required_str(&body, "entity_id")?;
    let is_live = body.get("is_live").and_then(|v| v.as_bool());
    let viewer_count = body.get("viewer_count").and_then(|v| v.as_i64());
    let metadata = body.get("metadata").filter(|v| !v.is_null());
    let has_activity = body
        .get("has_activity")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let updated = state.coordination.update_status(
        container_id,
        entity_id,
        is_live,
        viewer_count,
        metadata,
        has_activity,
    )?;
    Ok(Json(json!({
        "success": updated,
        "entity_id": entity_id,
        "container_id": container_id,
    })))
}

/// POST /router/coordination/error
pub async fn report_error(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let container_id = required_str(&body, "container_id")?;
    let entity_id = required_str(&body, "entity_id")?;
    let error_message = required_str(&body, "error_message")?;

    let reported = state
        .coordination
        .report_error(container_id, entity_id, error_message)?;
    Ok(Json(json!({
        "success": reported,
        "entity_id": entity_id,
        "container_id": container_id,
        "error_message": error_message,
    })))
}

/// POST /router/coordination/release-offline
pub async fn release_offline(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let container_id = required_str(&body, "container_id")?;
    let (released, replacements) = state.coordination.release_offline(container_id)?;
    Ok(Json(json!({
        "success": true,
        "container_id": container_id,
        "released_count": released.len(),
        "released_entities": released,
        "replacements_claimed": replacements.claimed_entities.len(),
    })))
}

/// POST /router/coordination/populate
pub async fn populate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let platform = required_str(&body, "platform")?;
    let added = state.coordination.populate_from_servers(platform)?;
    Ok(Json(json!({
        "success": true,
        "platform": platform,
        "entities_added": added,
    })))
}

#[derive(Debug, Deserialize)]
pub struct EntitiesQuery {
    pub platform: Option<String>,
    pub status: Option<String>,
    pub claimed_by: Option<String>,
    pub is_live: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// GET /router/coordination/entities
pub async fn list_entities(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EntitiesQuery>,
) -> Result<Json<Value>, ApiError> {
    let entries = state.coordination.list_entries(
        query.platform.as_deref(),
        query.status.as_deref(),
        query.claimed_by.as_deref(),
        query.is_live,
        query.limit,
    )?;
    Ok(Json(json!({
        "total": entries.len(),
        "entities": entries,
        "filters": {
            "platform": query.platform,
            "status": query.status,
            "claimed_by": query.claimed_by,
            "is_live": query.is_live,
            "limit": query.limit,
        },
    })))
}

/// GET /router/coordination/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let stats = state.coordination.stats()?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}
