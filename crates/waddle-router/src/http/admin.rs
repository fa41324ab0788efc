//! Administration: service accounts plus the command-registry writes the
//! marketplace installer performs. Admin keys only (enforced by the auth
//! middleware's route policy).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use waddle_accounts::AccountType;
use waddle_registry::CommandDraft;

use crate::app::AppState;
use crate::auth::AuthedAccount;
use crate::error::ApiError;

/// GET /router/admin/service-accounts — key material is never included.
pub async fn list_accounts(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let accounts = state.accounts.list_accounts()?;
    Ok(Json(json!({ "total": accounts.len(), "accounts": accounts })))
}

/// POST /router/admin/service-accounts — returns the plaintext key once.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    Extension(AuthedAccount(caller)): Extension<AuthedAccount>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let account_name = body
        .get("account_name")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("account_name is required"))?;
    let type_name = body
        .get("account_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::bad_request("account_type is required"))?;
    let account_type = AccountType::parse(type_name).ok_or_else(|| {
        ApiError::bad_request(format!(
            "Invalid account_type '{}'. Must be one of: collector, interaction, webhook, admin",
            type_name
        ))
    })?;

    let platform = body.get("platform").and_then(|v| v.as_str());
    let permissions: Option<Vec<String>> = body
        .get("permissions")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let rate_limit = body
        .get("rate_limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(1000) as u32;
    let description = body.get("description").and_then(|v| v.as_str());

    let (account, api_key) = state.accounts.create_account(
        account_name,
        account_type,
        platform,
        permissions,
        rate_limit,
        description,
        &caller.account_name,
    )?;

    Ok(Json(json!({
        "success": true,
        "account": account,
        "api_key": api_key,
        "message": "Store this API key now; it cannot be retrieved again",
    })))
}

/// POST /router/admin/service-accounts/{account_id}/regenerate
pub async fn regenerate_key(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let api_key = state.accounts.regenerate_key(account_id)?;
    Ok(Json(json!({
        "success": true,
        "account_id": account_id,
        "api_key": api_key,
        "message": "Store this API key now; it cannot be retrieved again",
    })))
}

/// POST /router/admin/service-accounts/{account_id}/revoke
pub async fn revoke_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.accounts.revoke(account_id)?;
    Ok(Json(json!({ "success": true, "account_id": account_id })))
}

/// POST /router/admin/commands — register (or update in place) a command.
/// Any stale cached definition is invalidated immediately.
pub async fn register_command(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let missing: Vec<&str> = ["command", "prefix", "location_url", "type"]
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

    let draft: CommandDraft = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid command payload: {}", e)))?;
    let command = state.registry.create_command(&draft)?;
    state
        .cache
        .delete(&format!("command:{}:{}", command.prefix, command.command));

    Ok(Json(json!({ "success": true, "command": command })))
}

/// POST /router/admin/commands/{command_id}/deactivate
pub async fn deactivate_command(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let command = state
        .registry
        .command_by_id(command_id)?
        .ok_or_else(|| ApiError::not_found(format!("Command {} not found", command_id)))?;
    state.registry.set_command_active(command_id, false)?;
    state
        .cache
        .delete(&format!("command:{}:{}", command.prefix, command.command));

    Ok(Json(json!({ "success": true, "command_id": command_id })))
}

/// POST /router/admin/commands/{command_id}/permissions — enable or
/// disable a command for one entity. Invalidates the cached decision.
pub async fn set_command_permission(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let entity_id = body
        .get("entity_id")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("entity_id is required"))?;
    let enabled = body.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);

    if !state.registry.set_permission(command_id, entity_id, enabled)? {
        return Err(ApiError::not_found(format!("Entity {} not found", entity_id)));
    }
    state
        .cache
        .delete(&format!("permission:{}:{}", command_id, entity_id));

    Ok(Json(json!({
        "success": true,
        "command_id": command_id,
        "entity_id": entity_id,
        "enabled": enabled,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub account_id: Option<i64>,
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    7
}

/// GET /router/admin/api-usage
pub async fn api_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Value>, ApiError> {
    let stats = state.accounts.usage_stats(query.account_id, query.days)?;
    Ok(Json(stats))
}
