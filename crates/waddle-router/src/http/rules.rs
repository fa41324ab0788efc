//! String-rule management.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use waddle_strings::{RuleDraft, RuleUpdate, StringRule};

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct RulesQuery {
    pub entity_id: Option<String>,
}

/// GET /router/string-rules — all rules, or those applying to one entity.
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RulesQuery>,
) -> Result<Json<Value>, ApiError> {
    let rules = state.strings.list_rules(query.entity_id.as_deref())?;
    let rules: Vec<Value> = rules.iter().map(rule_json).collect();
    let mut body = json!({ "rules": rules, "total": rules.len() });
    if let Some(entity_id) = query.entity_id {
        body["entity_id"] = json!(entity_id);
    }
    Ok(Json(body))
}

/// POST /router/string-rules
pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let missing: Vec<&str> = ["pattern", "action"]
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

    let draft: RuleDraft = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid rule payload: {}", e)))?;
    let rule_id = state.strings.create_rule(&draft)?;
    Ok(Json(json!({
        "success": true,
        "rule_id": rule_id,
        "message": "String rule created successfully",
    })))
}

/// PUT /router/string-rules/{rule_id}
pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let update: RuleUpdate = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid rule payload: {}", e)))?;
    state.strings.update_rule(rule_id, &update)?;
    Ok(Json(json!({
        "success": true,
        "message": "String rule updated successfully",
    })))
}

/// DELETE /router/string-rules/{rule_id} — soft delete.
pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.strings.delete_rule(rule_id)?;
    Ok(Json(json!({
        "success": true,
        "message": "String rule deleted successfully",
    })))
}

fn rule_json(rule: &StringRule) -> Value {
    json!({
        "id": rule.id,
        "pattern": rule.pattern,
        "match_type": rule.match_type.as_str(),
        "case_sensitive": rule.case_sensitive,
        "enabled_entity_ids": rule.enabled_entity_ids,
        "action": rule.action.as_str(),
        "command_to_execute": rule.command_to_execute,
        "command_parameters": rule.command_parameters,
        "webhook_url": rule.webhook_url,
        "warning_message": rule.warning_message,
        "block_message": rule.block_message,
        "priority": rule.priority,
        "match_count": rule.match_count,
        "last_matched": rule.last_matched,
        "created_by": rule.created_by,
        "created_at": rule.created_at,
    })
}
