//! Read-only registry browsing for collectors and modules.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CommandsQuery {
    pub prefix: Option<String>,
    pub entity_id: Option<String>,
}

/// GET /router/commands — active commands, optionally annotated with
/// whether each is enabled for a given entity.
pub async fn list_commands(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CommandsQuery>,
) -> Result<Json<Value>, ApiError> {
    let commands = state.registry.list_commands(query.prefix.as_deref())?;

    let mut listing = Vec::with_capacity(commands.len());
    for command in &commands {
        let mut info = json!({
            "command": format!("{}{}", command.prefix, command.command),
            "description": command.description,
            "location": command.location,
            "type": command.kind.as_str(),
            "module_type": command.module_type,
            "version": command.version,
        });
        if let Some(entity_id) = &query.entity_id {
            info["enabled"] = json!(state.registry.permission_enabled(command.id, entity_id)?);
        }
        listing.push(info);
    }

    Ok(Json(json!({ "commands": listing, "total": listing.len() })))
}

/// GET /router/entities — chat locations the router has seen.
pub async fn list_entities(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let entities: Vec<Value> = state
        .registry
        .list_entities()?
        .iter()
        .map(|entity| {
            json!({
                "entity_id": entity.entity_id,
                "platform": entity.platform,
                "server_id": entity.server_id,
                "channel_id": entity.channel_id,
                "owner": entity.owner,
                "created_at": entity.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "entities": entities, "total": entities.len() })))
}
