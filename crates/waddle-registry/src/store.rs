use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};
use waddle_core::types::{CommandRequest, CommandResult};

use crate::db::init_db;
use crate::error::Result;
use crate::types::{
    Command, CommandDraft, CommandType, Entity, ExecutionInfo, ExecutionMode, ExecutionStatus,
    ModuleResponseDraft, ModuleResponseRow, ResponseAction, TriggerType,
};

/// Store for the dispatch-core tables: commands, entities, permissions,
/// the execution audit log, and module replies.
pub struct RegistryStore {
    db: Mutex<Connection>,
}

impl RegistryStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // ── commands ──────────────────────────────────────────────────────────────

    /// Register a command. Conflicting (prefix, command) pairs are replaced,
    /// which is how marketplace reinstalls update an endpoint in place.
    pub fn create_command(&self, draft: &CommandDraft) -> Result<Command> {
        let now = Utc::now().to_rfc3339();
        let headers = draft
            .headers
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let event_types = serde_json::to_string(&draft.event_types)?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO commands
             (command, prefix, description, location_url, location, type, method, timeout,
              headers, auth_required, rate_limit, is_active, module_type, module_id, version,
              trigger_type, event_types, priority, execution_mode, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,1,?12,?13,?14,?15,?16,?17,?18,?19,?19)
             ON CONFLICT(prefix, command) DO UPDATE SET
                description=excluded.description, location_url=excluded.location_url,
                location=excluded.location, type=excluded.type, method=excluded.method,
                timeout=excluded.timeout, headers=excluded.headers,
                auth_required=excluded.auth_required, rate_limit=excluded.rate_limit,
                is_active=1, module_type=excluded.module_type, module_id=excluded.module_id,
                version=excluded.version, trigger_type=excluded.trigger_type,
                event_types=excluded.event_types, priority=excluded.priority,
                execution_mode=excluded.execution_mode, updated_at=excluded.updated_at",
            params![
                draft.command,
                draft.prefix,
                draft.description,
                draft.location_url,
                draft.location,
                draft.kind.as_str(),
                draft.method,
                draft.timeout_secs,
                headers,
                draft.auth_required,
                draft.rate_limit,
                draft.module_type,
                draft.module_id,
                draft.version,
                draft.trigger_type.as_str(),
                event_types,
                draft.priority,
                draft.execution_mode.as_str(),
                now,
            ],
        )?;

        let command = db
            .query_row(
                &format!("{} WHERE prefix = ?1 AND command = ?2", COMMAND_SELECT),
                params![draft.prefix, draft.command],
                row_to_command,
            )
            .map_err(crate::error::RegistryError::Database)?;
        info!(command = %command.command, prefix = %command.prefix, "command registered");
        Ok(command)
    }

    pub fn set_command_active(&self, id: i64, active: bool) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE commands SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, now],
        )?;
        Ok(rows > 0)
    }

    /// Active-command lookup on the dispatch hot path.
    pub fn find_command(&self, prefix: &str, command: &str) -> Result<Option<Command>> {
        let db = self.db.lock().unwrap();
        let found = db
            .query_row(
                &format!(
                    "{} WHERE prefix = ?1 AND command = ?2 AND is_active = 1",
                    COMMAND_SELECT
                ),
                params![prefix, command],
                row_to_command,
            )
            .optional()?;
        Ok(found)
    }

    pub fn command_by_id(&self, id: i64) -> Result<Option<Command>> {
        let db = self.db.lock().unwrap();
        let found = db
            .query_row(
                &format!("{} WHERE id = ?1", COMMAND_SELECT),
                params![id],
                row_to_command,
            )
            .optional()?;
        Ok(found)
    }

    pub fn list_commands(&self, prefix: Option<&str>) -> Result<Vec<Command>> {
        let db = self.db.lock().unwrap();
        let mut commands = Vec::new();
        match prefix {
            Some(p) => {
                let mut stmt = db.prepare(&format!(
                    "{} WHERE is_active = 1 AND prefix = ?1 ORDER BY command",
                    COMMAND_SELECT
                ))?;
                let rows = stmt.query_map(params![p], row_to_command)?;
                for row in rows {
                    commands.push(row?);
                }
            }
            None => {
                let mut stmt = db.prepare(&format!(
                    "{} WHERE is_active = 1 ORDER BY command",
                    COMMAND_SELECT
                ))?;
                let rows = stmt.query_map([], row_to_command)?;
                for row in rows {
                    commands.push(row?);
                }
            }
        }
        Ok(commands)
    }

    /// Active modules fired by `message_type` for this entity: trigger type
    /// event/both, subscribed to the event, and permission-enabled, in
    /// ascending priority order.
    pub fn event_modules(&self, message_type: &str, entity_id: &str) -> Result<Vec<Command>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{} JOIN entities e ON e.entity_id = ?1
               JOIN command_permissions p
                 ON p.command_id = c.id AND p.entity_id = e.id AND p.is_enabled = 1
              WHERE c.is_active = 1 AND c.trigger_type IN ('event', 'both')
              ORDER BY c.priority",
            COMMAND_SELECT
        ))?;
        let rows = stmt.query_map(params![entity_id], row_to_command)?;

        let mut modules = Vec::new();
        for row in rows {
            let command = row?;
            if command.event_types.iter().any(|t| t == message_type) {
                modules.push(command);
            }
        }
        Ok(modules)
    }

    // ── entities ──────────────────────────────────────────────────────────────

    /// Create the entity on first sight and return its canonical id.
    ///
    /// Discord/Slack events without a channel also get a server-wide entity
    /// group with this entity as its sole (default) member, so communities
    /// can later adopt the whole server at once.
    pub fn ensure_entity(
        &self,
        platform: &str,
        server_id: &str,
        channel_id: &str,
        owner: &str,
    ) -> Result<String> {
        let entity_id = waddle_core::types::entity_id(platform, server_id, channel_id);
        let now = Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO entities
             (entity_id, platform, server_id, channel_id, owner, is_active, config,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, '{}', ?6, ?6)",
            params![entity_id, platform, server_id, channel_id, owner, now],
        )?;

        if inserted > 0 {
            info!(%entity_id, "created new entity");
            if matches!(platform, "discord" | "slack") && channel_id.is_empty() {
                self.create_server_entity_group(&db, platform, server_id, &entity_id, owner)?;
            }
        }
        Ok(entity_id)
    }

    fn create_server_entity_group(
        &self,
        db: &Connection,
        platform: &str,
        server_id: &str,
        default_entity_id: &str,
        owner: &str,
    ) -> Result<()> {
        let exists: bool = db.query_row(
            "SELECT EXISTS(SELECT 1 FROM entity_groups WHERE platform = ?1 AND server_id = ?2)",
            params![platform, server_id],
            |r| r.get(0),
        )?;
        if exists {
            return Ok(());
        }

        let mut name = platform.to_string();
        if let Some(first) = name.get_mut(..1) {
            first.make_ascii_uppercase();
        }
        let now = Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO entity_groups
             (name, platform, server_id, entity_ids, community_id, is_active, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, 1, ?5, ?6)",
            params![
                format!("{} Server {}", name, server_id),
                platform,
                server_id,
                serde_json::to_string(&[default_entity_id])?,
                owner,
                now
            ],
        )?;
        info!(platform, server_id, "created server-wide entity group");
        Ok(())
    }

    pub fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        let db = self.db.lock().unwrap();
        let found = db
            .query_row(
                "SELECT id, entity_id, platform, server_id, channel_id, owner, is_active,
                        config, created_at
                 FROM entities WHERE entity_id = ?1",
                params![entity_id],
                row_to_entity,
            )
            .optional()?;
        Ok(found)
    }

    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, entity_id, platform, server_id, channel_id, owner, is_active,
                    config, created_at
             FROM entities WHERE is_active = 1
             ORDER BY platform, server_id",
        )?;
        let rows = stmt.query_map([], row_to_entity)?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    // ── permissions ───────────────────────────────────────────────────────────

    /// Enable or disable a command for an entity. The caller is responsible
    /// for invalidating the permission cache key.
    pub fn set_permission(&self, command_id: i64, entity_id: &str, enabled: bool) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let entity_row: Option<i64> = db
            .query_row(
                "SELECT id FROM entities WHERE entity_id = ?1",
                params![entity_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(entity_row) = entity_row else {
            return Ok(false);
        };

        db.execute(
            "INSERT INTO command_permissions
             (command_id, entity_id, is_enabled, config, usage_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, '{}', 0, ?4, ?4)
             ON CONFLICT(command_id, entity_id)
             DO UPDATE SET is_enabled = excluded.is_enabled, updated_at = excluded.updated_at",
            params![command_id, entity_row, enabled, now],
        )?;
        Ok(true)
    }

    /// Permission check on the dispatch hot path. Unknown entities have no
    /// permissions.
    pub fn permission_enabled(&self, command_id: i64, entity_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let enabled: bool = db.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM command_permissions p
                 JOIN entities e ON e.id = p.entity_id
                 WHERE p.command_id = ?1 AND e.entity_id = ?2 AND p.is_enabled = 1)",
            params![command_id, entity_id],
            |r| r.get(0),
        )?;
        Ok(enabled)
    }

    /// Bump usage tracking after a dispatch. Failures are swallowed — usage
    /// accounting must never fail an event.
    pub fn bump_usage(&self, command_id: i64, entity_id: &str) {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        if let Err(e) = db.execute(
            "UPDATE command_permissions
             SET usage_count = usage_count + 1, last_used = ?3
             WHERE command_id = ?1
               AND entity_id = (SELECT id FROM entities WHERE entity_id = ?2)",
            params![command_id, entity_id, now],
        ) {
            warn!(command_id, entity_id, error = %e, "usage bump failed");
        }
    }

    pub fn permission_usage(&self, command_id: i64, entity_id: &str) -> Result<Option<i64>> {
        let db = self.db.lock().unwrap();
        let count = db
            .query_row(
                "SELECT p.usage_count FROM command_permissions p
                 JOIN entities e ON e.id = p.entity_id
                 WHERE p.command_id = ?1 AND e.entity_id = ?2",
                params![command_id, entity_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(count)
    }

    // ── execution audit log ───────────────────────────────────────────────────

    /// Append one execution to the audit log. Never updated afterwards.
    pub fn record_execution(
        &self,
        request: &CommandRequest,
        command: &Command,
        result: &CommandResult,
        payload: &Value,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status = if result.success {
            ExecutionStatus::Success
        } else if result.status_code == 408 {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Failed
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO command_executions
             (execution_id, command_id, entity_id, user_id, user_name, message_content,
              parameters, location_url, request_payload, response_status, response_data,
              execution_time_ms, error_message, retry_count, status, created_at, completed_at)
             VALUES (?1, ?2,
                     (SELECT id FROM entities WHERE entity_id = ?3),
                     ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
            params![
                request.message_id,
                command.id,
                request.entity_id,
                request.user_id,
                request.user_name,
                request.raw_message,
                serde_json::to_string(&request.parameters)?,
                command.location_url,
                serde_json::to_string(payload)?,
                result.status_code,
                serde_json::to_string(&result.response_data)?,
                result.execution_time_ms,
                result.error_message,
                result.retry_count,
                status.as_str(),
                now,
            ],
        )?;
        Ok(())
    }

    /// Resolve an execution id to the data needed to validate a module reply.
    pub fn execution_by_id(&self, execution_id: &str) -> Result<Option<ExecutionInfo>> {
        let db = self.db.lock().unwrap();
        let found = db
            .query_row(
                "SELECT x.execution_id, x.command_id, COALESCE(e.entity_id, ''), x.status
                 FROM command_executions x
                 LEFT JOIN entities e ON e.id = x.entity_id
                 WHERE x.execution_id = ?1",
                params![execution_id],
                |row| {
                    Ok(ExecutionInfo {
                        execution_id: row.get(0)?,
                        command_id: row.get(1)?,
                        entity_id: row.get(2)?,
                        status: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    pub fn execution_status(&self, execution_id: &str) -> Result<Option<String>> {
        Ok(self.execution_by_id(execution_id)?.map(|x| x.status))
    }

    // ── module responses ──────────────────────────────────────────────────────

    pub fn insert_module_response(
        &self,
        action: ResponseAction,
        draft: &ModuleResponseDraft,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO module_responses
             (execution_id, module_name, success, response_action, response_data, chat_message,
              media_type, media_url, ticker_text, ticker_duration, form_title, form_description,
              form_fields, form_submit_url, form_submit_method, form_callback_url, content_type,
              content, duration, style, error_message, processing_time_ms, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,
                     ?21,?22,?23)",
            params![
                draft.execution_id,
                draft.module_name,
                draft.success,
                action.as_str(),
                serde_json::to_string(&draft.response_data)?,
                draft.chat_message,
                draft.media_type,
                draft.media_url,
                draft.ticker_text,
                draft.ticker_duration,
                draft.form_title,
                draft.form_description,
                draft.form_fields.as_ref().map(serde_json::to_string).transpose()?,
                draft.form_submit_url,
                draft.form_submit_method,
                draft.form_callback_url,
                draft.content_type,
                draft.content,
                draft.duration,
                draft.style.as_ref().map(serde_json::to_string).transpose()?,
                draft.error_message,
                draft.processing_time_ms,
                now,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn responses_for_execution(&self, execution_id: &str) -> Result<Vec<ModuleResponseRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{} WHERE execution_id = ?1 ORDER BY created_at",
            RESPONSE_SELECT
        ))?;
        let rows = stmt.query_map(params![execution_id], row_to_response)?;
        let mut responses = Vec::new();
        for row in rows {
            responses.push(row?);
        }
        Ok(responses)
    }

    pub fn recent_responses(
        &self,
        module_name: Option<&str>,
        action: Option<ResponseAction>,
        success_only: bool,
        limit: usize,
    ) -> Result<Vec<ModuleResponseRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{} WHERE (?1 IS NULL OR module_name = ?1)
                AND (?2 IS NULL OR response_action = ?2)
                AND (?3 = 0 OR success = 1)
              ORDER BY created_at DESC
              LIMIT ?4",
            RESPONSE_SELECT
        ))?;
        let rows = stmt.query_map(
            params![
                module_name,
                action.map(|a| a.as_str()),
                success_only,
                limit as i64
            ],
            row_to_response,
        )?;
        let mut responses = Vec::new();
        for row in rows {
            responses.push(row?);
        }
        Ok(responses)
    }

    // ── metrics ───────────────────────────────────────────────────────────────

    /// (total commands, total entities, total executions) for /router/metrics.
    pub fn totals(&self) -> Result<(i64, i64, i64)> {
        let db = self.db.lock().unwrap();
        let commands: i64 =
            db.query_row("SELECT COUNT(*) FROM commands WHERE is_active = 1", [], |r| {
                r.get(0)
            })?;
        let entities: i64 =
            db.query_row("SELECT COUNT(*) FROM entities WHERE is_active = 1", [], |r| {
                r.get(0)
            })?;
        let executions: i64 =
            db.query_row("SELECT COUNT(*) FROM command_executions", [], |r| r.get(0))?;
        Ok((commands, entities, executions))
    }

    /// (successful, failed, avg ms) for executions created after `since`.
    pub fn execution_stats_since(&self, since: &str) -> Result<(i64, i64, i64)> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT COALESCE(SUM(status = 'success'), 0),
                    COALESCE(SUM(status != 'success'), 0),
                    COALESCE(AVG(execution_time_ms), 0)
             FROM command_executions WHERE created_at > ?1",
            params![since],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, f64>(2)? as i64,
                ))
            },
        )
        .map_err(Into::into)
    }
}

const COMMAND_SELECT: &str = "SELECT c.id, c.command, c.prefix, c.description, c.location_url,
        c.location, c.type, c.method, c.timeout, c.headers, c.auth_required, c.rate_limit,
        c.is_active, c.module_type, c.module_id, c.version, c.trigger_type, c.event_types,
        c.priority, c.execution_mode
 FROM commands c";

const RESPONSE_SELECT: &str = "SELECT id, execution_id, module_name, success, response_action,
        response_data, chat_message, media_type, media_url, ticker_text, ticker_duration,
        form_title, form_description, form_fields, form_submit_url, form_submit_method,
        form_callback_url, content_type, content, duration, style, error_message,
        processing_time_ms, created_at
 FROM module_responses";

fn row_to_command(row: &rusqlite::Row<'_>) -> rusqlite::Result<Command> {
    let kind: String = row.get(6)?;
    let headers: Option<String> = row.get(9)?;
    let trigger: String = row.get(16)?;
    let event_types: String = row.get(17)?;
    let mode: String = row.get(19)?;

    Ok(Command {
        id: row.get(0)?,
        command: row.get(1)?,
        prefix: row.get(2)?,
        description: row.get(3)?,
        location_url: row.get(4)?,
        location: row.get(5)?,
        kind: CommandType::parse(&kind).unwrap_or(CommandType::Container),
        method: row.get(7)?,
        timeout_secs: row.get::<_, i64>(8)? as u64,
        headers: headers.and_then(|h| serde_json::from_str(&h).ok()),
        auth_required: row.get(10)?,
        rate_limit: row.get::<_, i64>(11)? as u32,
        is_active: row.get(12)?,
        module_type: row.get(13)?,
        module_id: row.get(14)?,
        version: row.get(15)?,
        trigger_type: TriggerType::parse(&trigger).unwrap_or(TriggerType::Command),
        event_types: serde_json::from_str(&event_types).unwrap_or_default(),
        priority: row.get(18)?,
        execution_mode: ExecutionMode::parse(&mode).unwrap_or(ExecutionMode::Sequential),
    })
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    let config: String = row.get(7)?;
    Ok(Entity {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        platform: row.get(2)?,
        server_id: row.get(3)?,
        channel_id: row.get(4)?,
        owner: row.get(5)?,
        is_active: row.get(6)?,
        config: serde_json::from_str(&config).unwrap_or(Value::Null),
        created_at: row.get(8)?,
    })
}

fn row_to_response(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModuleResponseRow> {
    let action: String = row.get(4)?;
    let response_data: Option<String> = row.get(5)?;
    let form_fields: Option<String> = row.get(13)?;
    let style: Option<String> = row.get(20)?;

    Ok(ModuleResponseRow {
        id: row.get(0)?,
        action: ResponseAction::parse(&action).unwrap_or(ResponseAction::General),
        draft: ModuleResponseDraft {
            execution_id: row.get(1)?,
            module_name: row.get(2)?,
            success: row.get(3)?,
            response_data: response_data
                .and_then(|d| serde_json::from_str(&d).ok())
                .unwrap_or(Value::Null),
            chat_message: row.get(6)?,
            media_type: row.get(7)?,
            media_url: row.get(8)?,
            ticker_text: row.get(9)?,
            ticker_duration: row.get(10)?,
            form_title: row.get(11)?,
            form_description: row.get(12)?,
            form_fields: form_fields.and_then(|f| serde_json::from_str(&f).ok()),
            form_submit_url: row.get(14)?,
            form_submit_method: row.get(15)?,
            form_callback_url: row.get(16)?,
            content_type: row.get(17)?,
            content: row.get(18)?,
            duration: row.get(19)?,
            style: style.and_then(|s| serde_json::from_str(&s).ok()),
            error_message: row.get(21)?,
            processing_time_ms: row.get(22)?,
        },
        created_at: row.get(23)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> RegistryStore {
        RegistryStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn draft(name: &str) -> CommandDraft {
        CommandDraft {
            command: name.to_string(),
            prefix: "!".to_string(),
            description: None,
            location_url: format!("http://modules/{}", name),
            location: "internal".to_string(),
            kind: CommandType::Container,
            method: "POST".to_string(),
            timeout_secs: 30,
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
        }
    }

    #[test]
    fn command_round_trip() {
        let s = store();
        let created = s.create_command(&draft("help")).unwrap();
        let found = s.find_command("!", "help").unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.kind, CommandType::Container);

        assert!(s.find_command("#", "help").unwrap().is_none());
        assert!(s.set_command_active(created.id, false).unwrap());
        assert!(s.find_command("!", "help").unwrap().is_none());
    }

    #[test]
    fn ensure_entity_is_idempotent() {
        let s = store();
        let first = s.ensure_entity("twitch", "42", "", "alice").unwrap();
        let second = s.ensure_entity("twitch", "42", "", "bob").unwrap();
        assert_eq!(first, "twitch+42");
        assert_eq!(first, second);
        assert_eq!(s.list_entities().unwrap().len(), 1);
        assert_eq!(s.get_entity("twitch+42").unwrap().unwrap().owner, "alice");
    }

    #[test]
    fn discord_server_event_creates_entity_group() {
        let s = store();
        s.ensure_entity("discord", "g1", "", "alice").unwrap();

        let db = s.db.lock().unwrap();
        let (name, entity_ids): (String, String) = db
            .query_row(
                "SELECT name, entity_ids FROM entity_groups WHERE platform='discord' AND server_id='g1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, "Discord Server g1");
        assert_eq!(entity_ids, "[\"discord+g1\"]");
    }

    #[test]
    fn permission_toggle_and_usage() {
        let s = store();
        let cmd = s.create_command(&draft("help")).unwrap();
        s.ensure_entity("twitch", "42", "", "alice").unwrap();

        assert!(!s.permission_enabled(cmd.id, "twitch+42").unwrap());
        assert!(s.set_permission(cmd.id, "twitch+42", true).unwrap());
        assert!(s.permission_enabled(cmd.id, "twitch+42").unwrap());

        s.bump_usage(cmd.id, "twitch+42");
        assert_eq!(s.permission_usage(cmd.id, "twitch+42").unwrap(), Some(1));

        assert!(s.set_permission(cmd.id, "twitch+42", false).unwrap());
        assert!(!s.permission_enabled(cmd.id, "twitch+42").unwrap());
        // Unknown entity: no permission row can exist.
        assert!(!s.set_permission(cmd.id, "discord+0", true).unwrap());
    }

    #[test]
    fn event_modules_filter_by_type_and_permission() {
        let s = store();
        s.ensure_entity("twitch", "42", "", "alice").unwrap();

        let mut greeter = draft("greeter");
        greeter.trigger_type = TriggerType::Event;
        greeter.event_types = vec!["member_join".to_string()];
        greeter.priority = 10;
        let greeter = s.create_command(&greeter).unwrap();

        let mut logger = draft("logger");
        logger.trigger_type = TriggerType::Both;
        logger.event_types = vec!["member_join".to_string(), "chatMessage".to_string()];
        logger.priority = 5;
        let logger = s.create_command(&logger).unwrap();

        // No permissions yet: nothing fires.
        assert!(s.event_modules("member_join", "twitch+42").unwrap().is_empty());

        s.set_permission(greeter.id, "twitch+42", true).unwrap();
        s.set_permission(logger.id, "twitch+42", true).unwrap();

        let fired = s.event_modules("member_join", "twitch+42").unwrap();
        let names: Vec<&str> = fired.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(names, vec!["logger", "greeter"]); // priority order

        let fired = s.event_modules("chatMessage", "twitch+42").unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].command, "logger");
    }

    #[test]
    fn execution_log_links_entity_and_responses() {
        let s = store();
        let cmd = s.create_command(&draft("help")).unwrap();
        s.ensure_entity("twitch", "42", "", "alice").unwrap();

        let request = waddle_core::types::parse_message(
            "!help please",
            "twitch",
            "42",
            "",
            "u1",
            "alice",
        )
        .unwrap();
        let result = CommandResult {
            success: true,
            response_data: json!({"text": "ok"}),
            execution_time_ms: 12,
            status_code: 200,
            error_message: None,
            retry_count: 0,
        };
        s.record_execution(&request, &cmd, &result, &json!({"command": "help"}))
            .unwrap();

        let info = s.execution_by_id(&request.message_id).unwrap().unwrap();
        assert_eq!(info.entity_id, "twitch+42");
        assert_eq!(info.status, "success");

        let reply = ModuleResponseDraft {
            execution_id: request.message_id.clone(),
            module_name: "helper".to_string(),
            success: true,
            chat_message: Some("hi".to_string()),
            ..Default::default()
        };
        s.insert_module_response(ResponseAction::Chat, &reply).unwrap();

        let stored = s.responses_for_execution(&request.message_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].action, ResponseAction::Chat);
        assert_eq!(stored[0].draft.chat_message.as_deref(), Some("hi"));
    }

    #[test]
    fn recent_responses_apply_filters() {
        let s = store();
        for (module, ok) in [("a", true), ("a", false), ("b", true)] {
            let reply = ModuleResponseDraft {
                execution_id: "x1".to_string(),
                module_name: module.to_string(),
                success: ok,
                ..Default::default()
            };
            s.insert_module_response(ResponseAction::Chat, &reply).unwrap();
        }

        assert_eq!(s.recent_responses(None, None, false, 10).unwrap().len(), 3);
        assert_eq!(s.recent_responses(Some("a"), None, false, 10).unwrap().len(), 2);
        assert_eq!(s.recent_responses(None, None, true, 10).unwrap().len(), 2);
        assert_eq!(
            s.recent_responses(Some("a"), Some(ResponseAction::Chat), true, 10)
                .unwrap()
                .len(),
            1
        );
    }
}
