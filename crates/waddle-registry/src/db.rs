use rusqlite::Connection;

use crate::error::Result;

/// Initialise the dispatch-core tables and their hot-path indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
/// `entity_groups` is shared with the RBAC resolver, which reads it to map
/// an entity onto its community.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS commands (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            command        TEXT NOT NULL,
            prefix         TEXT NOT NULL,
            description    TEXT,
            location_url   TEXT NOT NULL,
            location       TEXT NOT NULL,
            type           TEXT NOT NULL,
            method         TEXT NOT NULL DEFAULT 'POST',
            timeout        INTEGER NOT NULL DEFAULT 30,
            headers        TEXT,
            auth_required  INTEGER NOT NULL DEFAULT 0,
            rate_limit     INTEGER NOT NULL DEFAULT 0,
            is_active      INTEGER NOT NULL DEFAULT 1,
            module_type    TEXT NOT NULL DEFAULT 'local',
            module_id      TEXT,
            version        TEXT NOT NULL DEFAULT '1.0',
            trigger_type   TEXT NOT NULL DEFAULT 'command',
            event_types    TEXT NOT NULL DEFAULT '[]',
            priority       INTEGER NOT NULL DEFAULT 100,
            execution_mode TEXT NOT NULL DEFAULT 'sequential',
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            UNIQUE(prefix, command)
        );
        CREATE INDEX IF NOT EXISTS idx_commands_lookup
            ON commands(prefix, command, is_active);
        CREATE INDEX IF NOT EXISTS idx_commands_trigger
            ON commands(trigger_type, is_active);

        CREATE TABLE IF NOT EXISTS entities (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id  TEXT NOT NULL UNIQUE,
            platform   TEXT NOT NULL,
            server_id  TEXT NOT NULL,
            channel_id TEXT NOT NULL DEFAULT '',
            owner      TEXT NOT NULL,
            is_active  INTEGER NOT NULL DEFAULT 1,
            config     TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entity_groups (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT NOT NULL,
            platform     TEXT NOT NULL,
            server_id    TEXT NOT NULL,
            entity_ids   TEXT NOT NULL DEFAULT '[]',
            community_id INTEGER,
            is_active    INTEGER NOT NULL DEFAULT 1,
            created_by   TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entity_groups_server
            ON entity_groups(platform, server_id, is_active);

        CREATE TABLE IF NOT EXISTS command_permissions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            command_id  INTEGER NOT NULL,
            entity_id   INTEGER NOT NULL,
            is_enabled  INTEGER NOT NULL DEFAULT 1,
            config      TEXT NOT NULL DEFAULT '{}',
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used   TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(command_id, entity_id)
        );
        CREATE INDEX IF NOT EXISTS idx_command_permissions_lookup
            ON command_permissions(command_id, entity_id, is_enabled);

        CREATE TABLE IF NOT EXISTS command_executions (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id      TEXT NOT NULL UNIQUE,
            command_id        INTEGER NOT NULL,
            entity_id         INTEGER,
            user_id           TEXT NOT NULL,
            user_name         TEXT,
            message_content   TEXT,
            parameters        TEXT NOT NULL DEFAULT '[]',
            location_url      TEXT,
            request_payload   TEXT,
            response_status   INTEGER,
            response_data     TEXT,
            execution_time_ms INTEGER,
            error_message     TEXT,
            retry_count       INTEGER NOT NULL DEFAULT 0,
            status            TEXT NOT NULL DEFAULT 'pending',
            created_at        TEXT NOT NULL,
            completed_at      TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_command_executions_created
            ON command_executions(created_at);

        CREATE TABLE IF NOT EXISTS module_responses (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id       TEXT NOT NULL,
            module_name        TEXT NOT NULL,
            success            INTEGER NOT NULL,
            response_action    TEXT NOT NULL,
            response_data      TEXT,
            chat_message       TEXT,
            media_type         TEXT,
            media_url          TEXT,
            ticker_text        TEXT,
            ticker_duration    INTEGER,
            form_title         TEXT,
            form_description   TEXT,
            form_fields        TEXT,
            form_submit_url    TEXT,
            form_submit_method TEXT,
            form_callback_url  TEXT,
            content_type       TEXT,
            content            TEXT,
            duration           INTEGER,
            style              TEXT,
            error_message      TEXT,
            processing_time_ms INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_module_responses_execution
            ON module_responses(execution_id);
        CREATE INDEX IF NOT EXISTS idx_module_responses_created
            ON module_responses(created_at);",
    )?;
    Ok(())
}
