use rusqlite::Connection;

use crate::error::Result;

/// Initialise the string-match rule table.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stringmatch (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            pattern            TEXT NOT NULL,
            match_type         TEXT NOT NULL DEFAULT 'exact',
            case_sensitive     INTEGER NOT NULL DEFAULT 0,
            enabled_entity_ids TEXT NOT NULL DEFAULT '[]',
            action             TEXT NOT NULL,
            command_to_execute TEXT,
            command_parameters TEXT NOT NULL DEFAULT '[]',
            webhook_url        TEXT,
            warning_message    TEXT,
            block_message      TEXT,
            priority           INTEGER NOT NULL DEFAULT 100,
            is_active          INTEGER NOT NULL DEFAULT 1,
            match_count        INTEGER NOT NULL DEFAULT 0,
            last_matched       TEXT,
            created_by         TEXT NOT NULL DEFAULT 'system',
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stringmatch_active
            ON stringmatch(is_active, priority);",
    )?;
    Ok(())
}
