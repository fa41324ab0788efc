use rusqlite::Connection;

use crate::error::Result;

/// Initialise the sessions table and its indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id    TEXT PRIMARY KEY,
            entity_id     TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            last_activity TEXT NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 0,
            expires_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_expiry
            ON sessions(expires_at);
        CREATE INDEX IF NOT EXISTS idx_sessions_entity
            ON sessions(entity_id);",
    )?;
    Ok(())
}
