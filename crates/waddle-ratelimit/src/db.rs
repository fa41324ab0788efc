use rusqlite::{params, Connection};

/// Initialise the rate-limit window bucket table.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS rate_limits (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            command_id    INTEGER NOT NULL,
            entity_id     TEXT NOT NULL,
            user_id       TEXT NOT NULL,
            window_start  TEXT NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_rate_limits_window
            ON rate_limits(command_id, entity_id, user_id, window_start);",
    )?;
    Ok(())
}

/// Upsert the bucket for the current minute, bumping its hit counter.
pub fn record_hit(
    conn: &Connection,
    command_id: i64,
    entity_id: &str,
    user_id: &str,
    window_start: &str,
    now: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO rate_limits
            (command_id, entity_id, user_id, window_start, request_count, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)
         ON CONFLICT(command_id, entity_id, user_id, window_start)
         DO UPDATE SET request_count = request_count + 1",
        params![command_id, entity_id, user_id, window_start, now],
    )?;
    Ok(())
}

/// Hit count recorded for one bucket (0 when absent).
pub fn bucket_count(
    conn: &Connection,
    command_id: i64,
    entity_id: &str,
    user_id: &str,
    window_start: &str,
) -> rusqlite::Result<i64> {
    match conn.query_row(
        "SELECT request_count FROM rate_limits
         WHERE command_id = ?1 AND entity_id = ?2 AND user_id = ?3 AND window_start = ?4",
        params![command_id, entity_id, user_id, window_start],
        |row| row.get(0),
    ) {
        Ok(count) => Ok(count),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e),
    }
}
