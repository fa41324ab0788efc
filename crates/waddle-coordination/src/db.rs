use rusqlite::Connection;

use crate::error::Result;

/// Initialise the coordination table (single source of truth for leases)
/// and the servers table it can be populated from.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS coordination (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            platform      TEXT NOT NULL,
            server_id     TEXT NOT NULL,
            channel_id    TEXT,
            entity_id     TEXT NOT NULL UNIQUE,
            claimed_by    TEXT,
            claimed_at    TEXT,
            claim_expires TEXT,
            last_checkin  TEXT,
            last_check    TEXT,
            last_activity TEXT,
            live_since    TEXT,
            status        TEXT NOT NULL DEFAULT 'available',
            is_live       INTEGER NOT NULL DEFAULT 0,
            viewer_count  INTEGER NOT NULL DEFAULT 0,
            error_count   INTEGER NOT NULL DEFAULT 0,
            metadata      TEXT,
            priority      INTEGER NOT NULL DEFAULT 100,
            config        TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_coordination_claiming
            ON coordination(platform, status, priority);
        CREATE INDEX IF NOT EXISTS idx_coordination_claims
            ON coordination(claimed_by, claim_expires);

        CREATE TABLE IF NOT EXISTS servers (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            owner         TEXT NOT NULL,
            platform      TEXT NOT NULL,
            channel       TEXT NOT NULL,
            server_id     TEXT,
            is_active     INTEGER NOT NULL DEFAULT 1,
            webhook_url   TEXT,
            config        TEXT,
            last_activity TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );",
    )?;
    Ok(())
}
