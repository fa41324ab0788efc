use rusqlite::Connection;

use crate::error::Result;

/// Initialise the service-account and usage-log tables.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS service_accounts (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            account_name TEXT NOT NULL UNIQUE,
            account_type TEXT NOT NULL,
            platform     TEXT,
            api_key_hash TEXT NOT NULL UNIQUE,
            permissions  TEXT NOT NULL DEFAULT '[]',
            is_active    INTEGER NOT NULL DEFAULT 1,
            last_used    TEXT,
            usage_count  INTEGER NOT NULL DEFAULT 0,
            rate_limit   INTEGER NOT NULL DEFAULT 1000,
            expires_at   TEXT,
            created_by   TEXT,
            description  TEXT,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_service_accounts_key
            ON service_accounts(api_key_hash, is_active);

        CREATE TABLE IF NOT EXISTS api_usage (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            service_account_id INTEGER NOT NULL,
            endpoint           TEXT NOT NULL,
            method             TEXT NOT NULL,
            ip_address         TEXT,
            user_agent         TEXT,
            response_status    INTEGER,
            response_time_ms   INTEGER,
            request_size       INTEGER,
            response_size      INTEGER,
            timestamp          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_usage_account_time
            ON api_usage(service_account_id, timestamp);",
    )?;
    Ok(())
}
