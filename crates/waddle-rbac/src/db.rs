use rusqlite::Connection;

use crate::error::Result;

/// Initialise the RBAC tables.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
/// `entity_groups` is owned by the command registry; the identical
/// `IF NOT EXISTS` definition here lets the resolver run against a
/// database where only the RBAC schema has been initialised (tests,
/// standalone tooling).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS communities (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            name          TEXT NOT NULL,
            owners        TEXT NOT NULL DEFAULT '[]',
            entity_groups TEXT NOT NULL DEFAULT '[]',
            member_ids    TEXT NOT NULL DEFAULT '[]',
            description   TEXT,
            is_active     INTEGER NOT NULL DEFAULT 1,
            settings      TEXT NOT NULL DEFAULT '{}',
            created_by    TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS community_memberships (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            community_id INTEGER NOT NULL,
            user_id      TEXT NOT NULL,
            joined_at    TEXT NOT NULL,
            is_active    INTEGER NOT NULL DEFAULT 1,
            invited_by   TEXT,
            UNIQUE(community_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_memberships_lookup
            ON community_memberships(community_id, user_id, is_active);

        CREATE TABLE IF NOT EXISTS community_rbac (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            community_id INTEGER NOT NULL,
            user_id      TEXT NOT NULL,
            role         TEXT NOT NULL DEFAULT 'user',
            assigned_by  TEXT,
            assigned_at  TEXT NOT NULL,
            is_active    INTEGER NOT NULL DEFAULT 1,
            UNIQUE(community_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_community_rbac_lookup
            ON community_rbac(community_id, user_id, is_active);

        CREATE TABLE IF NOT EXISTS entity_roles (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id   TEXT NOT NULL,
            user_id     TEXT NOT NULL,
            role        TEXT NOT NULL,
            assigned_by TEXT,
            assigned_at TEXT NOT NULL,
            is_active   INTEGER NOT NULL DEFAULT 1,
            UNIQUE(entity_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_entity_roles_lookup
            ON entity_roles(entity_id, user_id, is_active);

        CREATE TABLE IF NOT EXISTS rbac_permissions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            description TEXT,
            category    TEXT NOT NULL DEFAULT 'general',
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
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
            ON entity_groups(platform, server_id, is_active);",
    )?;
    Ok(())
}
