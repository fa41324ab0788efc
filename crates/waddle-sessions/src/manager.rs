use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SessionError};
use crate::types::{Session, SessionStats};

/// Thread-safe store for interaction sessions.
///
/// Sessions live in the shared relational store, so every router replica
/// pointed at the same database sees the same sessions. Expiry is a row
/// attribute: expired rows are invisible to reads and purged by
/// `cleanup_expired`.
pub struct SessionStore {
    db: Mutex<Connection>,
    ttl: Duration,
}

impl SessionStore {
    /// Wrap an already-open connection and initialise the schema.
    pub fn new(conn: Connection, ttl_secs: u64) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            ttl: Duration::seconds(ttl_secs as i64),
        })
    }

    /// Mint a new session for an entity and return its id.
    pub fn create(&self, entity_id: &str) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let expires = (now + self.ttl).to_rfc3339();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions
             (session_id, entity_id, created_at, last_activity, request_count, expires_at)
             VALUES (?1, ?2, ?3, ?3, 0, ?4)",
            rusqlite::params![session_id, entity_id, now_str, expires],
        )?;

        debug!(%session_id, entity_id, "session created");
        Ok(session_id)
    }

    /// Retrieve a session, returning `None` when it is unknown or expired.
    pub fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT session_id, entity_id, created_at, last_activity, request_count, expires_at
             FROM sessions
             WHERE session_id = ?1 AND expires_at > ?2",
            rusqlite::params![session_id, now],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// The entity a live session belongs to.
    pub fn entity_id(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.get(session_id)?.map(|s| s.entity_id))
    }

    /// Record activity: bump `request_count`, refresh `last_activity`, and
    /// push the expiry out by the full TTL. Returns false for unknown or
    /// already-expired sessions.
    pub fn touch(&self, session_id: &str) -> Result<bool> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let expires = (now + self.ttl).to_rfc3339();

        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE sessions
             SET last_activity = ?2, request_count = request_count + 1, expires_at = ?3
             WHERE session_id = ?1 AND expires_at > ?2",
            rusqlite::params![session_id, now_str, expires],
        )?;
        Ok(rows > 0)
    }

    /// True iff the session is live and was minted for `entity_id`.
    pub fn validate(&self, session_id: &str, entity_id: &str) -> Result<bool> {
        match self.get(session_id)? {
            Some(session) => {
                let ok = session.entity_id == entity_id;
                if !ok {
                    warn!(
                        %session_id,
                        expected = entity_id,
                        actual = %session.entity_id,
                        "session entity mismatch"
                    );
                }
                Ok(ok)
            }
            None => Ok(false),
        }
    }

    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            rusqlite::params![session_id],
        )?;
        Ok(rows > 0)
    }

    /// Purge expired rows. Returns the number removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let removed = db.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;
        if removed > 0 {
            debug!(removed, "purged expired sessions");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<SessionStats> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let total: u64 = db.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        let (active, requests): (u64, u64) = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(request_count), 0)
             FROM sessions WHERE expires_at > ?1",
            rusqlite::params![now],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(SessionStats {
            total_sessions: total,
            active_sessions: active,
            total_requests: requests,
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        entity_id: row.get(1)?,
        created_at: row.get(2)?,
        last_activity: row.get(3)?,
        request_count: row.get::<_, i64>(4)? as u32,
        expires_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl_secs: u64) -> SessionStore {
        SessionStore::new(Connection::open_in_memory().unwrap(), ttl_secs).unwrap()
    }

    #[test]
    fn create_then_get_round_trips() {
        let s = store(3600);
        let id = s.create("twitch+42").unwrap();
        let session = s.get(&id).unwrap().unwrap();
        assert_eq!(session.entity_id, "twitch+42");
        assert_eq!(session.request_count, 0);
    }

    #[test]
    fn touch_extends_expiry_and_counts() {
        let s = store(3600);
        let id = s.create("twitch+42").unwrap();
        let before = s.get(&id).unwrap().unwrap().expires_at;

        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(s.touch(&id).unwrap());

        let after = s.get(&id).unwrap().unwrap();
        assert_eq!(after.request_count, 1);
        assert!(after.expires_at > before);
    }

    #[test]
    fn expired_sessions_are_invisible() {
        let s = store(0);
        let id = s.create("twitch+42").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        assert!(s.get(&id).unwrap().is_none());
        assert!(!s.touch(&id).unwrap());
        assert_eq!(s.cleanup_expired().unwrap(), 1);
    }

    #[test]
    fn validate_requires_matching_entity() {
        let s = store(3600);
        let id = s.create("twitch+42").unwrap();
        assert!(s.validate(&id, "twitch+42").unwrap());
        assert!(!s.validate(&id, "discord+1+2").unwrap());
        assert!(!s.validate("missing", "twitch+42").unwrap());
    }

    #[test]
    fn delete_makes_get_miss() {
        let s = store(3600);
        let id = s.create("twitch+42").unwrap();
        assert!(s.delete(&id).unwrap());
        assert!(s.get(&id).unwrap().is_none());
        assert!(!s.delete(&id).unwrap());
    }

    #[test]
    fn stats_count_active_only() {
        let s = store(3600);
        let id = s.create("twitch+42").unwrap();
        s.touch(&id).unwrap();
        s.create("discord+1").unwrap();

        let stats = s.stats().unwrap();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.total_requests, 1);
    }
}
