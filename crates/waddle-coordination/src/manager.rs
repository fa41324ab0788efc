use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::Result;
use crate::types::{
    ClaimResult, CoordinationEntry, CoordinationStats, EntryStatus, HeartbeatSnapshot,
};

/// How long a claim lasts before it must be renewed.
const CLAIM_DURATION_MINS: i64 = 30;
/// Containers check in every 5 minutes; 6 allows one missed beat before
/// the row becomes claimable again.
const CHECKIN_TIMEOUT_MINS: i64 = 6;
/// Consecutive errors before a row is parked in `error` status.
const ERROR_THRESHOLD: i64 = 3;

/// Stable identity for a collector container: random tag + boot timestamp.
pub fn generate_container_id() -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!("container_{}_{}", &tag[..8], Utc::now().timestamp())
}

/// Lease manager dividing monitored channels across collector containers.
///
/// The coordination table is the single source of truth. Claims go through
/// a WHERE-guarded UPDATE that re-checks availability inside the
/// statement, so two containers racing for the same row cannot both win:
/// only the statement that actually changed the row counts.
pub struct Coordinator {
    db: Mutex<Connection>,
}

impl Coordinator {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Claim up to `max_claims` available rows on a platform for one
    /// container. Expired claims are swept first; candidates are ranked
    /// live-first, then priority, viewer count, and staleness of activity.
    pub fn claim(
        &self,
        container_id: &str,
        platform: &str,
        max_claims: usize,
    ) -> Result<ClaimResult> {
        self.cleanup_expired_claims()?;

        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let deadline = (now - Duration::minutes(CHECKIN_TIMEOUT_MINS)).to_rfc3339();
        let expires = (now + Duration::minutes(CLAIM_DURATION_MINS)).to_rfc3339();

        let db = self.db.lock().unwrap();

        // Over-fetch candidates: some may be lost to concurrent claimers
        // between the select and the guarded update.
        let candidate_ids: Vec<i64> = {
            let mut stmt = db.prepare(
                "SELECT id FROM coordination
                 WHERE platform = ?1
                   AND (claimed_by IS NULL OR claim_expires < ?2 OR last_checkin < ?3)
                   AND status IN ('available', 'live', 'offline')
                 ORDER BY is_live DESC, priority ASC, viewer_count DESC, last_activity ASC
                 LIMIT ?4",
                )?;
            let rows = stmt.query_map(
                params![platform, now_str, deadline, (max_claims * 2) as i64],
                |r| r.get(0),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut claimed = Vec::new();
        for id in candidate_ids {
            if claimed.len() >= max_claims {
                break;
            }
            // Compare-and-set: the availability predicate is re-checked
            // inside the UPDATE, and only a row actually updated counts.
            let won = db.execute(
                "UPDATE coordination
                 SET claimed_by = ?2, claimed_at = ?3, claim_expires = ?4,
                     last_checkin = ?3, status = 'claimed', updated_at = ?3
                 WHERE id = ?1
                   AND (claimed_by IS NULL OR claim_expires < ?3 OR last_checkin < ?5)
                   AND status IN ('available', 'live', 'offline')",
                params![id, container_id, now_str, expires, deadline],
            )?;
            if won == 1 {
                if let Some(entry) = entry_by_row_id(&db, id)? {
                    debug!(entity_id = %entry.entity_id, container_id, "claimed entity");
                    claimed.push(entry);
                }
            }
        }

        if !claimed.is_empty() {
            info!(container_id, platform, count = claimed.len(), "entities claimed");
        }
        Ok(ClaimResult {
            claimed_entities: claimed,
        })
    }

    /// Release this container's claims — all of them, or a subset.
    pub fn release(&self, container_id: &str, entity_ids: Option<&[String]>) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let released = match entity_ids {
            Some(ids) => {
                let mut total = 0;
                for entity_id in ids {
                    total += db.execute(
                        "UPDATE coordination
                         SET claimed_by = NULL, claimed_at = NULL, claim_expires = NULL,
                             status = 'available', updated_at = ?3
                         WHERE claimed_by = ?1 AND entity_id = ?2",
                        params![container_id, entity_id, now],
                    )?;
                }
                total
            }
            None => db.execute(
                "UPDATE coordination
                 SET claimed_by = NULL, claimed_at = NULL, claim_expires = NULL,
                     status = 'available', updated_at = ?2
                 WHERE claimed_by = ?1",
                params![container_id, now],
            )?,
        };
        info!(container_id, released, "released entities");
        Ok(released)
    }

    /// Renew all claims held by a container. Expected every 5 minutes.
    pub fn checkin(&self, container_id: &str) -> Result<usize> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let expires = (now + Duration::minutes(CLAIM_DURATION_MINS)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let updated = db.execute(
            "UPDATE coordination
             SET last_checkin = ?2, claim_expires = ?3, updated_at = ?2
             WHERE claimed_by = ?1",
            params![container_id, now_str, expires],
        )?;
        debug!(container_id, updated, "checkin");
        Ok(updated)
    }

    /// Checkin plus a snapshot of everything the container holds.
    pub fn heartbeat(&self, container_id: &str, extend_claims: bool) -> Result<HeartbeatSnapshot> {
        let now = Utc::now();
        if extend_claims {
            self.checkin(container_id)?;
        }
        let entities = self.claimed_entities(container_id)?;
        Ok(HeartbeatSnapshot {
            container_id: container_id.to_string(),
            timestamp: now.to_rfc3339(),
            claimed_count: entities.len(),
            entities,
        })
    }

    /// Update live/viewer/activity state on a row this container holds.
    /// Returns false when the row is not claimed by the caller.
    pub fn update_status(
        &self,
        container_id: &str,
        entity_id: &str,
        is_live: Option<bool>,
        viewer_count: Option<i64>,
        metadata: Option<&Value>,
        has_activity: bool,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        let current: Option<(bool, i64)> = db
            .query_row(
                "SELECT is_live, id FROM coordination
                 WHERE entity_id = ?1 AND claimed_by = ?2",
                params![entity_id, container_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((was_live, row_id)) = current else {
            return Ok(false);
        };

        // A status update doubles as a checkin for this row.
        db.execute(
            "UPDATE coordination SET last_check = ?2, last_checkin = ?2, updated_at = ?2
             WHERE id = ?1",
            params![row_id, now],
        )?;

        match is_live {
            Some(true) => {
                if !was_live {
                    db.execute(
                        "UPDATE coordination
                         SET is_live = 1, live_since = ?2, status = 'live'
                         WHERE id = ?1",
                        params![row_id, now],
                    )?;
                } else {
                    db.execute("UPDATE coordination SET is_live = 1 WHERE id = ?1", params![row_id])?;
                }
            }
            Some(false) => {
                db.execute(
                    "UPDATE coordination
                     SET is_live = 0, live_since = NULL, status = 'offline'
                     WHERE id = ?1",
                    params![row_id],
                )?;
            }
            None => {}
        }

        if let Some(count) = viewer_count {
            db.execute(
                "UPDATE coordination SET viewer_count = ?2 WHERE id = ?1",
                params![row_id, count],
            )?;
        }
        if let Some(meta) = metadata {
            db.execute(
                "UPDATE coordination SET metadata = ?2 WHERE id = ?1",
                params![row_id, serde_json::to_string(meta)?],
            )?;
        }
        if has_activity {
            db.execute(
                "UPDATE coordination SET last_activity = ?2, error_count = 0 WHERE id = ?1",
                params![row_id, now],
            )?;
        }
        Ok(true)
    }

    /// Record a collector error against a claimed row; three consecutive
    /// errors park it in `error` status.
    pub fn report_error(
        &self,
        container_id: &str,
        entity_id: &str,
        error_message: &str,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        let current: Option<i64> = db
            .query_row(
                "SELECT error_count FROM coordination
                 WHERE entity_id = ?1 AND claimed_by = ?2",
                params![entity_id, container_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(error_count) = current else {
            return Ok(false);
        };

        let new_count = error_count + 1;
        if new_count >= ERROR_THRESHOLD {
            db.execute(
                "UPDATE coordination
                 SET error_count = ?3, status = 'error', last_check = ?4, updated_at = ?4
                 WHERE entity_id = ?1 AND claimed_by = ?2",
                params![entity_id, container_id, new_count, now],
            )?;
        } else {
            db.execute(
                "UPDATE coordination
                 SET error_count = ?3, last_check = ?4, updated_at = ?4
                 WHERE entity_id = ?1 AND claimed_by = ?2",
                params![entity_id, container_id, new_count, now],
            )?;
        }
        warn!(entity_id, container_id, error_count = new_count, error_message, "entity error reported");
        Ok(true)
    }

    /// Release rows that have gone offline and immediately try to claim an
    /// equal number of replacements on the same platform.
    pub fn release_offline(&self, container_id: &str) -> Result<(Vec<String>, ClaimResult)> {
        let now = Utc::now().to_rfc3339();
        let offline: Vec<(String, String)> = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT entity_id, platform FROM coordination
                 WHERE claimed_by = ?1 AND is_live = 0 AND status = 'offline'",
            )?;
            let rows = stmt.query_map(params![container_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
            let offline: Vec<(String, String)> = rows.collect::<rusqlite::Result<_>>()?;

            for (entity_id, _) in &offline {
                db.execute(
                    "UPDATE coordination
                     SET claimed_by = NULL, claimed_at = NULL, claim_expires = NULL,
                         last_checkin = NULL, status = 'available', updated_at = ?3
                     WHERE entity_id = ?1 AND claimed_by = ?2",
                    params![entity_id, container_id, now],
                )?;
                info!(entity_id, container_id, "released offline entity");
            }
            offline
        };

        let replacements = match offline.first() {
            Some((_, platform)) => self.claim(container_id, platform, offline.len())?,
            None => ClaimResult {
                claimed_entities: Vec::new(),
            },
        };
        let released = offline.into_iter().map(|(entity_id, _)| entity_id).collect();
        Ok((released, replacements))
    }

    /// Sweep claims whose lease expired or whose container missed its
    /// checkin window. Post-condition: every claimed row has a live lease.
    pub fn cleanup_expired_claims(&self) -> Result<usize> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let deadline = (now - Duration::minutes(CHECKIN_TIMEOUT_MINS)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let released = db.execute(
            "UPDATE coordination
             SET claimed_by = NULL, claimed_at = NULL, claim_expires = NULL,
                 last_checkin = NULL, status = 'available', updated_at = ?1
             WHERE claimed_by IS NOT NULL
               AND (claim_expires < ?1 OR last_checkin < ?2)",
            params![now_str, deadline],
        )?;
        if released > 0 {
            info!(released, "cleaned up expired claims");
        }
        Ok(released)
    }

    pub fn claimed_entities(&self, container_id: &str) -> Result<Vec<CoordinationEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{} WHERE claimed_by = ?1 ORDER BY priority",
            ENTRY_SELECT
        ))?;
        let rows = stmt.query_map(params![container_id], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Browse the coordination table with optional filters.
    pub fn list_entries(
        &self,
        platform: Option<&str>,
        status: Option<&str>,
        claimed_by: Option<&str>,
        is_live: Option<bool>,
        limit: usize,
    ) -> Result<Vec<CoordinationEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{} WHERE (?1 IS NULL OR platform = ?1)
                AND (?2 IS NULL OR status = ?2)
                AND (?3 IS NULL OR claimed_by = ?3)
                AND (?4 IS NULL OR is_live = ?4)
              ORDER BY is_live DESC, platform, priority
              LIMIT ?5",
            ENTRY_SELECT
        ))?;
        let rows = stmt.query_map(
            params![platform, status, claimed_by, is_live, limit as i64],
            row_to_entry,
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Idempotently copy active server rows for a platform into the
    /// coordination table as `available` entries.
    pub fn populate_from_servers(&self, platform: &str) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT server_id, channel, config FROM servers
             WHERE platform = ?1 AND is_active = 1",
        )?;
        let rows = stmt.query_map(params![platform], |r| {
            Ok((
                r.get::<_, Option<String>>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut inserted = 0;
        for row in rows {
            let (server_id, channel, config) = row?;
            let (server, channel_id) = match server_id {
                Some(server) if !server.is_empty() => (server, Some(channel)),
                _ => (channel, None),
            };
            let entity_id = match &channel_id {
                Some(c) => format!("{}+{}+{}", platform, server, c),
                None => format!("{}+{}", platform, server),
            };
            inserted += db.execute(
                "INSERT OR IGNORE INTO coordination
                 (platform, server_id, channel_id, entity_id, status, priority, config,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'available', 100, ?5, ?6, ?6)",
                params![platform, server, channel_id, entity_id, config, now],
            )?;
        }
        info!(platform, inserted, "populated coordination table");
        Ok(inserted)
    }

    /// Seed one coordination row directly (used by collectors registering a
    /// channel that has no servers-table entry).
    pub fn add_entry(
        &self,
        platform: &str,
        server_id: &str,
        channel_id: Option<&str>,
        priority: i64,
    ) -> Result<String> {
        let entity_id = match channel_id {
            Some(c) if !c.is_empty() => format!("{}+{}+{}", platform, server_id, c),
            _ => format!("{}+{}", platform, server_id),
        };
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO coordination
             (platform, server_id, channel_id, entity_id, status, priority, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'available', ?5, ?6, ?6)",
            params![platform, server_id, channel_id, entity_id, priority, now],
        )?;
        Ok(entity_id)
    }

    pub fn stats(&self) -> Result<CoordinationStats> {
        let db = self.db.lock().unwrap();
        let (total, claimed, live, errors): (i64, i64, i64, i64) = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(claimed_by IS NOT NULL), 0),
                    COALESCE(SUM(is_live), 0),
                    COALESCE(SUM(status = 'error'), 0)
             FROM coordination",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;

        let mut containers = std::collections::HashMap::new();
        let mut stmt = db.prepare(
            "SELECT claimed_by, COUNT(*) FROM coordination
             WHERE claimed_by IS NOT NULL GROUP BY claimed_by",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (container, count) = row?;
            containers.insert(container, count);
        }

        Ok(CoordinationStats {
            total_entities: total,
            claimed_entities: claimed,
            available_entities: total - claimed,
            live_entities: live,
            error_entities: errors,
            containers,
        })
    }
}

const ENTRY_SELECT: &str = "SELECT id, platform, server_id, channel_id, entity_id, claimed_by,
        claimed_at, claim_expires, last_checkin, last_check, last_activity, live_since,
        status, is_live, viewer_count, error_count, metadata, priority, created_at
 FROM coordination";

fn entry_by_row_id(db: &Connection, id: i64) -> Result<Option<CoordinationEntry>> {
    let found = db
        .query_row(
            &format!("{} WHERE id = ?1", ENTRY_SELECT),
            params![id],
            row_to_entry,
        )
        .optional()?;
    Ok(found)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoordinationEntry> {
    let status: String = row.get(12)?;
    let metadata: Option<String> = row.get(16)?;
    Ok(CoordinationEntry {
        id: row.get(0)?,
        platform: row.get(1)?,
        server_id: row.get(2)?,
        channel_id: row.get(3)?,
        entity_id: row.get(4)?,
        claimed_by: row.get(5)?,
        claimed_at: row.get(6)?,
        claim_expires: row.get(7)?,
        last_checkin: row.get(8)?,
        last_check: row.get(9)?,
        last_activity: row.get(10)?,
        live_since: row.get(11)?,
        status: EntryStatus::parse(&status).unwrap_or(EntryStatus::Available),
        is_live: row.get(13)?,
        viewer_count: row.get(14)?,
        error_count: row.get(15)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        priority: row.get(17)?,
        created_at: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn seed(c: &Coordinator, platform: &str, count: usize) {
        for i in 0..count {
            c.add_entry(platform, &format!("ch{}", i), None, 100).unwrap();
        }
    }

    #[test]
    fn claim_takes_up_to_max() {
        let c = coordinator();
        seed(&c, "twitch", 5);

        let result = c.claim("container_a", "twitch", 3).unwrap();
        assert_eq!(result.claimed_entities.len(), 3);
        for entry in &result.claimed_entities {
            assert_eq!(entry.claimed_by.as_deref(), Some("container_a"));
            assert_eq!(entry.status, EntryStatus::Claimed);
            assert!(entry.claim_expires.is_some());
        }
        assert_eq!(c.claimed_entities("container_a").unwrap().len(), 3);
    }

    #[test]
    fn competing_containers_never_share_a_row() {
        let c = std::sync::Arc::new(coordinator());
        seed(&c, "twitch", 5);

        let a = {
            let c = c.clone();
            std::thread::spawn(move || c.claim("container_a", "twitch", 10).unwrap())
        };
        let b = {
            let c = c.clone();
            std::thread::spawn(move || c.claim("container_b", "twitch", 10).unwrap())
        };
        let a = a.join().unwrap();
        let b = b.join().unwrap();

        assert_eq!(a.claimed_entities.len() + b.claimed_entities.len(), 5);
        let mut seen = std::collections::HashSet::new();
        for entry in a.claimed_entities.iter().chain(&b.claimed_entities) {
            assert!(seen.insert(entry.entity_id.clone()), "row claimed twice");
        }
    }

    #[test]
    fn live_rows_are_claimed_first() {
        let c = coordinator();
        seed(&c, "twitch", 3);
        // Mark ch2 live while unclaimed (hand-edit: collectors normally do
        // this through update_status on claimed rows).
        {
            let db = c.db.lock().unwrap();
            db.execute(
                "UPDATE coordination SET is_live = 1, status = 'live' WHERE entity_id = 'twitch+ch2'",
                [],
            )
            .unwrap();
        }

        let result = c.claim("container_a", "twitch", 1).unwrap();
        assert_eq!(result.claimed_entities[0].entity_id, "twitch+ch2");
    }

    #[test]
    fn checkin_extends_claims() {
        let c = coordinator();
        seed(&c, "twitch", 2);
        c.claim("container_a", "twitch", 2).unwrap();
        assert_eq!(c.checkin("container_a").unwrap(), 2);
        assert_eq!(c.checkin("container_b").unwrap(), 0);
    }

    #[test]
    fn missed_checkin_makes_rows_claimable() {
        let c = coordinator();
        seed(&c, "twitch", 3);
        c.claim("container_a", "twitch", 3).unwrap();

        // Nothing for B while A's claims are fresh.
        assert!(c.claim("container_b", "twitch", 3).unwrap().claimed_entities.is_empty());

        // Rewind A's checkins by 7 minutes (past the 6-minute window).
        let stale = (Utc::now() - Duration::minutes(7)).to_rfc3339();
        {
            let db = c.db.lock().unwrap();
            db.execute(
                "UPDATE coordination SET last_checkin = ?1 WHERE claimed_by = 'container_a'",
                params![stale],
            )
            .unwrap();
        }

        let result = c.claim("container_b", "twitch", 3).unwrap();
        assert_eq!(result.claimed_entities.len(), 3);
        assert!(c.claimed_entities("container_a").unwrap().is_empty());
    }

    #[test]
    fn cleanup_releases_expired_claims() {
        let c = coordinator();
        seed(&c, "twitch", 2);
        c.claim("container_a", "twitch", 2).unwrap();

        let stale = (Utc::now() - Duration::minutes(10)).to_rfc3339();
        {
            let db = c.db.lock().unwrap();
            db.execute(
                "UPDATE coordination SET last_checkin = ?1 WHERE claimed_by = 'container_a'",
                params![stale],
            )
            .unwrap();
        }

        assert_eq!(c.cleanup_expired_claims().unwrap(), 2);
        let entries = c.list_entries(Some("twitch"), None, None, None, 10).unwrap();
        for entry in entries {
            assert!(entry.claimed_by.is_none());
            assert_eq!(entry.status, EntryStatus::Available);
        }
    }

    #[test]
    fn status_updates_require_ownership() {
        let c = coordinator();
        seed(&c, "twitch", 1);
        c.claim("container_a", "twitch", 1).unwrap();

        assert!(!c
            .update_status("container_b", "twitch+ch0", Some(true), None, None, false)
            .unwrap());

        assert!(c
            .update_status("container_a", "twitch+ch0", Some(true), Some(55), None, true)
            .unwrap());
        let entry = &c.claimed_entities("container_a").unwrap()[0];
        assert!(entry.is_live);
        assert_eq!(entry.status, EntryStatus::Live);
        assert!(entry.live_since.is_some());
        assert_eq!(entry.viewer_count, 55);
        assert!(entry.last_activity.is_some());

        assert!(c
            .update_status("container_a", "twitch+ch0", Some(false), None, None, false)
            .unwrap());
        let entry = &c.claimed_entities("container_a").unwrap()[0];
        assert!(!entry.is_live);
        assert_eq!(entry.status, EntryStatus::Offline);
        assert!(entry.live_since.is_none());
    }

    #[test]
    fn three_errors_park_the_row() {
        let c = coordinator();
        seed(&c, "twitch", 1);
        c.claim("container_a", "twitch", 1).unwrap();

        for _ in 0..2 {
            c.report_error("container_a", "twitch+ch0", "boom").unwrap();
        }
        assert_eq!(
            c.claimed_entities("container_a").unwrap()[0].status,
            EntryStatus::Claimed
        );

        c.report_error("container_a", "twitch+ch0", "boom").unwrap();
        let entry = &c.claimed_entities("container_a").unwrap()[0];
        assert_eq!(entry.status, EntryStatus::Error);
        assert_eq!(entry.error_count, 3);

        // Activity resets the error counter.
        c.update_status("container_a", "twitch+ch0", None, None, None, true)
            .unwrap();
        assert_eq!(c.claimed_entities("container_a").unwrap()[0].error_count, 0);
    }

    #[test]
    fn release_offline_swaps_in_replacements() {
        let c = coordinator();
        seed(&c, "twitch", 3);
        c.claim("container_a", "twitch", 2).unwrap();
        c.update_status("container_a", "twitch+ch0", Some(false), None, None, false)
            .unwrap();

        let (released, replacements) = c.release_offline("container_a").unwrap();
        assert_eq!(released, vec!["twitch+ch0".to_string()]);
        assert_eq!(replacements.claimed_entities.len(), 1);
        assert_eq!(replacements.claimed_entities[0].entity_id, "twitch+ch2");
        // Still holding two rows: the surviving claim plus the replacement.
        assert_eq!(c.claimed_entities("container_a").unwrap().len(), 2);
    }

    #[test]
    fn release_specific_entities() {
        let c = coordinator();
        seed(&c, "twitch", 3);
        c.claim("container_a", "twitch", 3).unwrap();

        let released = c
            .release("container_a", Some(&["twitch+ch1".to_string()]))
            .unwrap();
        assert_eq!(released, 1);
        assert_eq!(c.claimed_entities("container_a").unwrap().len(), 2);

        assert_eq!(c.release("container_a", None).unwrap(), 2);
        assert_eq!(c.claimed_entities("container_a").unwrap().len(), 0);
    }

    #[test]
    fn populate_is_idempotent() {
        let c = coordinator();
        {
            let db = c.db.lock().unwrap();
            let now = Utc::now().to_rfc3339();
            for channel in ["alpha", "beta"] {
                db.execute(
                    "INSERT INTO servers (owner, platform, channel, is_active, created_at, updated_at)
                     VALUES ('o', 'twitch', ?1, 1, ?2, ?2)",
                    params![channel, now],
                )
                .unwrap();
            }
        }

        assert_eq!(c.populate_from_servers("twitch").unwrap(), 2);
        assert_eq!(c.populate_from_servers("twitch").unwrap(), 0);

        let stats = c.stats().unwrap();
        assert_eq!(stats.total_entities, 2);
        assert_eq!(stats.available_entities, 2);
    }
}
