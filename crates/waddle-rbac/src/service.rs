use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::future::join_all;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::db::init_db;
use crate::error::{RbacError, Result};
use crate::types::{
    BulkOutcome, PermissionAnswer, PermissionQuery, Role, RoleAnswer, RoleAssignment, RoleQuery,
    RoleScope, GLOBAL_COMMUNITY_ID,
};

/// Fan-out bound for bulk operations.
const BULK_WORKERS: usize = 10;

/// The permission catalog seeded at boot, grouped by category.
const PERMISSION_CATALOG: &[(&str, &str, &str)] = &[
    ("chat.send", "Send chat messages", "chat"),
    ("chat.delete", "Delete chat messages", "chat"),
    ("commands.basic", "Use basic commands", "commands"),
    ("commands.moderate", "Use moderation commands", "commands"),
    ("commands.admin", "Use admin commands", "commands"),
    ("users.timeout", "Timeout users", "moderation"),
    ("users.kick", "Kick users", "moderation"),
    ("users.warn", "Warn users", "moderation"),
    ("users.ban", "Ban users", "moderation"),
    ("community.add_user", "Add users to community", "community"),
    ("community.remove_user", "Remove users from community", "community"),
    ("community.add_entity", "Add entities to community", "community"),
    ("community.manage_roles", "Manage user roles", "community"),
    ("community.manage_settings", "Manage community settings", "community"),
    ("community.install_modules", "Install/uninstall modules", "community"),
    ("community.delete", "Delete community", "community"),
    ("reputation.view", "View reputation scores", "reputation"),
    ("reputation.manage", "Manage reputation settings", "reputation"),
];

/// Layered role resolver over the relational store.
///
/// Resolution precedence for an entity scope: explicit entity role, then
/// the community of the first entity group containing the entity, then the
/// GLOBAL community (which every user is auto-joined to on first event).
pub struct RbacService {
    db: Arc<Mutex<Connection>>,
    bulk: Arc<Semaphore>,
}

impl RbacService {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            bulk: Arc::new(Semaphore::new(BULK_WORKERS)),
        })
    }

    /// Idempotently create the GLOBAL community and seed the permission
    /// catalog. Called once at boot.
    pub fn initialize(&self) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO communities
             (id, name, owners, entity_groups, member_ids, description, is_active,
              settings, created_by, created_at, updated_at)
             VALUES (?1, 'Global Community', '[\"system\"]', '[]', '[]',
                     'Default global community for all WaddleBot users', 1,
                     '{\"auto_join\": true, \"default_role\": \"user\", \"public\": true}',
                     'system', ?2, ?2)",
            params![GLOBAL_COMMUNITY_ID, now],
        )?;
        if inserted > 0 {
            info!("global community initialized");
        }

        for (name, description, category) in PERMISSION_CATALOG {
            db.execute(
                "INSERT OR IGNORE INTO rbac_permissions
                 (name, description, category, is_active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![name, description, category, now],
            )?;
        }
        Ok(())
    }

    // ── resolution ────────────────────────────────────────────────────────────

    /// A user's role within one community. Members without an explicit RBAC
    /// row default to `user`; GLOBAL always resolves to at least `user`.
    pub fn role_in_community(&self, user_id: &str, community_id: i64) -> Result<Option<Role>> {
        let db = self.db.lock().unwrap();
        role_in_community_locked(&db, user_id, community_id)
    }

    /// A user's effective role for an entity, walking the precedence chain.
    pub fn role_for_entity(&self, user_id: &str, entity_id: &str) -> Result<Role> {
        let db = self.db.lock().unwrap();

        let explicit: Option<String> = db
            .query_row(
                "SELECT role FROM entity_roles
                 WHERE entity_id = ?1 AND user_id = ?2 AND is_active = 1",
                params![entity_id, user_id],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(role) = explicit.as_deref().and_then(Role::parse) {
            return Ok(role);
        }

        // Walk entity groups that contain this entity and are mapped to a
        // community; the first community with a resolvable role wins.
        for community_id in communities_containing(&db, entity_id)? {
            if let Some(role) = role_in_community_locked(&db, user_id, community_id)? {
                return Ok(role);
            }
        }

        Ok(role_in_community_locked(&db, user_id, GLOBAL_COMMUNITY_ID)?.unwrap_or(Role::User))
    }

    /// Resolve the role for an explicit scope (None = GLOBAL).
    pub fn resolve_role(&self, user_id: &str, scope: Option<&RoleScope>) -> Result<Option<Role>> {
        match scope {
            Some(RoleScope::Entity(entity_id)) => {
                Ok(Some(self.role_for_entity(user_id, entity_id)?))
            }
            Some(RoleScope::Community(community_id)) => {
                self.role_in_community(user_id, *community_id)
            }
            None => self.role_in_community(user_id, GLOBAL_COMMUNITY_ID),
        }
    }

    pub fn has_permission(
        &self,
        user_id: &str,
        permission: &str,
        scope: Option<&RoleScope>,
    ) -> Result<bool> {
        Ok(self
            .resolve_role(user_id, scope)?
            .is_some_and(|role| role.grants(permission)))
    }

    pub fn has_role_level(
        &self,
        user_id: &str,
        required: Role,
        scope: Option<&RoleScope>,
    ) -> Result<bool> {
        Ok(self
            .resolve_role(user_id, scope)?
            .is_some_and(|role| role.level() >= required.level()))
    }

    pub fn user_permissions(
        &self,
        user_id: &str,
        scope: Option<&RoleScope>,
    ) -> Result<Vec<&'static str>> {
        Ok(self
            .resolve_role(user_id, scope)?
            .map(|role| role.permissions().to_vec())
            .unwrap_or_default())
    }

    // ── assignment ────────────────────────────────────────────────────────────

    /// Assign a role within a scope. A community assignment also ensures
    /// membership; an entity assignment touches nothing else.
    pub fn assign_role(
        &self,
        user_id: &str,
        role: Role,
        assigned_by: &str,
        scope: &RoleScope,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        match scope {
            RoleScope::Entity(entity_id) => {
                db.execute(
                    "INSERT INTO entity_roles
                     (entity_id, user_id, role, assigned_by, assigned_at, is_active)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)
                     ON CONFLICT(entity_id, user_id) DO UPDATE SET
                        role = excluded.role, assigned_by = excluded.assigned_by,
                        assigned_at = excluded.assigned_at, is_active = 1",
                    params![entity_id, user_id, role.as_str(), assigned_by, now],
                )?;
                debug!(user_id, entity_id, role = %role, "entity role assigned");
            }
            RoleScope::Community(community_id) => {
                db.execute(
                    "INSERT INTO community_rbac
                     (community_id, user_id, role, assigned_by, assigned_at, is_active)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)
                     ON CONFLICT(community_id, user_id) DO UPDATE SET
                        role = excluded.role, assigned_by = excluded.assigned_by,
                        assigned_at = excluded.assigned_at, is_active = 1",
                    params![community_id, user_id, role.as_str(), assigned_by, now],
                )?;
                db.execute(
                    "INSERT OR IGNORE INTO community_memberships
                     (community_id, user_id, joined_at, is_active, invited_by)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![community_id, user_id, now, assigned_by],
                )?;
                debug!(user_id, community_id, role = %role, "community role assigned");
            }
        }
        Ok(())
    }

    /// Guarantee GLOBAL membership plus a `user` RBAC row. Idempotent.
    pub fn ensure_user_in_global(&self, user_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO community_memberships
             (community_id, user_id, joined_at, is_active, invited_by)
             VALUES (?1, ?2, ?3, 1, 'system')",
            params![GLOBAL_COMMUNITY_ID, user_id, now],
        )?;
        db.execute(
            "INSERT OR IGNORE INTO community_rbac
             (community_id, user_id, role, assigned_by, assigned_at, is_active)
             VALUES (?1, ?2, 'user', 'system', ?3, 1)",
            params![GLOBAL_COMMUNITY_ID, user_id, now],
        )?;
        Ok(())
    }

    /// Users holding `role` within one scope.
    pub fn users_with_role(&self, role: Role, scope: &RoleScope) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let (sql, key): (&str, String) = match scope {
            RoleScope::Entity(entity_id) => (
                "SELECT user_id FROM entity_roles
                 WHERE entity_id = ?1 AND role = ?2 AND is_active = 1",
                entity_id.clone(),
            ),
            RoleScope::Community(community_id) => (
                "SELECT user_id FROM community_rbac
                 WHERE community_id = ?1 AND role = ?2 AND is_active = 1",
                community_id.to_string(),
            ),
        };
        let mut stmt = db.prepare(sql)?;
        let rows = stmt.query_map(params![key, role.as_str()], |r| r.get::<_, String>(0))?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    // ── bulk operations ───────────────────────────────────────────────────────

    /// Check many permissions concurrently (bounded fan-out).
    pub async fn check_permissions_bulk(
        self: &Arc<Self>,
        queries: Vec<PermissionQuery>,
    ) -> Vec<PermissionAnswer> {
        let tasks = queries.into_iter().map(|q| {
            let service = Arc::clone(self);
            let bulk = Arc::clone(&self.bulk);
            tokio::spawn(async move {
                let _permit = bulk.acquire_owned().await.expect("semaphore closed");
                let scope = scope_of(q.entity_id.as_deref(), q.community_id);
                let has = service
                    .has_permission(&q.user_id, &q.permission, scope.as_ref())
                    .unwrap_or(false);
                PermissionAnswer {
                    user_id: q.user_id,
                    permission: q.permission,
                    entity_id: q.entity_id,
                    community_id: q.community_id,
                    has_permission: has,
                }
            })
        });
        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }

    /// Assign many roles concurrently; failures are counted, not fatal.
    pub async fn assign_roles_bulk(self: &Arc<Self>, assignments: Vec<RoleAssignment>) -> BulkOutcome {
        let total = assignments.len();
        let tasks = assignments.into_iter().map(|a| {
            let service = Arc::clone(self);
            let bulk = Arc::clone(&self.bulk);
            tokio::spawn(async move {
                let _permit = bulk.acquire_owned().await.expect("semaphore closed");
                let scope = scope_of(a.entity_id.as_deref(), a.community_id)
                    .ok_or(RbacError::MissingScope)?;
                service.assign_role(&a.user_id, a.role, &a.assigned_by, &scope)
            })
        });
        let results = join_all(tasks).await;
        let successful = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(()))))
            .count();
        for failure in results.iter().filter(|r| !matches!(r, Ok(Ok(())))) {
            if let Ok(Err(e)) = failure {
                error!(error = %e, "bulk role assignment failed");
            }
        }
        BulkOutcome {
            total,
            successful,
            failed: total - successful,
        }
    }

    /// Resolve many roles concurrently.
    pub async fn get_roles_bulk(self: &Arc<Self>, queries: Vec<RoleQuery>) -> Vec<RoleAnswer> {
        let tasks = queries.into_iter().map(|q| {
            let service = Arc::clone(self);
            let bulk = Arc::clone(&self.bulk);
            tokio::spawn(async move {
                let _permit = bulk.acquire_owned().await.expect("semaphore closed");
                let scope = scope_of(q.entity_id.as_deref(), q.community_id);
                let role = service.resolve_role(&q.user_id, scope.as_ref()).unwrap_or(None);
                RoleAnswer {
                    user_id: q.user_id,
                    entity_id: q.entity_id,
                    community_id: q.community_id,
                    role,
                }
            })
        });
        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }

    /// Onboard many users into GLOBAL concurrently. Idempotent.
    pub async fn ensure_users_in_global_bulk(self: &Arc<Self>, user_ids: Vec<String>) -> BulkOutcome {
        let total = user_ids.len();
        let tasks = user_ids.into_iter().map(|user_id| {
            let service = Arc::clone(self);
            let bulk = Arc::clone(&self.bulk);
            tokio::spawn(async move {
                let _permit = bulk.acquire_owned().await.expect("semaphore closed");
                service.ensure_user_in_global(&user_id)
            })
        });
        let results = join_all(tasks).await;
        let successful = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(()))))
            .count();
        BulkOutcome {
            total,
            successful,
            failed: total - successful,
        }
    }

    /// Counts used by tests and the metrics endpoint.
    pub fn global_membership(&self, user_id: &str) -> Result<(i64, i64)> {
        let db = self.db.lock().unwrap();
        let memberships: i64 = db.query_row(
            "SELECT COUNT(*) FROM community_memberships
             WHERE community_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![GLOBAL_COMMUNITY_ID, user_id],
            |r| r.get(0),
        )?;
        let rbac_rows: i64 = db.query_row(
            "SELECT COUNT(*) FROM community_rbac
             WHERE community_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![GLOBAL_COMMUNITY_ID, user_id],
            |r| r.get(0),
        )?;
        Ok((memberships, rbac_rows))
    }

    /// Map an entity group onto a community. Admin plumbing used when a
    /// community adopts a server.
    pub fn attach_group_to_community(&self, group_id: i64, community_id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE entity_groups SET community_id = ?2 WHERE id = ?1",
            params![group_id, community_id],
        )?;
        Ok(rows > 0)
    }
}

fn scope_of(entity_id: Option<&str>, community_id: Option<i64>) -> Option<RoleScope> {
    match (entity_id, community_id) {
        (Some(entity), _) => Some(RoleScope::Entity(entity.to_string())),
        (None, Some(community)) => Some(RoleScope::Community(community)),
        (None, None) => None,
    }
}

fn role_in_community_locked(
    db: &Connection,
    user_id: &str,
    community_id: i64,
) -> Result<Option<Role>> {
    let explicit: Option<String> = db
        .query_row(
            "SELECT role FROM community_rbac
             WHERE community_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![community_id, user_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(role) = explicit.as_deref().and_then(Role::parse) {
        return Ok(Some(role));
    }

    let member: bool = db.query_row(
        "SELECT EXISTS(SELECT 1 FROM community_memberships
         WHERE community_id = ?1 AND user_id = ?2 AND is_active = 1)",
        params![community_id, user_id],
        |r| r.get(0),
    )?;
    if member || community_id == GLOBAL_COMMUNITY_ID {
        return Ok(Some(Role::User));
    }
    Ok(None)
}

/// Communities reachable from entity groups containing `entity_id`.
fn communities_containing(db: &Connection, entity_id: &str) -> Result<Vec<i64>> {
    let mut stmt = db.prepare(
        "SELECT entity_ids, community_id FROM entity_groups
         WHERE is_active = 1 AND community_id IS NOT NULL
         ORDER BY id",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;

    let mut communities = Vec::new();
    for row in rows {
        let (entity_ids, community_id) = row?;
        let ids: Vec<String> = serde_json::from_str(&entity_ids).unwrap_or_default();
        if ids.iter().any(|e| e == entity_id) {
            communities.push(community_id);
        }
    }
    Ok(communities)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<RbacService> {
        let service = RbacService::new(Connection::open_in_memory().unwrap()).unwrap();
        service.initialize().unwrap();
        Arc::new(service)
    }

    fn add_group(service: &RbacService, entity_id: &str, community_id: i64) {
        let db = service.db.lock().unwrap();
        db.execute(
            "INSERT INTO communities
             (name, owners, created_by, created_at, updated_at)
             VALUES ('Test', '[]', 'system', '2026-01-01T00:00:00+00:00',
                     '2026-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        db.execute(
            "INSERT INTO entity_groups
             (name, platform, server_id, entity_ids, community_id, is_active, created_by, created_at)
             VALUES ('g', 'discord', 's', ?1, ?2, 1, 'system', '2026-01-01T00:00:00+00:00')",
            params![format!("[\"{}\"]", entity_id), community_id],
        )
        .unwrap();
    }

    #[test]
    fn initialize_is_idempotent() {
        let s = service();
        s.initialize().unwrap();
        let db = s.db.lock().unwrap();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM communities WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn first_contact_grants_global_user_role() {
        let s = service();
        s.ensure_user_in_global("u1").unwrap();
        s.ensure_user_in_global("u1").unwrap();

        assert_eq!(s.global_membership("u1").unwrap(), (1, 1));
        assert_eq!(
            s.role_in_community("u1", GLOBAL_COMMUNITY_ID).unwrap(),
            Some(Role::User)
        );
    }

    #[test]
    fn entity_role_beats_community_role() {
        let s = service();
        s.ensure_user_in_global("u1").unwrap();
        add_group(s.as_ref(), "discord+g+c", 2);

        // Community says moderator, entity says owner: entity wins.
        s.assign_role("u1", Role::Moderator, "admin", &RoleScope::Community(2))
            .unwrap();
        assert_eq!(s.role_for_entity("u1", "discord+g+c").unwrap(), Role::Moderator);

        s.assign_role(
            "u1",
            Role::Owner,
            "admin",
            &RoleScope::Entity("discord+g+c".to_string()),
        )
        .unwrap();
        assert_eq!(s.role_for_entity("u1", "discord+g+c").unwrap(), Role::Owner);
    }

    #[test]
    fn unmapped_entity_falls_back_to_global() {
        let s = service();
        s.ensure_user_in_global("u1").unwrap();
        assert_eq!(s.role_for_entity("u1", "twitch+42").unwrap(), Role::User);

        s.assign_role(
            "u1",
            Role::Owner,
            "admin",
            &RoleScope::Community(GLOBAL_COMMUNITY_ID),
        )
        .unwrap();
        assert_eq!(s.role_for_entity("u1", "twitch+42").unwrap(), Role::Owner);
    }

    #[test]
    fn community_assignment_ensures_membership() {
        let s = service();
        s.assign_role("u2", Role::Moderator, "admin", &RoleScope::Community(5))
            .unwrap();

        let db = s.db.lock().unwrap();
        let member: bool = db
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM community_memberships
                 WHERE community_id = 5 AND user_id = 'u2' AND is_active = 1)",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(member);
    }

    #[test]
    fn permission_bundles_follow_role() {
        let s = service();
        s.ensure_user_in_global("mod1").unwrap();
        s.assign_role(
            "mod1",
            Role::Moderator,
            "admin",
            &RoleScope::Community(GLOBAL_COMMUNITY_ID),
        )
        .unwrap();

        assert!(s.has_permission("mod1", "users.kick", None).unwrap());
        assert!(!s.has_permission("mod1", "users.ban", None).unwrap());
        assert!(s.has_role_level("mod1", Role::Moderator, None).unwrap());
        assert!(!s.has_role_level("mod1", Role::Owner, None).unwrap());
    }

    #[tokio::test]
    async fn bulk_onboarding_is_idempotent() {
        let s = service();
        let users: Vec<String> = (0..25).map(|i| format!("u{}", i)).collect();

        let first = s.ensure_users_in_global_bulk(users.clone()).await;
        assert_eq!(first.total, 25);
        assert_eq!(first.successful, 25);

        let second = s.ensure_users_in_global_bulk(users.clone()).await;
        assert_eq!(second.successful, 25);

        for user in &users {
            assert_eq!(s.global_membership(user).unwrap(), (1, 1));
        }
    }

    #[tokio::test]
    async fn bulk_permission_checks_answer_each_query() {
        let s = service();
        s.ensure_user_in_global("u1").unwrap();

        let answers = s
            .check_permissions_bulk(vec![
                PermissionQuery {
                    user_id: "u1".to_string(),
                    permission: "chat.send".to_string(),
                    entity_id: None,
                    community_id: None,
                },
                PermissionQuery {
                    user_id: "u1".to_string(),
                    permission: "users.ban".to_string(),
                    entity_id: Some("twitch+42".to_string()),
                    community_id: None,
                },
            ])
            .await;

        assert_eq!(answers.len(), 2);
        let send = answers.iter().find(|a| a.permission == "chat.send").unwrap();
        let ban = answers.iter().find(|a| a.permission == "users.ban").unwrap();
        assert!(send.has_permission);
        assert!(!ban.has_permission);
    }

    #[test]
    fn command_permission_mapping() {
        use crate::types::command_permission;
        assert_eq!(command_permission("ban"), "users.ban");
        assert_eq!(command_permission("timeout"), "users.timeout");
        assert_eq!(command_permission("help"), "commands.basic");
    }
}
