use serde::{Deserialize, Serialize};

/// The GLOBAL community every user is auto-joined to on first event.
pub const GLOBAL_COMMUNITY_ID: i64 = 1;

/// Role tiers, ordered `user < moderator < owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "moderator" => Some(Role::Moderator),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Role::User => 1,
            Role::Moderator => 2,
            Role::Owner => 3,
        }
    }

    /// The fixed permission bundle this role grants.
    pub fn permissions(&self) -> &'static [&'static str] {
        match self {
            Role::User => &["chat.send", "commands.basic", "reputation.view"],
            Role::Moderator => &[
                "chat.send",
                "commands.basic",
                "commands.moderate",
                "reputation.view",
                "users.timeout",
                "users.kick",
                "users.warn",
                "community.add_user",
                "community.add_entity",
            ],
            Role::Owner => &[
                "chat.send",
                "commands.basic",
                "commands.moderate",
                "commands.admin",
                "reputation.view",
                "reputation.manage",
                "users.timeout",
                "users.kick",
                "users.warn",
                "users.ban",
                "community.add_user",
                "community.add_entity",
                "community.remove_user",
                "community.manage_roles",
                "community.manage_settings",
                "community.install_modules",
                "community.delete",
            ],
        }
    }

    pub fn grants(&self, permission: &str) -> bool {
        self.permissions().contains(&permission)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a role applies: one entity, or one community.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleScope {
    Entity(String),
    Community(i64),
}

/// The permission a moderation-style command requires. Anything not in the
/// table is treated as a basic command.
pub fn command_permission(command: &str) -> &'static str {
    match command {
        "ban" => "users.ban",
        "kick" => "users.kick",
        "timeout" => "users.timeout",
        "warn" => "users.warn",
        _ => "commands.basic",
    }
}

/// One entry of a bulk permission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionQuery {
    pub user_id: String,
    pub permission: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub community_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionAnswer {
    pub user_id: String,
    pub permission: String,
    pub entity_id: Option<String>,
    pub community_id: Option<i64>,
    pub has_permission: bool,
}

/// One entry of a bulk role assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: String,
    pub role: Role,
    pub assigned_by: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub community_id: Option<i64>,
}

/// One entry of a bulk role lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleQuery {
    pub user_id: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub community_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAnswer {
    pub user_id: String,
    pub entity_id: Option<String>,
    pub community_id: Option<i64>,
    pub role: Option<Role>,
}

/// Aggregate result of a bulk operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}
