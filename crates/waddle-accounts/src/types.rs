use serde::{Deserialize, Serialize};

/// What kind of external service holds this account. The account type
/// gates which router endpoints the key may touch at all; permission
/// globs narrow further within that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Platform watcher that POSTs events and drives coordination.
    Collector,
    /// Command module that submits replies and browses the registry.
    Interaction,
    /// Reply-only webhook endpoint.
    Webhook,
    /// Operator tooling; may touch everything.
    Admin,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Collector => "collector",
            AccountType::Interaction => "interaction",
            AccountType::Webhook => "webhook",
            AccountType::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collector" => Some(AccountType::Collector),
            "interaction" => Some(AccountType::Interaction),
            "webhook" => Some(AccountType::Webhook),
            "admin" => Some(AccountType::Admin),
            _ => None,
        }
    }

    /// Endpoint globs granted when an account is created without an
    /// explicit permission list.
    pub fn default_permissions(&self) -> Vec<String> {
        let perms: &[&str] = match self {
            AccountType::Collector => &[
                "router/events",
                "router/events/batch",
                "router/coordination/*",
                "router/responses",
            ],
            AccountType::Interaction => {
                &["router/responses", "router/commands", "router/entities"]
            }
            AccountType::Webhook => &["router/responses"],
            AccountType::Admin => &["router/*", "admin/*"],
        };
        perms.iter().map(|s| s.to_string()).collect()
    }
}

/// A provisioned API credential. The key itself is never stored — only
/// its SHA-256 hash; validation hashes the presented key and looks up by
/// hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub id: i64,
    pub account_name: String,
    pub account_type: AccountType,
    pub platform: Option<String>,
    pub permissions: Vec<String>,
    pub is_active: bool,
    /// Requests per hour; 0 disables the hourly limit.
    pub rate_limit: u32,
    pub expires_at: Option<String>,
    pub usage_count: i64,
    pub last_used: Option<String>,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
}

/// One authenticated API call, kept for monitoring and the hourly limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub endpoint: String,
    pub method: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub response_status: u16,
    pub response_time_ms: i64,
    pub request_size: Option<i64>,
    pub response_size: Option<i64>,
}
