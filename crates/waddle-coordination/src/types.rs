use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Lifecycle of a coordination row:
/// `available → claimed → (live | offline | error) → available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Available,
    Claimed,
    Live,
    Offline,
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Available => "available",
            EntryStatus::Claimed => "claimed",
            EntryStatus::Live => "live",
            EntryStatus::Offline => "offline",
            EntryStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(EntryStatus::Available),
            "claimed" => Some(EntryStatus::Claimed),
            "live" => Some(EntryStatus::Live),
            "offline" => Some(EntryStatus::Offline),
            "error" => Some(EntryStatus::Error),
            _ => None,
        }
    }
}

/// One monitored chat location and the lease state on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEntry {
    pub id: i64,
    pub platform: String,
    pub server_id: String,
    pub channel_id: Option<String>,
    pub entity_id: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub claim_expires: Option<String>,
    pub last_checkin: Option<String>,
    pub last_check: Option<String>,
    pub last_activity: Option<String>,
    pub live_since: Option<String>,
    pub status: EntryStatus,
    pub is_live: bool,
    pub viewer_count: i64,
    pub error_count: i64,
    pub metadata: Option<Value>,
    pub priority: i64,
    pub created_at: String,
}

/// Outcome of one claim call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResult {
    pub claimed_entities: Vec<CoordinationEntry>,
}

/// Snapshot returned by heartbeat: what this container currently holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub container_id: String,
    pub timestamp: String,
    pub claimed_count: usize,
    pub entities: Vec<CoordinationEntry>,
}

/// Fleet-wide view for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationStats {
    pub total_entities: i64,
    pub claimed_entities: i64,
    pub available_entities: i64,
    pub live_entities: i64,
    pub error_entities: i64,
    /// Claim counts per container id.
    pub containers: HashMap<String, i64>,
}
