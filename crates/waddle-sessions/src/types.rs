use serde::{Deserialize, Serialize};

/// A short-lived session correlating an inbound event with the
/// out-of-band module reply that references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// UUIDv4 handed to modules alongside the dispatched event.
    pub session_id: String,
    /// The chat location this session was minted for. Module replies are
    /// only accepted when their execution belongs to the same entity.
    pub entity_id: String,
    pub created_at: String,
    pub last_activity: String,
    pub request_count: u32,
    /// RFC3339 expiry; refreshed on every touch.
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_requests: u64,
}
