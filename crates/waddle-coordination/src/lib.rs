pub mod db;
pub mod error;
pub mod manager;
pub mod types;

pub use manager::{generate_container_id, Coordinator};
pub use types::{ClaimResult, CoordinationEntry, CoordinationStats, EntryStatus, HeartbeatSnapshot};
