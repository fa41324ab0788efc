//! Process-local TTL cache for hot dispatch lookups.
//!
//! Advisory only: the relational store stays the source of truth, and
//! entries may be stale for up to their TTL. Writers that change cached
//! data are expected to invalidate the affected keys.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

/// How often the sweeper drops expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
}

/// Thread-safe in-memory cache with per-entry TTL.
///
/// Keys are namespaced by prefix (`command:`, `permission:`,
/// `stringrules:`, …); the prefix selects the default TTL when the caller
/// does not pass one explicitly.
pub struct TtlCache {
    entries: DashMap<String, CacheEntry>,
    command_ttl: Duration,
    entity_ttl: Duration,
}

impl TtlCache {
    pub fn new(command_ttl: Duration, entity_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            command_ttl,
            entity_ttl,
        }
    }

    /// Look up a key, treating expired entries as misses (and dropping them).
    pub fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Store a value under the prefix-selected default TTL.
    pub fn set(&self, key: &str, value: Value) {
        let ttl = self.default_ttl(key);
        self.set_with_ttl(key, value, ttl);
    }

    pub fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every key under a prefix. Used when a write affects an
    /// unenumerable key set, e.g. a global string rule touching the
    /// `stringrules:` entry of every entity.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let total = self.entries.len();
        let expired = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .count();
        CacheStats {
            total_entries: total,
            expired_entries: expired,
            active_entries: total - expired,
        }
    }

    fn default_ttl(&self, key: &str) -> Duration {
        if key.starts_with("command:") {
            self.command_ttl
        } else if key.starts_with("entity:") || key.starts_with("permission:") {
            self.entity_ttl
        } else {
            Duration::from_secs(300)
        }
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired.len()
    }
}

/// Spawn the background sweeper. Runs until the process exits.
pub fn spawn_sweeper(cache: Arc<TtlCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                debug!(removed, "cache sweep dropped expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> TtlCache {
        TtlCache::new(Duration::from_secs(300), Duration::from_secs(600))
    }

    #[test]
    fn round_trip_until_expiry() {
        let c = cache();
        c.set_with_ttl("command:!:help", json!({"id": 1}), Duration::from_millis(20));
        assert_eq!(c.get("command:!:help"), Some(json!({"id": 1})));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(c.get("command:!:help"), None);
        assert_eq!(c.size(), 0);
    }

    #[test]
    fn delete_removes_entry() {
        let c = cache();
        c.set("permission:1:twitch+42", json!(true));
        assert!(c.delete("permission:1:twitch+42"));
        assert!(!c.delete("permission:1:twitch+42"));
        assert_eq!(c.get("permission:1:twitch+42"), None);
    }

    #[test]
    fn delete_prefix_clears_namespace() {
        let c = cache();
        c.set("stringrules:twitch+1", json!([]));
        c.set("stringrules:twitch+2", json!([]));
        c.set("command:!:help", json!({}));

        assert_eq!(c.delete_prefix("stringrules:"), 2);
        assert_eq!(c.get("stringrules:twitch+1"), None);
        assert!(c.get("command:!:help").is_some());
    }

    #[test]
    fn sweep_drops_only_expired() {
        let c = cache();
        c.set_with_ttl("a", json!(1), Duration::from_millis(1));
        c.set_with_ttl("b", json!(2), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(c.sweep(), 1);
        assert_eq!(c.get("b"), Some(json!(2)));
    }

    #[test]
    fn stats_counts_active_and_expired() {
        let c = cache();
        c.set_with_ttl("old", json!(1), Duration::from_millis(1));
        c.set_with_ttl("new", json!(2), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));

        let stats = c.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.active_entries, 1);
    }
}
