//! Sliding-window rate limiting for command dispatch.
//!
//! Admission is decided entirely in memory so a database stall can never
//! block the hot path; the per-minute DB buckets are bookkeeping only.

pub mod db;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Timelike, Utc};
use rusqlite::Connection;
use tracing::{debug, warn};

/// How often the sweeper prunes empty windows.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub active_windows: usize,
    pub tracked_requests: usize,
}

/// Per-(command, entity, user) sliding-window limiter.
///
/// Windows are keyed by `{command_id}:{entity_id}:{user_id}`. The map lock
/// is held only for the per-key prune-and-count, so checks for distinct
/// keys contend only on the map itself.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    window: Duration,
    db: Arc<Mutex<Connection>>,
}

impl RateLimiter {
    pub fn new(window_seconds: u64, conn: Connection) -> rusqlite::Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            windows: Mutex::new(HashMap::new()),
            window: Duration::from_secs(window_seconds),
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Admit or reject one request. At most `limit` requests are admitted
    /// per key in any sliding window.
    ///
    /// The observation is also recorded in the per-minute DB bucket; bucket
    /// write failures are logged and never affect admission.
    pub fn check(&self, command_id: i64, entity_id: &str, user_id: &str, limit: u32) -> bool {
        let key = format!("{}:{}:{}", command_id, entity_id, user_id);
        let now = Instant::now();

        let admitted = {
            let mut windows = self.windows.lock().unwrap();
            let window = windows.entry(key).or_default();
            let cutoff = now - self.window;
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }

            if window.len() >= limit as usize {
                false
            } else {
                window.push_back(now);
                true
            }
        };

        self.record_bucket(command_id, entity_id, user_id);
        if !admitted {
            debug!(command_id, entity_id, user_id, limit, "rate limit exceeded");
        }
        admitted
    }

    /// Fire-and-forget bucket bookkeeping, floored to the current minute.
    fn record_bucket(&self, command_id: i64, entity_id: &str, user_id: &str) {
        let now = Utc::now();
        let window_start = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now)
            .to_rfc3339();

        let conn = self.db.lock().unwrap();
        if let Err(e) = db::record_hit(
            &conn,
            command_id,
            entity_id,
            user_id,
            &window_start,
            &now.to_rfc3339(),
        ) {
            warn!(error = %e, "rate limit bucket write failed");
        }
    }

    /// Drop every window that belongs to `user_id` (admin escape hatch).
    pub fn reset_user(&self, user_id: &str) {
        let suffix = format!(":{}", user_id);
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|key, _| !key.ends_with(&suffix));
    }

    pub fn stats(&self) -> RateLimiterStats {
        let windows = self.windows.lock().unwrap();
        RateLimiterStats {
            active_windows: windows.len(),
            tracked_requests: windows.values().map(VecDeque::len).sum(),
        }
    }

    fn sweep(&self) -> usize {
        let cutoff = Instant::now() - self.window * 2;
        let mut windows = self.windows.lock().unwrap();
        let before = windows.len();
        for window in windows.values_mut() {
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }
        }
        windows.retain(|_, w| !w.is_empty());
        before - windows.len()
    }
}

/// Spawn the background window sweeper. Runs until the process exits.
pub fn spawn_sweeper(limiter: Arc<RateLimiter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = limiter.sweep();
            if removed > 0 {
                debug!(removed, "pruned empty rate-limit windows");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_seconds: u64) -> RateLimiter {
        RateLimiter::new(window_seconds, Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let rl = limiter(60);
        assert!(rl.check(1, "twitch+42", "u1", 2));
        assert!(rl.check(1, "twitch+42", "u1", 2));
        assert!(!rl.check(1, "twitch+42", "u1", 2));
    }

    #[test]
    fn keys_are_independent() {
        let rl = limiter(60);
        assert!(rl.check(1, "twitch+42", "u1", 1));
        assert!(rl.check(1, "twitch+42", "u2", 1));
        assert!(rl.check(2, "twitch+42", "u1", 1));
        assert!(!rl.check(1, "twitch+42", "u1", 1));
    }

    #[test]
    fn bucket_counts_every_observation() {
        let rl = limiter(60);
        rl.check(7, "twitch+42", "u1", 1);
        rl.check(7, "twitch+42", "u1", 1);

        let now = Utc::now();
        let window_start = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap()
            .to_rfc3339();
        let conn = rl.db.lock().unwrap();
        let count = db::bucket_count(&conn, 7, "twitch+42", "u1", &window_start).unwrap();
        assert!(count >= 2, "expected >= 2 observations, got {}", count);
    }

    #[test]
    fn reset_user_clears_only_that_user() {
        let rl = limiter(60);
        assert!(rl.check(1, "twitch+42", "u1", 1));
        assert!(rl.check(1, "twitch+42", "u2", 1));

        rl.reset_user("u1");
        assert!(rl.check(1, "twitch+42", "u1", 1));
        assert!(!rl.check(1, "twitch+42", "u2", 1));
    }

    #[test]
    fn sweep_drops_empty_windows() {
        let rl = limiter(0);
        rl.check(1, "twitch+42", "u1", 5);
        std::thread::sleep(Duration::from_millis(5));
        rl.sweep();
        assert_eq!(rl.stats().active_windows, 0);
    }
}
