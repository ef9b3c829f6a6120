//! A read-only side channel recording per-key access patterns, consulted by
//! [`crate::kv::EvictionPolicy`] implementations but never replicated.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

const MAX_RECENT_TIMESTAMPS: usize = 32;
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Clone, Debug, Default)]
struct KeyStats {
    last_access: u64,
    recent: VecDeque<u64>,
}

/// Per-key access bookkeeping, updated by the node's own `get` calls and
/// consulted only locally. Never part of a snapshot, never replicated.
pub struct AccessTracker {
    stats: Mutex<HashMap<String, KeyStats>>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self { stats: Mutex::new(HashMap::new()) }
    }

    pub fn record_access(&self, key: &str) {
        let now = now_secs();
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(key.to_string()).or_default();
        entry.last_access = now;
        entry.recent.push_back(now);
        while entry.recent.len() > MAX_RECENT_TIMESTAMPS {
            entry.recent.pop_front();
        }
    }

    pub fn last_access(&self, key: &str) -> Option<u64> {
        self.stats.lock().unwrap().get(key).map(|s| s.last_access)
    }

    pub fn access_count_since(&self, key: &str, window: Duration) -> usize {
        let now = now_secs();
        let cutoff = now.saturating_sub(window.as_secs());
        self.stats
            .lock()
            .unwrap()
            .get(key)
            .map(|s| s.recent.iter().filter(|&&ts| ts >= cutoff).count())
            .unwrap_or(0)
    }

    pub fn access_count_last_hour(&self, key: &str) -> usize {
        self.access_count_since(key, HOUR)
    }

    pub fn access_count_last_day(&self, key: &str) -> usize {
        self.access_count_since(key, DAY)
    }

    /// Drop timestamps older than a day and forget keys with no recent
    /// activity at all. Intended to be driven by a periodic background task.
    pub fn decay(&self) {
        let now = now_secs();
        let cutoff = now.saturating_sub(DAY.as_secs());
        let mut stats = self.stats.lock().unwrap();
        stats.retain(|_, s| {
            s.recent.retain(|&ts| ts >= cutoff);
            !s.recent.is_empty() || s.last_access >= cutoff
        });
    }
}

impl Default for AccessTracker {
    fn default() -> Self {
        Self::new()
    }
}
