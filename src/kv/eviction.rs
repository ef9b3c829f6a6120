//! The pluggable eviction capability and its deterministic fallback.

use async_trait::async_trait;

use crate::kv::access_tracker::AccessTracker;

/// Selects keys to evict when the map exceeds capacity.
///
/// Implementations may call out to an external predictor; the core never
/// assumes the result is reproducible or fast, and always treats failure as
/// recoverable via [`LruEvictionPolicy`].
#[async_trait]
pub trait EvictionPolicy: Send + Sync {
    async fn select_keys_to_evict(
        &self,
        current_keys: &[String],
        access_tracker: &AccessTracker,
        count: usize,
    ) -> Result<Vec<String>, EvictionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EvictionError {
    #[error("eviction predictor unreachable: {0}")]
    Unreachable(String),

    #[error("eviction predictor timed out")]
    Timeout,
}

/// The deterministic fallback: evict the `count` keys with the oldest
/// last-access timestamp, per the access tracker. A key the tracker has
/// never seen an access for sorts before any key it has.
pub struct LruEvictionPolicy;

#[async_trait]
impl EvictionPolicy for LruEvictionPolicy {
    async fn select_keys_to_evict(
        &self,
        current_keys: &[String],
        access_tracker: &AccessTracker,
        count: usize,
    ) -> Result<Vec<String>, EvictionError> {
        let mut keys: Vec<&String> = current_keys.iter().collect();
        keys.sort_by_key(|k| access_tracker.last_access(k).unwrap_or(0));
        Ok(keys.into_iter().take(count).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lru_evicts_least_recently_accessed_first() {
        let tracker = AccessTracker::new();
        tracker.record_access("old");
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        tracker.record_access("new");

        let keys = vec!["old".to_string(), "new".to_string()];
        let victims = LruEvictionPolicy.select_keys_to_evict(&keys, &tracker, 1).await.unwrap();
        assert_eq!(victims, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn unseen_keys_are_evicted_before_tracked_ones() {
        let tracker = AccessTracker::new();
        tracker.record_access("tracked");

        let keys = vec!["tracked".to_string(), "untracked".to_string()];
        let victims = LruEvictionPolicy.select_keys_to_evict(&keys, &tracker, 1).await.unwrap();
        assert_eq!(victims, vec!["untracked".to_string()]);
    }
}
