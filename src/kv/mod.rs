//! The replicated key-value state machine: command application, per-client
//! deduplication, bounded capacity with pluggable eviction, and a read-only
//! access tracker.

pub mod access_tracker;
pub mod eviction;

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::types::ClientId;
use crate::types::Seq;

pub use access_tracker::AccessTracker;
pub use eviction::EvictionPolicy;
pub use eviction::LruEvictionPolicy;

/// A replicated command: the payload of a `Normal` log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Put {
        key: String,
        value: Vec<u8>,
        client_id: ClientId,
        seq: Seq,
    },
    Delete {
        key: String,
        client_id: ClientId,
        seq: Seq,
    },
}

impl Command {
    fn client_id(&self) -> ClientId {
        match self {
            Command::Put { client_id, .. } => *client_id,
            Command::Delete { client_id, .. } => *client_id,
        }
    }

    fn seq(&self) -> Seq {
        match self {
            Command::Put { seq, .. } => *seq,
            Command::Delete { seq, .. } => *seq,
        }
    }
}

/// The result of applying a [`Command`] to the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandResponse {
    /// The command was applied.
    Applied,
    /// `seq` was not greater than the client's last applied sequence number;
    /// the command was ignored.
    Duplicate,
}

/// Consistency level requested by a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Read the local replica's state with no linearizability guarantee.
    Stale,
    /// Confirm leadership via a leader read-lease before reading.
    Lease,
    /// Confirm leadership via a full ReadIndex round before reading.
    Strong,
}

/// A bounded key-value map replicated by Raft.
///
/// Owned exclusively by the apply loop; `get` may be called concurrently by
/// readers since it only ever reads `map`, never mutates the dedup table.
pub struct KvStateMachine {
    map: HashMap<String, Vec<u8>>,
    last_applied_seq: HashMap<ClientId, Seq>,
    capacity: usize,
    eviction_fraction: f64,
    eviction_policy: Box<dyn EvictionPolicy>,
    access_tracker: AccessTracker,
}

impl KvStateMachine {
    pub fn new(capacity: usize, eviction_fraction: f64, eviction_policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            map: HashMap::new(),
            last_applied_seq: HashMap::new(),
            capacity,
            eviction_fraction,
            eviction_policy,
            access_tracker: AccessTracker::new(),
        }
    }

    /// Rebuild state from a snapshot image, discarding whatever was there
    /// before.
    pub fn restore(&mut self, map: HashMap<String, Vec<u8>>, last_applied_seq: HashMap<ClientId, Seq>) {
        self.map = map;
        self.last_applied_seq = last_applied_seq;
    }

    /// A serializable snapshot of the replicated state, for writing to a
    /// `FileSnapshotStore`.
    pub fn snapshot_image(&self) -> (HashMap<String, Vec<u8>>, HashMap<ClientId, Seq>) {
        (self.map.clone(), self.last_applied_seq.clone())
    }

    /// Apply one command, enforcing per-client at-most-once semantics.
    pub async fn apply(&mut self, cmd: &Command) -> CommandResponse {
        let client_id = cmd.client_id();
        let seq = cmd.seq();
        let last_seq = self.last_applied_seq.get(&client_id).copied();
        if last_seq.is_some_and(|last| seq <= last) {
            return CommandResponse::Duplicate;
        }

        match cmd {
            Command::Put { key, value, .. } => {
                if !self.map.contains_key(key) && self.map.len() >= self.capacity {
                    self.evict().await;
                }
                self.map.insert(key.clone(), value.clone());
            }
            Command::Delete { key, .. } => {
                self.map.remove(key);
            }
        }
        self.last_applied_seq.insert(client_id, seq);
        CommandResponse::Applied
    }

    /// Read a key at the caller's replica. The consistency check (lease or
    /// ReadIndex confirmation) happens one layer up, in the Raft core; by
    /// the time this is called the read is known to be safe to serve.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let value = self.map.get(key).cloned();
        if value.is_some() {
            self.access_tracker.record_access(key);
        }
        value
    }

    pub fn access_tracker(&self) -> &AccessTracker {
        &self.access_tracker
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Bring the map back under capacity by evicting `eviction_fraction *
    /// capacity` keys (at least one), preferring the pluggable policy and
    /// falling back to LRU if it errors.
    async fn evict(&mut self) {
        let count = ((self.capacity as f64) * self.eviction_fraction).ceil().max(1.0) as usize;
        let current_keys: Vec<String> = self.map.keys().cloned().collect();

        let victims = match self.eviction_policy.select_keys_to_evict(&current_keys, &self.access_tracker, count).await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "eviction policy failed, falling back to LRU");
                LruEvictionPolicy
                    .select_keys_to_evict(&current_keys, &self.access_tracker, count)
                    .await
                    .unwrap_or_default()
            }
        };

        for key in victims {
            self.map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sm() -> KvStateMachine {
        KvStateMachine::new(100, 0.1, Box::new(LruEvictionPolicy))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let mut sm = sm();
        sm.apply(&Command::Put {
            key: "a".into(),
            value: b"1".to_vec(),
            client_id: 1,
            seq: 1,
        })
        .await;
        assert_eq!(sm.get("a"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn duplicate_seq_is_ignored() {
        let mut sm = sm();
        sm.apply(&Command::Put {
            key: "a".into(),
            value: b"1".to_vec(),
            client_id: 1,
            seq: 5,
        })
        .await;
        let resp = sm
            .apply(&Command::Put {
                key: "a".into(),
                value: b"2".to_vec(),
                client_id: 1,
                seq: 5,
            })
            .await;
        assert_eq!(resp, CommandResponse::Duplicate);
        assert_eq!(sm.get("a"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let mut sm = sm();
        sm.apply(&Command::Put {
            key: "a".into(),
            value: b"1".to_vec(),
            client_id: 1,
            seq: 1,
        })
        .await;
        sm.apply(&Command::Delete {
            key: "a".into(),
            client_id: 1,
            seq: 2,
        })
        .await;
        assert_eq!(sm.get("a"), None);
    }

    #[tokio::test]
    async fn restore_replaces_state_and_dedup_table() {
        let mut sm = sm();
        sm.restore(
            maplit::hashmap! { "a".to_string() => b"1".to_vec() },
            maplit::hashmap! { 7u64 => 3u64 },
        );
        assert_eq!(sm.get("a"), Some(b"1".to_vec()));
        let resp = sm
            .apply(&Command::Put {
                key: "a".into(),
                value: b"2".to_vec(),
                client_id: 7,
                seq: 3,
            })
            .await;
        assert_eq!(resp, CommandResponse::Duplicate);
    }

    #[tokio::test]
    async fn eviction_runs_when_new_key_exceeds_capacity() {
        let mut sm = KvStateMachine::new(2, 0.5, Box::new(LruEvictionPolicy));
        sm.apply(&Command::Put {
            key: "a".into(),
            value: b"1".to_vec(),
            client_id: 1,
            seq: 1,
        })
        .await;
        sm.apply(&Command::Put {
            key: "b".into(),
            value: b"1".to_vec(),
            client_id: 1,
            seq: 2,
        })
        .await;
        assert_eq!(sm.len(), 2);
        sm.apply(&Command::Put {
            key: "c".into(),
            value: b"1".to_vec(),
            client_id: 1,
            seq: 3,
        })
        .await;
        assert!(sm.len() <= 2);
        assert!(sm.get("c").is_some());
    }
}
