//! Cluster configuration, loaded once at startup and validated before the
//! node does anything else.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::types::NodeId;

/// `(node_id, raft-rpc address)` of one other cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// How frequently a log-compaction snapshot is considered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// Compact once the log holds more than this many applied entries since
    /// the last snapshot.
    EntriesSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::EntriesSinceLast(1000)
    }
}

/// Raft's runtime configuration. Immutable for the lifetime of a `RaftCore`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// A human-readable cluster name, used only in logs.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// This node's stable identity.
    pub node_id: NodeId,

    /// Address this node's Raft RPC transport binds and listens on.
    pub raft_bind_addr: SocketAddr,

    /// All other members of the cluster. Must not contain `node_id`.
    pub peers: Vec<PeerConfig>,

    /// Lower bound of the randomized election timeout, in milliseconds.
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min: u64,

    /// Upper bound of the randomized election timeout, in milliseconds.
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max: u64,

    /// Fixed interval between leader heartbeats, in milliseconds. Must satisfy
    /// `heartbeat_interval * 3 <= election_timeout_min`.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Interval of the apply loop that advances `last_applied` toward `commit_index`.
    #[serde(default = "default_apply_interval")]
    pub apply_interval: u64,

    /// Interval of the periodic snapshot-threshold check.
    #[serde(default = "default_snapshot_check_interval")]
    pub snapshot_check_interval: u64,

    /// Interval of the periodic access-tracker decay sweep, in milliseconds.
    #[serde(default = "default_access_decay_interval")]
    pub access_decay_interval: u64,

    /// Duration of a granted read lease, in milliseconds. Must be strictly
    /// less than `election_timeout_min`.
    #[serde(default = "default_lease_duration")]
    pub lease_duration: u64,

    /// Timeout for a ReadIndex round, in milliseconds.
    #[serde(default = "default_read_index_timeout")]
    pub read_index_timeout: u64,

    /// Timeout for a client proposal to commit, in milliseconds.
    #[serde(default = "default_propose_timeout")]
    pub propose_timeout: u64,

    /// Maximum number of entries batched into a single AppendEntries RPC.
    #[serde(default = "default_max_payload_entries")]
    pub max_payload_entries: u64,

    /// When a log compaction is triggered.
    #[serde(default)]
    pub snapshot_policy: SnapshotPolicy,

    /// Maximum number of keys the KV map may hold before eviction runs.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Fraction of `capacity` evicted per eviction pass.
    #[serde(default = "default_eviction_fraction")]
    pub eviction_fraction: f64,

    /// Directory where the log, hard-state file, and snapshots for this node live.
    pub data_dir: std::path::PathBuf,
}

fn default_cluster_name() -> String {
    "raftkv".to_string()
}
fn default_election_timeout_min() -> u64 {
    150
}
fn default_election_timeout_max() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_apply_interval() -> u64 {
    100
}
fn default_snapshot_check_interval() -> u64 {
    10_000
}
fn default_access_decay_interval() -> u64 {
    3_600_000
}
fn default_lease_duration() -> u64 {
    1_000
}
fn default_read_index_timeout() -> u64 {
    500
}
fn default_propose_timeout() -> u64 {
    5_000
}
fn default_max_payload_entries() -> u64 {
    300
}
fn default_capacity() -> usize {
    100_000
}
fn default_eviction_fraction() -> f64 {
    0.10
}

impl Config {
    /// Load and validate a config from a TOML file.
    ///
    /// This is a thin convenience loader so the demo binary has somewhere to
    /// read its settings from; `validate` is the part of this the core
    /// actually depends on.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the invariants a cluster operator can violate at startup: the
    /// heartbeat/election timeout inequality, peer-id uniqueness, and
    /// self-exclusion from the peer list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::ElectionTimeoutRange(self.election_timeout_min, self.election_timeout_max));
        }
        if self.heartbeat_interval * 3 > self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow(self.heartbeat_interval, self.election_timeout_min));
        }
        if self.lease_duration >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow(self.lease_duration, self.election_timeout_min));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == self.node_id {
                return Err(ConfigError::SelfInPeers(peer.id));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::DuplicatePeer(peer.id));
            }
        }
        Ok(())
    }

    /// Generate a new randomized election timeout within `[min, max)`, in milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        use rand::Rng;
        rand::thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }

    /// The cluster size including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// The number of acknowledgements (including self) needed for a majority.
    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}
