//! The error taxonomy for the Raft core.

use thiserror::Error;

use crate::types::NodeId;

pub type RaftResult<T> = Result<T, RaftError>;

/// Errors which originate inside the Raft core itself.
///
/// Transport and stale-term errors never reach this type: they are handled
/// internally (reconnect-with-backoff, reply-and-move-on) and are invisible
/// to callers.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The storage layer reported a failure which cannot be treated as
    /// recoverable; the node has moved itself into `Shutdown`.
    #[error("fatal storage error, node is shutting down: {0}")]
    Durability(#[source] anyhow::Error),

    /// Persisted data failed to decode and was not a tolerated torn tail.
    #[error("storage corruption: {0}")]
    Corruption(String),

    /// The node is in the process of shutting down and cannot service the request.
    #[error("raft node is shutting down")]
    ShuttingDown,

    /// A mismatched snapshot chunk was received (out-of-order `InstallSnapshot`).
    #[error("snapshot stream mismatch: expected offset {expect}, got {got} for snapshot {snapshot_id}")]
    SnapshotMismatch {
        snapshot_id: String,
        expect: u64,
        got: u64,
    },
}

/// Errors returned to a caller attempting a linearizable read.
#[derive(Debug, Error)]
pub enum ClientReadError {
    /// This node is not the leader. `hint` is the last known leader, if any.
    #[error("not leader, hint: {0:?}")]
    NotLeader(Option<NodeId>),

    /// The ReadIndex round did not complete within its deadline.
    #[error("read index confirmation timed out")]
    ReadIndexTimeout,

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Errors returned to a caller attempting a client write (PUT/DELETE).
#[derive(Debug, Error)]
pub enum ClientWriteError {
    /// This node is not the leader. `hint` is the last known leader, if any.
    #[error("not leader, hint: {0:?}")]
    NotLeader(Option<NodeId>),

    /// The proposal was appended locally but did not commit within its deadline.
    /// The caller should retry idempotently using the same `(client_id, seq)`.
    #[error("proposal did not commit before the deadline")]
    CommitTimeout,

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Errors raised while loading/validating a `Config`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("heartbeat_interval * 3 ({0}ms) must be <= election_timeout_min ({1}ms)")]
    HeartbeatTooSlow(u64, u64),

    #[error("election_timeout_min ({0}ms) must be < election_timeout_max ({1}ms)")]
    ElectionTimeoutRange(u64, u64),

    #[error("peer list contains this node's own id ({0})")]
    SelfInPeers(NodeId),

    #[error("duplicate peer id {0} in peer list")]
    DuplicatePeer(NodeId),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
