//! Wire types for the three Raft RPCs.

use serde::Deserialize;
use serde::Serialize;

use crate::kv::Command;
use crate::log::ConflictOpt;
use crate::log::Entry;
use crate::types::LogId;
use crate::types::NodeId;

/// Sent by a candidate to gather votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_id: LogId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Sent by the leader to replicate entries, and as a heartbeat when `entries` is empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_id: LogId,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
    /// Present only when `success` is false; lets the leader jump
    /// `next_index` back to the follower's actual divergence point.
    pub conflict_opt: Option<ConflictOpt>,
}

/// Sent by the leader to bring a follower whose required log entries have
/// already been compacted into a snapshot back up to date. Unlike the
/// teacher's chunked transfer, the whole snapshot body travels in one
/// message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included: LogId,
    pub map: std::collections::HashMap<String, Vec<u8>>,
    pub last_applied_seq: std::collections::HashMap<crate::types::ClientId, crate::types::Seq>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// A client's PUT/DELETE request, submitted through [`crate::raft::RaftHandle::client_write`].
#[derive(Clone, Debug)]
pub struct ClientWriteRequest {
    pub command: Command,
}

#[derive(Clone, Debug)]
pub struct ClientWriteResponse {
    pub log_id: LogId,
}
