//! Per-follower replication RPCs, fired off as one-shot concurrent tasks
//! each round so the leader loop never blocks on a slow follower.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::log::Entry;
use crate::network::RaftNetwork;
use crate::raft::rpc::AppendEntriesRequest;
use crate::raft::rpc::InstallSnapshotRequest;
use crate::snapshot::Snapshot;
use crate::types::LogId;
use crate::types::NodeId;

/// What the leader needs to send a follower this round.
pub(crate) enum ReplicatePayload {
    /// Send `entries` after `prev_log_id` (may be empty: a heartbeat).
    Entries { prev_log_id: LogId, entries: Vec<Entry> },
    /// `next_index` has fallen at or below the leader's own compaction
    /// point; the follower needs the whole state instead.
    Snapshot(Snapshot),
}

/// Reported back to the leader loop once a follower's round completes.
pub(crate) enum ReplicaEvent {
    Success { target: NodeId, match_index: u64 },
    Mismatch { target: NodeId, conflict_index: Option<u64> },
    HigherTerm { term: u64 },
    TransportError { target: NodeId },
}

/// Fire one replication RPC at `target` in the background and deliver the
/// outcome on `events_tx`. Returns immediately; never blocks the leader loop.
pub(crate) fn replicate_once<N: RaftNetwork>(
    network: Arc<N>,
    target: NodeId,
    term: u64,
    leader_id: NodeId,
    leader_commit: u64,
    payload: ReplicatePayload,
    events_tx: mpsc::UnboundedSender<ReplicaEvent>,
) {
    tokio::spawn(async move {
        let event = match payload {
            ReplicatePayload::Entries { prev_log_id, entries } => {
                let req = AppendEntriesRequest {
                    term,
                    leader_id,
                    prev_log_id,
                    entries,
                    leader_commit,
                };
                match network.send_append_entries(target, req).await {
                    Ok(resp) if resp.term > term => ReplicaEvent::HigherTerm { term: resp.term },
                    Ok(resp) if resp.success => ReplicaEvent::Success { target, match_index: resp.match_index },
                    Ok(resp) => ReplicaEvent::Mismatch {
                        target,
                        conflict_index: resp.conflict_opt.map(|c| c.log_id.index),
                    },
                    Err(_) => ReplicaEvent::TransportError { target },
                }
            }
            ReplicatePayload::Snapshot(snapshot) => {
                let last_included = snapshot.last_included;
                let req = InstallSnapshotRequest {
                    term,
                    leader_id,
                    last_included,
                    map: snapshot.map,
                    last_applied_seq: snapshot.last_applied_seq,
                };
                match network.send_install_snapshot(target, req).await {
                    Ok(resp) if resp.term > term => ReplicaEvent::HigherTerm { term: resp.term },
                    Ok(_) => ReplicaEvent::Success { target, match_index: last_included.index },
                    Err(_) => ReplicaEvent::TransportError { target },
                }
            }
        };
        let _ = events_tx.send(event);
    });
}
