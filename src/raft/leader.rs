//! Leader-role behavior: replication, commit advancement, client writes, and
//! the ReadIndex/lease read path.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::error::RaftResult;
use crate::log::store::DurableLogStore;
use crate::log::Entry;
use crate::log::EntryPayload;
use crate::network::RaftNetwork;
use crate::raft::core::RaftCore;
use crate::raft::core::State;
use crate::raft::core::UpdateCurrentLeader;
use crate::raft::replication::replicate_once;
use crate::raft::replication::ReplicaEvent;
use crate::raft::replication::ReplicatePayload;
use crate::raft::RaftMsg;
use crate::types::LogId;
use crate::types::NodeId;

/// A pending ReadIndex round: resolves once a majority (including this
/// node) has acknowledged a heartbeat sent after the read arrived.
struct PendingReadIndex {
    required_index: u64,
    acked: HashSet<NodeId>,
    tx: crate::raft::ClientReadResponseTx,
}

#[derive(Default, Clone, Copy)]
struct Progress {
    next_index: u64,
    match_index: u64,
}

/// State that exists only while this node is leader; discarded the moment
/// it steps down.
pub(crate) struct LeaderState {
    nodes: BTreeMap<NodeId, Progress>,
    events_tx: mpsc::UnboundedSender<ReplicaEvent>,
    events_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    read_index_waiting: Vec<PendingReadIndex>,
    round_acks: HashSet<NodeId>,
}

impl<S: DurableLogStore, N: RaftNetwork> RaftCore<S, N> {
    pub(crate) async fn run_leader(&mut self) -> RaftResult<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut leader = LeaderState {
            nodes: self
                .config
                .peers
                .iter()
                .map(|p| {
                    (
                        p.id,
                        Progress {
                            next_index: self.log.last_log_id().index + 1,
                            match_index: 0,
                        },
                    )
                })
                .collect(),
            events_tx,
            events_rx,
            read_index_waiting: Vec::new(),
            round_acks: HashSet::new(),
        };

        self.commit_initial_leader_entry().await?;
        self.lease_expires_at = None;

        let heartbeat = Duration::from_millis(self.config.heartbeat_interval);

        loop {
            if self.target_state != State::Leader {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(heartbeat) => {
                    leader.round_acks.clear();
                    self.replicate_to_all(&mut leader);
                }
                Some(event) = leader.events_rx.recv() => {
                    self.handle_replica_event(&mut leader, event).await?;
                }
                Some(rpc) = self.rx_inbound().recv() => {
                    self.dispatch_inbound(rpc).await?;
                }
                Some(msg) = self.rx_api().recv() => {
                    self.handle_leader_api_msg(&mut leader, msg).await?;
                }
                _ = self.rx_shutdown() => {
                    self.set_target_state(State::Shutdown);
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(self.config.apply_interval)) => {
                    self.apply_committed_entries().await?;
                    self.resolve_read_index_waiting(&mut leader);
                }
                _ = tokio::time::sleep(Duration::from_millis(self.config.snapshot_check_interval)) => {
                    self.maybe_compact_log().await?;
                }
                _ = tokio::time::sleep(Duration::from_millis(self.config.access_decay_interval)) => {
                    self.decay_access_tracker();
                }
            }
        }
    }

    /// Every new leader commits a blank entry in its own term immediately:
    /// until an entry from the current term is committed, Raft's safety
    /// argument does not let the leader advance `commit_index` via match
    /// indexes alone (entries from earlier terms can be silently overwritten
    /// by a future leader even after looking committed).
    async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let log_id = LogId::new(self.current_term, self.log.last_log_id().index + 1);
        self.log
            .append(vec![Entry {
                log_id,
                payload: EntryPayload::Blank,
            }])
            .await
    }

    fn replicate_to_all(&mut self, leader: &mut LeaderState) {
        let targets: Vec<NodeId> = leader.nodes.keys().copied().collect();
        for target in targets {
            self.replicate_to_one(leader, target);
        }
    }

    fn replicate_to_one(&mut self, leader: &mut LeaderState, target: NodeId) {
        let progress = *leader.nodes.get(&target).expect("target was just read from nodes");

        let payload = match self.snapshot_last_included {
            Some(snap) if progress.next_index <= snap.index => {
                // The follower's next entry has already been compacted away;
                // it needs the whole state instead.
                match self.state_machine_snapshot_for_transfer(snap) {
                    Some(snapshot) => ReplicatePayload::Snapshot(snapshot),
                    None => return,
                }
            }
            _ => {
                let prev_index = progress.next_index.saturating_sub(1);
                let prev_log_id = if prev_index == 0 {
                    LogId::default()
                } else {
                    match self.log.term_at(prev_index) {
                        Some(term) => LogId::new(term, prev_index),
                        None => LogId::default(),
                    }
                };
                let entries = self
                    .log
                    .entries_from(progress.next_index)
                    .into_iter()
                    .take(self.config.max_payload_entries as usize)
                    .collect();
                ReplicatePayload::Entries { prev_log_id, entries }
            }
        };

        replicate_once(
            self.network.clone(),
            target,
            self.current_term,
            self.id,
            self.commit_index,
            payload,
            leader.events_tx.clone(),
        );
    }

    fn state_machine_snapshot_for_transfer(&self, last_included: LogId) -> Option<crate::snapshot::Snapshot> {
        let (map, last_applied_seq) = self.state_machine.snapshot_image();
        Some(crate::snapshot::Snapshot {
            last_included,
            timestamp: 0,
            map,
            last_applied_seq,
        })
    }

    async fn handle_replica_event(&mut self, leader: &mut LeaderState, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::Success { target, match_index } => {
                leader.round_acks.insert(target);
                if let Some(progress) = leader.nodes.get_mut(&target) {
                    progress.match_index = progress.match_index.max(match_index);
                    progress.next_index = progress.match_index + 1;
                }
                self.recompute_commit_index(leader);
                self.renew_lease_if_quorum_acked(leader);
                self.mark_read_index_acked(leader, target);
            }
            ReplicaEvent::Mismatch { target, conflict_index } => {
                if let Some(progress) = leader.nodes.get_mut(&target) {
                    progress.next_index = conflict_index.map(|i| i + 1).unwrap_or_else(|| progress.next_index.saturating_sub(1)).max(1);
                }
                self.replicate_to_one(leader, target);
            }
            ReplicaEvent::HigherTerm { term } => {
                self.update_current_term(term, None);
                self.save_hard_state().await?;
                self.update_current_leader(UpdateCurrentLeader::Unknown);
                self.lease_expires_at = None;
                self.set_target_state(State::Follower);
            }
            ReplicaEvent::TransportError { .. } => {}
        }
        Ok(())
    }

    /// Advance `commit_index` to the highest index held by a majority of the
    /// cluster (self included), but only if that index was written in the
    /// current term — the election-restriction safety rule (§5.4.2).
    fn recompute_commit_index(&mut self, leader: &LeaderState) {
        let mut indexes: Vec<u64> = leader.nodes.values().map(|p| p.match_index).collect();
        indexes.push(self.log.last_log_id().index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = self.config.quorum_size();
        let Some(&candidate) = indexes.get(quorum - 1) else { return };
        if candidate <= self.commit_index {
            return;
        }
        if self.log.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            self.report_metrics();
        }
    }

    fn renew_lease_if_quorum_acked(&mut self, leader: &LeaderState) {
        if leader.round_acks.len() + 1 >= self.config.quorum_size() {
            self.lease_expires_at = Some(Instant::now() + Duration::from_millis(self.config.lease_duration));
        }
    }

    fn mark_read_index_acked(&mut self, leader: &mut LeaderState, target: NodeId) {
        for pending in &mut leader.read_index_waiting {
            pending.acked.insert(target);
        }
        self.resolve_read_index_waiting(leader);
    }

    fn resolve_read_index_waiting(&mut self, leader: &mut LeaderState) {
        let quorum = self.config.quorum_size();
        let mut remaining = Vec::new();
        for pending in leader.read_index_waiting.drain(..) {
            if pending.acked.len() + 1 >= quorum {
                self.pending_reads.push(crate::raft::core::PendingRead {
                    required_index: pending.required_index,
                    tx: pending.tx,
                });
            } else {
                remaining.push(pending);
            }
        }
        leader.read_index_waiting = remaining;
    }

    async fn handle_leader_api_msg(&mut self, leader: &mut LeaderState, msg: RaftMsg) -> RaftResult<()> {
        match msg {
            RaftMsg::ClientWriteRequest { rpc, tx } => {
                let log_id = LogId::new(self.current_term, self.log.last_log_id().index + 1);
                self.log
                    .append(vec![Entry {
                        log_id,
                        payload: EntryPayload::Normal(rpc.command),
                    }])
                    .await?;
                self.pending_writes.push(crate::raft::core::PendingWrite { log_id, tx });
                self.replicate_to_all(leader);
            }
            RaftMsg::ClientReadRequest { consistency, tx } => {
                // `Strong` always runs a full ReadIndex round, even with a
                // valid lease; `Lease` (and anything weaker) takes the
                // lease fast-path whenever it's still valid.
                if !matches!(consistency, crate::kv::ReadConsistency::Strong) {
                    if let Some(expires_at) = self.lease_expires_at {
                        if Instant::now() < expires_at {
                            let _ = tx.send(Ok(self.commit_index));
                            return Ok(());
                        }
                    }
                }
                leader.read_index_waiting.push(PendingReadIndex {
                    required_index: self.commit_index,
                    acked: HashSet::new(),
                    tx,
                });
                self.replicate_to_all(leader);
            }
            RaftMsg::LocalRead { key, tx } => {
                let _ = tx.send(self.state_machine.get(&key));
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let resp = self.handle_vote_request(rpc).await?;
                let _ = tx.send(Ok(resp));
            }
            RaftMsg::AppendEntries { rpc, tx } => {
                let resp = self.handle_append_entries_request(rpc).await?;
                let _ = tx.send(Ok(resp));
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let resp = self.handle_install_snapshot_request(rpc).await?;
                let _ = tx.send(Ok(resp));
            }
        }
        Ok(())
    }
}
