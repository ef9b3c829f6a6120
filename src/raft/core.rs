//! The `RaftCore` actor: the single task that owns every piece of mutable
//! Raft state and drives role transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::kv::KvStateMachine;
use crate::log::store::DurableLogStore;
use crate::log::RaftLog;
use crate::metrics::LeaderMetrics;
use crate::metrics::NodeState;
use crate::metrics::RaftMetrics;
use crate::network::InboundRpc;
use crate::network::RaftNetwork;
use crate::raft::RaftMsg;
use crate::snapshot::FileSnapshotStore;
use crate::snapshot::Snapshot;
use crate::term_store::FileTermStore;
use crate::types::LogId;
use crate::types::NodeId;

/// The role this node currently believes it holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl State {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    fn as_node_state(&self) -> NodeState {
        match self {
            State::Follower => NodeState::Follower,
            State::Candidate => NodeState::Candidate,
            State::Leader => NodeState::Leader,
            State::Shutdown => NodeState::Shutdown,
        }
    }
}

pub(crate) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// Waiting for a client proposal at `log_id` to be applied, or for a
/// ReadIndex round to resolve against `last_applied`.
pub(crate) struct PendingWrite {
    pub log_id: LogId,
    pub tx: crate::raft::ClientWriteResponseTx,
}

pub(crate) struct PendingRead {
    pub required_index: u64,
    pub tx: crate::raft::ClientReadResponseTx,
}

pub struct RaftCore<S: DurableLogStore, N: RaftNetwork> {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) network: Arc<N>,

    pub(crate) log: RaftLog<S>,
    pub(crate) term_store: FileTermStore,
    pub(crate) snapshot_store: FileSnapshotStore,
    pub(crate) state_machine: KvStateMachine,

    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: LogId,
    pub(crate) snapshot_last_included: Option<LogId>,
    pub(crate) current_leader: Option<NodeId>,
    pub(crate) target_state: State,

    pub(crate) last_heartbeat: Option<Instant>,
    pub(crate) next_election_timeout: Option<Instant>,
    /// While leader: the lease extended on each heartbeat round a majority acks within.
    pub(crate) lease_expires_at: Option<Instant>,

    pub(crate) pending_writes: Vec<PendingWrite>,
    pub(crate) pending_reads: Vec<PendingRead>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg>,
    rx_inbound: mpsc::Receiver<InboundRpc>,
    rx_shutdown: oneshot::Receiver<()>,
    tx_metrics: watch::Sender<RaftMetrics>,
    pub(crate) leader_metrics: LeaderMetrics,
}

impl<S: DurableLogStore, N: RaftNetwork> RaftCore<S, N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        config: Arc<Config>,
        log_store: S,
        term_store: FileTermStore,
        snapshot_store: FileSnapshotStore,
        state_machine: KvStateMachine,
        network: Arc<N>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg>,
        rx_inbound: mpsc::Receiver<InboundRpc>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let id = config.node_id;
        tokio::spawn(async move {
            let log = RaftLog::open(log_store).await?;
            let hard_state = term_store.load().await?;
            let mut state_machine = state_machine;
            let mut last_applied = LogId::default();
            let mut snapshot_last_included = None;

            if let Some(snapshot) = snapshot_store.load_latest().await? {
                state_machine.restore(snapshot.map.clone(), snapshot.last_applied_seq.clone());
                last_applied = snapshot.last_included;
                snapshot_last_included = Some(snapshot.last_included);
            }
            // A snapshot can be ahead of what this node had already applied
            // from its own log before a crash; never regress below it.
            last_applied = last_applied.max(LogId::default());

            let this = RaftCore {
                id,
                config,
                network,
                log,
                term_store,
                snapshot_store,
                state_machine,
                current_term: hard_state.current_term,
                voted_for: hard_state.voted_for,
                commit_index: last_applied.index,
                last_applied,
                snapshot_last_included,
                current_leader: None,
                target_state: State::Follower,
                last_heartbeat: None,
                next_election_timeout: None,
                pending_writes: Vec::new(),
                pending_reads: Vec::new(),
                rx_api,
                rx_inbound,
                rx_shutdown,
                tx_metrics,
                leader_metrics: LeaderMetrics::default(),
            };
            this.main().await
        })
    }

    async fn main(mut self) -> RaftResult<()> {
        tracing::info!(id = self.id, "raft node starting");
        self.report_metrics();

        loop {
            match self.target_state {
                State::Follower => self.run_follower().await?,
                State::Candidate => self.run_candidate().await?,
                State::Leader => self.run_leader().await?,
                State::Shutdown => {
                    tracing::info!(id = self.id, "raft node shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn set_target_state(&mut self, target_state: State) {
        if self.target_state == State::Leader && target_state != State::Leader {
            self.fail_pending_as_not_leader();
        }
        self.target_state = target_state;
        self.report_metrics();
    }

    /// Drain every outstanding client write/read with a `NotLeader` error.
    /// Called whenever this node steps down from leader, so a caller waiting
    /// on a proposal that may never commit (its entry could be overwritten by
    /// whoever becomes leader next) doesn't hang until its own timeout.
    fn fail_pending_as_not_leader(&mut self) {
        for pending in self.pending_writes.drain(..) {
            let _ = pending.tx.send(Err(crate::error::ClientWriteError::NotLeader(self.current_leader)));
        }
        for pending in self.pending_reads.drain(..) {
            let _ = pending.tx.send(Err(crate::error::ClientReadError::NotLeader(self.current_leader)));
        }
    }

    pub(crate) fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    pub(crate) fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    pub(crate) fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        self.current_leader = match update {
            UpdateCurrentLeader::ThisNode => Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => Some(target),
            UpdateCurrentLeader::Unknown => None,
        };
    }

    /// Move to `new_term` if it is strictly greater than the current one,
    /// forgetting any vote cast in an earlier term.
    pub(crate) fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    pub(crate) async fn save_hard_state(&mut self) -> RaftResult<()> {
        self.term_store
            .save(&crate::term_store::HardState {
                current_term: self.current_term,
                voted_for: self.voted_for,
            })
            .await
    }

    pub(crate) fn map_fatal_storage_error(&mut self, err: RaftError) -> RaftError {
        tracing::error!(id = self.id, error = %err, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        err
    }

    pub(crate) fn report_metrics(&mut self) {
        let _ = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state.as_node_state(),
            current_term: self.current_term,
            last_log_index: self.log.last_log_id().index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            snapshot: self.snapshot_last_included,
            leader_metrics: if self.target_state.is_leader() {
                Some(self.leader_metrics.clone())
            } else {
                None
            },
        });
    }

    /// Drive the `last_applied` cursor forward to `commit_index`, applying
    /// every intervening entry to the state machine in order, and resolving
    /// any pending client writes/reads that become satisfiable.
    pub(crate) async fn apply_committed_entries(&mut self) -> RaftResult<()> {
        if self.commit_index <= self.last_applied.index {
            return Ok(());
        }

        let entries = self.log.entries_from(self.last_applied.index + 1);
        for entry in entries {
            if entry.log_id.index > self.commit_index {
                break;
            }
            if let crate::log::EntryPayload::Normal(cmd) = &entry.payload {
                self.state_machine.apply(cmd).await;
            }
            self.last_applied = entry.log_id;
        }
        self.report_metrics();

        self.resolve_pending_writes();
        self.resolve_pending_reads();
        Ok(())
    }

    /// Resolve a pending write only once the entry *at its index* is
    /// confirmed to be the same one this node proposed — matching on index
    /// alone would report success for a write whose entry was silently
    /// overwritten at that index by a different leader in a later term.
    fn resolve_pending_writes(&mut self) {
        let last_applied = self.last_applied;
        let mut remaining = Vec::new();
        for pending in self.pending_writes.drain(..) {
            if pending.log_id.index > last_applied.index {
                remaining.push(pending);
                continue;
            }
            let same_entry = self
                .log
                .term_at(pending.log_id.index)
                .map(|term| term == pending.log_id.term)
                .unwrap_or_else(|| Some(pending.log_id.index) <= self.snapshot_last_included.map(|s| s.index));
            if same_entry {
                let _ = pending.tx.send(Ok(crate::raft::rpc::ClientWriteResponse { log_id: pending.log_id }));
            } else {
                let _ = pending.tx.send(Err(crate::error::ClientWriteError::NotLeader(self.current_leader)));
            }
        }
        self.pending_writes = remaining;
    }

    fn resolve_pending_reads(&mut self) {
        let last_applied_index = self.last_applied.index;
        let mut remaining = Vec::new();
        for pending in self.pending_reads.drain(..) {
            if pending.required_index <= last_applied_index {
                let _ = pending.tx.send(Ok(last_applied_index));
            } else {
                remaining.push(pending);
            }
        }
        self.pending_reads = remaining;
    }

    /// Take a snapshot once the log has grown far enough past the last
    /// compaction point, per `config.snapshot_policy`. Driven by the
    /// snapshot-check scheduler, independent of the apply loop.
    pub(crate) async fn maybe_compact_log(&mut self) -> RaftResult<()> {
        let crate::config::SnapshotPolicy::EntriesSinceLast(threshold) = self.config.snapshot_policy;
        let since_last = self.last_applied.index.saturating_sub(self.snapshot_last_included.map(|l| l.index).unwrap_or(0));
        if since_last <= threshold {
            return Ok(());
        }

        let (map, last_applied_seq) = self.state_machine.snapshot_image();
        let snapshot = Snapshot {
            last_included: self.last_applied,
            timestamp: 0,
            map,
            last_applied_seq,
        };
        self.snapshot_store.save(&snapshot).await?;
        self.snapshot_last_included = Some(self.last_applied);
        self.log.compact_through(self.last_applied.index).await?;
        self.report_metrics();
        Ok(())
    }

    /// Sweep the access tracker's stale per-key timestamps. Driven by the
    /// same kind of periodic tick as `maybe_compact_log`, independent of
    /// role and of the apply loop.
    pub(crate) fn decay_access_tracker(&self) {
        self.state_machine.access_tracker().decay();
    }

    /// Handle one inbound RPC or API message. Shared across all three role
    /// loops so `RequestVote`/`AppendEntries` are answered no matter which
    /// state this node is in.
    pub(crate) async fn dispatch_inbound(&mut self, rpc: InboundRpc) -> RaftResult<()> {
        match rpc {
            InboundRpc::Vote(req, reply) => {
                let resp = self.handle_vote_request(req).await?;
                let _ = reply.send(resp);
            }
            InboundRpc::AppendEntries(req, reply) => {
                let resp = self.handle_append_entries_request(req).await?;
                let _ = reply.send(resp);
            }
            InboundRpc::InstallSnapshot(req, reply) => {
                let resp = self.handle_install_snapshot_request(req).await?;
                let _ = reply.send(resp);
            }
        }
        Ok(())
    }

    pub(crate) fn rx_api(&mut self) -> &mut mpsc::UnboundedReceiver<RaftMsg> {
        &mut self.rx_api
    }

    pub(crate) fn rx_inbound(&mut self) -> &mut mpsc::Receiver<InboundRpc> {
        &mut self.rx_inbound
    }

    pub(crate) fn rx_shutdown(&mut self) -> &mut oneshot::Receiver<()> {
        &mut self.rx_shutdown
    }
}
