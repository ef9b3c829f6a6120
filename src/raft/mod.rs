//! The public Raft handle and the actor it talks to.

pub mod core;
pub mod election;
pub mod follower;
pub mod leader;
pub mod replication;
pub mod rpc;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::kv::EvictionPolicy;
use crate::kv::ReadConsistency;
use crate::log::store::DurableLogStore;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::InboundRpc;
use crate::network::RaftNetwork;
use crate::snapshot::FileSnapshotStore;
use crate::term_store::FileTermStore;
use crate::types::NodeId;

use self::core::RaftCore;
use self::rpc::AppendEntriesRequest;
use self::rpc::AppendEntriesResponse;
use self::rpc::ClientWriteRequest;
use self::rpc::ClientWriteResponse;
use self::rpc::InstallSnapshotRequest;
use self::rpc::InstallSnapshotResponse;
use self::rpc::VoteRequest;
use self::rpc::VoteResponse;

pub(crate) type ClientWriteResponseTx = oneshot::Sender<Result<ClientWriteResponse, ClientWriteError>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<u64, ClientReadError>>;
pub(crate) type LocalReadResponseTx = oneshot::Sender<Option<Vec<u8>>>;

/// A message coming from [`RaftHandle`] into the `RaftCore` actor.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest,
        tx: ClientWriteResponseTx,
    },
    /// Resolves once `last_applied` reaches the index a successful lease
    /// check or ReadIndex round observed as committed. `consistency` decides
    /// whether a valid lease alone is enough or a full ReadIndex round is
    /// required regardless of the lease.
    ClientReadRequest {
        consistency: ReadConsistency,
        tx: ClientReadResponseTx,
    },
    /// Read `key` out of the state machine this node currently holds, with no
    /// consistency guarantee of its own. Answered immediately in every role;
    /// callers needing a linearizable read issue a `ClientReadRequest` first
    /// and only query this once it resolves.
    LocalRead {
        key: String,
        tx: LocalReadResponseTx,
    },
}

struct RaftInner {
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    join_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// A cheaply-cloneable handle to a running Raft node.
///
/// All of the interesting state lives in the `RaftCore` actor task this
/// spawns; every method here is a request/response round trip over a
/// channel.
#[derive(Clone)]
pub struct RaftHandle {
    inner: Arc<RaftInner>,
}

impl RaftHandle {
    /// Spawn the `RaftCore` actor and return a handle to it.
    pub fn spawn<S, N>(
        config: Arc<Config>,
        log_store: S,
        term_store: FileTermStore,
        snapshot_store: FileSnapshotStore,
        state_machine: crate::kv::KvStateMachine,
        network: Arc<N>,
        rx_inbound: mpsc::Receiver<InboundRpc>,
    ) -> Self
    where
        S: DurableLogStore,
        N: RaftNetwork,
    {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(config.node_id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        let join_handle = RaftCore::spawn(
            config,
            log_store,
            term_store,
            snapshot_store,
            state_machine,
            network,
            rx_api,
            rx_inbound,
            tx_metrics,
            rx_shutdown,
        );

        Self {
            inner: Arc::new(RaftInner {
                tx_api,
                rx_metrics,
                join_handle: Mutex::new(Some(join_handle)),
                tx_shutdown: Mutex::new(Some(tx_shutdown)),
            }),
        }
    }

    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send(RaftMsg::AppendEntries { rpc, tx }).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send(RaftMsg::RequestVote { rpc, tx }).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send(RaftMsg::InstallSnapshot { rpc, tx }).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Propose a PUT/DELETE command. Resolves once committed and applied, or
    /// fails with `CommitTimeout` after `config.propose_timeout`.
    pub async fn client_write(&self, rpc: ClientWriteRequest) -> Result<ClientWriteResponse, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ClientWriteRequest { rpc, tx })
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?
    }

    /// Confirm this node may serve a read at `consistency` right now. Returns
    /// the index the caller's `get` must wait for `last_applied` to reach.
    /// `Lease` accepts a still-valid leader lease with no quorum round trip;
    /// `Strong` always runs a full ReadIndex round even if the lease is
    /// valid. `Stale` has no meaning here — callers requesting it should
    /// skip `client_read` entirely and go straight to `local_read`.
    pub async fn client_read(&self, consistency: ReadConsistency) -> Result<u64, ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ClientReadRequest { consistency, tx })
            .map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?
    }

    /// Read `key` out of this node's own replica, with whatever consistency
    /// the caller already established (or none, for a stale read).
    pub async fn local_read(&self, key: impl Into<String>) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx_api.send(RaftMsg::LocalRead { key: key.into(), tx }).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// A handle for awaiting a condition over this node's metrics stream.
    pub fn wait(&self) -> Wait {
        Wait::new(self.inner.rx_metrics.clone())
    }

    pub async fn shutdown(&self) -> RaftResult<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.join_handle.lock().await.take() {
            return handle.await.map_err(|_| RaftError::ShuttingDown)?;
        }
        Ok(())
    }
}
