//! Wires storage, transport, and the state machine into a running
//! [`raft::RaftHandle`], and exposes the cache's client-facing operations.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::kv::Command;
use crate::kv::KvStateMachine;
use crate::kv::LruEvictionPolicy;
use crate::kv::ReadConsistency;
use crate::log::store::FileLogStore;
use crate::network::InboundRpc;
use crate::network::TcpNetwork;
use crate::raft::rpc::ClientWriteRequest;
use crate::raft::rpc::ClientWriteResponse;
use crate::raft::RaftHandle;
use crate::snapshot::FileSnapshotStore;
use crate::term_store::FileTermStore;
use crate::types::ClientId;
use crate::types::Seq;

/// A running cache node: the `RaftCore` actor, its TCP transport, and the
/// listener task that feeds inbound RPCs to it.
pub struct Node {
    pub config: Arc<Config>,
    handle: RaftHandle,
    listener: JoinHandle<std::io::Result<()>>,
}

impl Node {
    /// Open this node's storage, start its RPC listener, and spawn the Raft
    /// core actor. `config` must already satisfy [`Config::validate`].
    pub async fn start(config: Config) -> crate::error::RaftResult<Self> {
        config.validate().map_err(|e| crate::error::RaftError::Corruption(e.to_string()))?;
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| crate::error::RaftError::Durability(e.into()))?;

        let log_store = FileLogStore::open(&config.data_dir).await?;
        let term_store = FileTermStore::open(&config.data_dir).await?;
        let snapshot_store = FileSnapshotStore::open(&config.data_dir).await?;
        let state_machine = KvStateMachine::new(config.capacity, config.eviction_fraction, Box::new(LruEvictionPolicy));

        let config = Arc::new(config);
        let network = Arc::new(TcpNetwork::new(&config));

        let (tx_inbound, rx_inbound) = mpsc::channel::<InboundRpc>(1024);
        let bind_addr = config.raft_bind_addr;
        let listener = tokio::spawn(TcpNetwork::serve(bind_addr, tx_inbound));

        let handle = RaftHandle::spawn(config.clone(), log_store, term_store, snapshot_store, state_machine, network, rx_inbound);

        Ok(Self { config, handle, listener })
    }

    pub fn handle(&self) -> &RaftHandle {
        &self.handle
    }

    /// Propose a PUT. Resolves once the entry has committed and been applied.
    pub async fn put(&self, key: String, value: Vec<u8>, client_id: ClientId, seq: Seq) -> Result<ClientWriteResponse, ClientWriteError> {
        self.handle
            .client_write(ClientWriteRequest {
                command: Command::Put { key, value, client_id, seq },
            })
            .await
    }

    pub async fn delete(&self, key: String, client_id: ClientId, seq: Seq) -> Result<ClientWriteResponse, ClientWriteError> {
        self.handle
            .client_write(ClientWriteRequest {
                command: Command::Delete { key, client_id, seq },
            })
            .await
    }

    /// Read `key` at the requested consistency level. `Stale` answers from
    /// this replica immediately with no consensus round at all. `Lease`
    /// confirms leadership via a still-valid read lease, falling back to a
    /// ReadIndex quorum round only if the lease has expired. `Strong` always
    /// runs the full ReadIndex round regardless of the lease.
    pub async fn get(&self, key: &str, consistency: ReadConsistency) -> Result<Option<Vec<u8>>, ClientReadError> {
        if !matches!(consistency, ReadConsistency::Stale) {
            self.handle.client_read(consistency).await?;
        }
        Ok(self.handle.local_read(key).await)
    }

    /// Reverse-order shutdown: stop the Raft core first (in-flight proposals
    /// fail with `ShuttingDown` rather than hang), then tear down the
    /// listener. The log/term/snapshot files are closed by `Drop` once the
    /// core task's storage handles go out of scope.
    pub async fn shutdown(self) -> crate::error::RaftResult<()> {
        self.handle.shutdown().await?;
        self.listener.abort();
        Ok(())
    }
}
