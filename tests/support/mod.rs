//! A fast, deterministic `RaftNetwork` double that dispatches RPCs directly
//! to other nodes in the same test process, the same role `memstore` plays
//! for storage in integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use raftkv::config::Config;
use raftkv::config::PeerConfig;
use raftkv::kv::KvStateMachine;
use raftkv::kv::LruEvictionPolicy;
use raftkv::log::store::FileLogStore;
use raftkv::network::RaftNetwork;
use raftkv::raft::rpc::AppendEntriesRequest;
use raftkv::raft::rpc::AppendEntriesResponse;
use raftkv::raft::rpc::InstallSnapshotRequest;
use raftkv::raft::rpc::InstallSnapshotResponse;
use raftkv::raft::rpc::VoteRequest;
use raftkv::raft::rpc::VoteResponse;
use raftkv::raft::RaftHandle;
use raftkv::snapshot::FileSnapshotStore;
use raftkv::term_store::FileTermStore;
use raftkv::types::NodeId;

pub struct InProcessNetwork {
    nodes: RwLock<HashMap<NodeId, RaftHandle>>,
    unreachable: RwLock<std::collections::HashSet<NodeId>>,
}

impl InProcessNetwork {
    fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(std::collections::HashSet::new()),
        }
    }

    pub async fn register(&self, id: NodeId, handle: RaftHandle) {
        self.nodes.write().await.insert(id, handle);
    }

    /// Simulate a network partition: RPCs to `id` fail until this is called
    /// again with `false`.
    pub async fn set_unreachable(&self, id: NodeId, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    async fn handle_for(&self, target: NodeId) -> std::io::Result<RaftHandle> {
        if self.unreachable.read().await.contains(&target) {
            return Err(std::io::Error::other(format!("test node {target} is partitioned away")));
        }
        self.nodes
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or_else(|| std::io::Error::other(format!("no such test node {target}")))
    }
}

#[async_trait]
impl RaftNetwork for InProcessNetwork {
    async fn send_vote(&self, target: NodeId, req: VoteRequest) -> std::io::Result<VoteResponse> {
        self.handle_for(target).await?.vote(req).await.map_err(std::io::Error::other)
    }

    async fn send_append_entries(&self, target: NodeId, req: AppendEntriesRequest) -> std::io::Result<AppendEntriesResponse> {
        self.handle_for(target).await?.append_entries(req).await.map_err(std::io::Error::other)
    }

    async fn send_install_snapshot(&self, target: NodeId, req: InstallSnapshotRequest) -> std::io::Result<InstallSnapshotResponse> {
        self.handle_for(target).await?.install_snapshot(req).await.map_err(std::io::Error::other)
    }
}

/// A running test node: its `RaftHandle` plus the config and `TempDir` its
/// storage lives in (kept alive for the harness's lifetime, removed on drop).
pub struct TestNode {
    pub id: NodeId,
    pub handle: RaftHandle,
    pub config: Arc<Config>,
    data_dir: tempfile::TempDir,
}

/// Bring up `n` nodes sharing one `InProcessNetwork`, with a small, fast
/// timing profile so elections and applies settle quickly in tests.
pub async fn cluster(n: u64) -> (Arc<InProcessNetwork>, Vec<TestNode>) {
    cluster_with(n, |_| {}).await
}

/// Like `cluster`, but `customize` runs against each node's config after the
/// shared defaults are filled in and before the node is spawned, so a test
/// can dial in things like a small `snapshot_policy` threshold.
pub async fn cluster_with(n: u64, customize: impl Fn(&mut Config)) -> (Arc<InProcessNetwork>, Vec<TestNode>) {
    let network = Arc::new(InProcessNetwork::new());
    let mut test_nodes = Vec::new();

    for id in 1..=n {
        let peers: Vec<PeerConfig> = (1..=n)
            .filter(|&p| p != id)
            .map(|p| PeerConfig {
                id: p,
                addr: format!("127.0.0.1:{}", 10_000 + p).parse().unwrap(),
            })
            .collect();

        let data_dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            cluster_name: "test".into(),
            node_id: id,
            raft_bind_addr: format!("127.0.0.1:{}", 10_000 + id).parse().unwrap(),
            peers,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 30,
            apply_interval: 20,
            snapshot_check_interval: 60_000,
            access_decay_interval: 60_000,
            lease_duration: 100,
            read_index_timeout: 500,
            propose_timeout: 2_000,
            max_payload_entries: 300,
            snapshot_policy: raftkv::config::SnapshotPolicy::EntriesSinceLast(50),
            capacity: 10_000,
            eviction_fraction: 0.1,
            data_dir: data_dir.path().to_path_buf(),
        };
        customize(&mut config);
        config.validate().expect("test config must be valid");
        let config = Arc::new(config);

        let log_store = FileLogStore::open(&config.data_dir).await.unwrap();
        let term_store = FileTermStore::open(&config.data_dir).await.unwrap();
        let snapshot_store = FileSnapshotStore::open(&config.data_dir).await.unwrap();
        let state_machine = KvStateMachine::new(config.capacity, config.eviction_fraction, Box::new(LruEvictionPolicy));
        let (_tx_inbound, rx_inbound) = tokio::sync::mpsc::channel(64);

        let handle = RaftHandle::spawn(config.clone(), log_store, term_store, snapshot_store, state_machine, network.clone(), rx_inbound);

        network.register(id, handle.clone()).await;
        test_nodes.push(TestNode {
            id,
            handle,
            config,
            data_dir,
        });
    }

    (network, test_nodes)
}

/// Shut the given node's actor down and spawn a fresh one over the same
/// on-disk log/term/snapshot files and node id, re-registering it with
/// `network` so peers reach the restarted node transparently.
pub async fn restart_node(network: &Arc<InProcessNetwork>, node: TestNode) -> TestNode {
    node.handle.shutdown().await.expect("clean shutdown");

    let config = node.config;
    let log_store = FileLogStore::open(&config.data_dir).await.unwrap();
    let term_store = FileTermStore::open(&config.data_dir).await.unwrap();
    let snapshot_store = FileSnapshotStore::open(&config.data_dir).await.unwrap();
    let state_machine = KvStateMachine::new(config.capacity, config.eviction_fraction, Box::new(LruEvictionPolicy));
    let (_tx_inbound, rx_inbound) = tokio::sync::mpsc::channel(64);

    let handle = RaftHandle::spawn(config.clone(), log_store, term_store, snapshot_store, state_machine, network.clone(), rx_inbound);
    network.register(node.id, handle.clone()).await;

    TestNode {
        id: node.id,
        handle,
        config,
        data_dir: node.data_dir,
    }
}

pub async fn wait_for_leader(nodes: &[TestNode], timeout: Duration) -> NodeId {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for node in nodes {
            let metrics = node.handle.metrics().borrow().clone();
            if metrics.current_leader == Some(node.id) {
                return node.id;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no leader elected within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
