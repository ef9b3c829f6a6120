//! End-to-end cluster behavior, driven through the in-process network double
//! in `support`.

mod support;

use std::time::Duration;

use raftkv::config::SnapshotPolicy;
use raftkv::kv::Command;
use raftkv::kv::ReadConsistency;
use raftkv::log::store::DurableLogStore;
use raftkv::log::store::FileLogStore;
use raftkv::metrics::NodeState;
use raftkv::raft::rpc::ClientWriteRequest;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_single_node_cluster_elects_itself_leader() {
    let (_network, nodes) = support::cluster(1).await;
    let leader = support::wait_for_leader(&nodes, Duration::from_secs(2)).await;
    assert_eq!(leader, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_elects_exactly_one_leader() {
    let (_network, nodes) = support::cluster(3).await;
    let leader_id = support::wait_for_leader(&nodes, Duration::from_secs(5)).await;

    let leader_count = futures::future::join_all(nodes.iter().map(|n| async { n.handle.metrics().borrow().state == NodeState::Leader }))
        .await
        .into_iter()
        .filter(|&is_leader| is_leader)
        .count();
    assert_eq!(leader_count, 1);
    assert!(nodes.iter().any(|n| n.id == leader_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_committed_write_is_visible_on_the_leader() {
    let (_network, nodes) = support::cluster(3).await;
    let leader_id = support::wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let leader = nodes.iter().find(|n| n.id == leader_id).unwrap();

    leader
        .handle
        .client_write(ClientWriteRequest {
            command: Command::Put {
                key: "hello".into(),
                value: b"world".to_vec(),
                client_id: 1,
                seq: 1,
            },
        })
        .await
        .expect("write should commit");

    leader
        .handle
        .client_read(ReadConsistency::Strong)
        .await
        .expect("leader should confirm its own leadership");
    assert_eq!(leader.handle.local_read("hello").await, Some(b"world".to_vec()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_write_replicates_to_every_follower() {
    let (_network, nodes) = support::cluster(3).await;
    let leader_id = support::wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let leader = nodes.iter().find(|n| n.id == leader_id).unwrap();

    leader
        .handle
        .client_write(ClientWriteRequest {
            command: Command::Put {
                key: "k".into(),
                value: b"v".to_vec(),
                client_id: 9,
                seq: 1,
            },
        })
        .await
        .expect("write should commit");

    for node in &nodes {
        node.handle
            .wait()
            .until(Duration::from_secs(2), |m| m.last_applied >= 1)
            .await
            .unwrap_or_else(|_| panic!("node {} never applied the write", node.id));
        assert_eq!(node.handle.local_read("k").await, Some(b"v".to_vec()), "node {} missing replicated key", node.id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_non_leader_rejects_client_writes() {
    let (_network, nodes) = support::cluster(3).await;
    let leader_id = support::wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let follower = nodes.iter().find(|n| n.id != leader_id).unwrap();

    let result = follower
        .handle
        .client_write(ClientWriteRequest {
            command: Command::Put {
                key: "k".into(),
                value: b"v".to_vec(),
                client_id: 1,
                seq: 1,
            },
        })
        .await;

    assert!(matches!(result, Err(raftkv::ClientWriteError::NotLeader(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_client_requests_apply_at_most_once() {
    let (_network, nodes) = support::cluster(1).await;
    support::wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let leader = &nodes[0];

    for _ in 0..2 {
        leader
            .handle
            .client_write(ClientWriteRequest {
                command: Command::Put {
                    key: "dup".into(),
                    value: b"first".to_vec(),
                    client_id: 5,
                    seq: 1,
                },
            })
            .await
            .unwrap();
    }

    leader
        .handle
        .client_write(ClientWriteRequest {
            command: Command::Put {
                key: "dup".into(),
                value: b"second".to_vec(),
                client_id: 5,
                seq: 1,
            },
        })
        .await
        .unwrap();

    assert_eq!(leader.handle.local_read("dup").await, Some(b"first".to_vec()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_reads_do_not_require_a_leader_quorum_round() {
    let (_network, nodes) = support::cluster(3).await;
    let leader_id = support::wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let leader = nodes.iter().find(|n| n.id == leader_id).unwrap();

    leader
        .handle
        .client_write(ClientWriteRequest {
            command: Command::Put {
                key: "k".into(),
                value: b"v".to_vec(),
                client_id: 1,
                seq: 1,
            },
        })
        .await
        .unwrap();

    let follower = nodes.iter().find(|n| n.id != leader_id).unwrap();
    follower
        .handle
        .wait()
        .until(Duration::from_secs(2), |m| m.last_applied >= 1)
        .await
        .unwrap();
    // `Stale` never contacts the leader; it just reads this replica directly.
    let _ = ReadConsistency::Stale;
    assert_eq!(follower.handle.local_read("k").await, Some(b"v".to_vec()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_client_writes_all_commit_and_apply() {
    let (_network, nodes) = support::cluster(3).await;
    let leader_id = support::wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let leader = nodes.iter().find(|n| n.id == leader_id).unwrap();

    let writes = (0..8u64).map(|i| {
        leader.handle.client_write(ClientWriteRequest {
            command: Command::Put {
                key: format!("k{i}"),
                value: i.to_be_bytes().to_vec(),
                client_id: i,
                seq: 1,
            },
        })
    });
    let results = futures::future::join_all(writes).await;
    for (i, result) in results.into_iter().enumerate() {
        result.unwrap_or_else(|_| panic!("write {i} should commit"));
    }

    for i in 0..8u64 {
        assert_eq!(leader.handle.local_read(format!("k{i}")).await, Some(i.to_be_bytes().to_vec()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_restarted_follower_recovers_its_committed_state() {
    let (network, mut nodes) = support::cluster(3).await;
    let leader_id = support::wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let leader = nodes.iter().find(|n| n.id == leader_id).unwrap();

    leader
        .handle
        .client_write(ClientWriteRequest {
            command: Command::Put {
                key: "before-restart".into(),
                value: b"v1".to_vec(),
                client_id: 1,
                seq: 1,
            },
        })
        .await
        .expect("write should commit");

    let follower_idx = nodes.iter().position(|n| n.id != leader_id).unwrap();
    for node in &nodes {
        node.handle
            .wait()
            .until(Duration::from_secs(2), |m| m.last_applied >= 1)
            .await
            .unwrap_or_else(|_| panic!("node {} never applied the write", node.id));
    }

    let restarted = support::restart_node(&network, nodes.remove(follower_idx)).await;
    let restarted_id = restarted.id;
    nodes.insert(follower_idx, restarted);

    nodes[follower_idx]
        .handle
        .wait()
        .until(Duration::from_secs(5), |m| m.last_applied >= 1)
        .await
        .unwrap_or_else(|_| panic!("restarted node {restarted_id} never recovered its applied state"));
    assert_eq!(nodes[follower_idx].handle.local_read("before-restart").await, Some(b"v1".to_vec()));

    // The restarted node must also still be able to take part in the cluster:
    // a write issued after it rejoins should replicate to it like any other
    // follower.
    let leader = nodes.iter().find(|n| n.id == leader_id).unwrap();
    leader
        .handle
        .client_write(ClientWriteRequest {
            command: Command::Put {
                key: "after-restart".into(),
                value: b"v2".to_vec(),
                client_id: 2,
                seq: 1,
            },
        })
        .await
        .expect("write should commit");
    nodes[follower_idx]
        .handle
        .wait()
        .until(Duration::from_secs(2), |m| m.last_applied >= 2)
        .await
        .unwrap_or_else(|_| panic!("restarted node {restarted_id} never applied the post-restart write"));
    assert_eq!(nodes[follower_idx].handle.local_read("after-restart").await, Some(b"v2".to_vec()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_strong_read_pays_for_a_quorum_round_a_lease_read_does_not() {
    let (network, nodes) = support::cluster_with(3, |c| {
        // `validate()` requires `lease_duration < election_timeout_min`; widen
        // both just enough that the lease outlives the gap between renewing
        // it and issuing the reads below, without stalling initial election.
        c.election_timeout_min = 2_000;
        c.election_timeout_max = 3_000;
        c.lease_duration = 1_000;
    })
    .await;
    let leader_id = support::wait_for_leader(&nodes, Duration::from_secs(8)).await;
    let leader = nodes.iter().find(|n| n.id == leader_id).unwrap();

    // A committed write's replication round is enough for the leader to
    // observe a full quorum ack and renew its read lease.
    leader
        .handle
        .client_write(ClientWriteRequest {
            command: Command::Put {
                key: "k".into(),
                value: b"v".to_vec(),
                client_id: 1,
                seq: 1,
            },
        })
        .await
        .expect("write should commit");

    // Partition away both followers: no further quorum round can complete.
    for node in nodes.iter().filter(|n| n.id != leader_id) {
        network.set_unreachable(node.id, true).await;
    }

    // `Lease` trusts the lease just renewed above and never needs the
    // now-unreachable followers.
    tokio::time::timeout(Duration::from_millis(200), leader.handle.client_read(ReadConsistency::Lease))
        .await
        .expect("lease read should not need a quorum round trip")
        .expect("lease is still valid");

    // `Strong` always runs a full ReadIndex round regardless of the lease,
    // and with both followers partitioned away that round can never reach
    // quorum.
    let strong = tokio::time::timeout(Duration::from_millis(300), leader.handle.client_read(ReadConsistency::Strong)).await;
    assert!(strong.is_err(), "strong read should block without a quorum, not take the lease fast-path");

    for node in nodes.iter().filter(|n| n.id != leader_id) {
        network.set_unreachable(node.id, false).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_truncates_the_log_and_survives_a_restart() {
    let (network, mut nodes) = support::cluster_with(1, |c| {
        c.snapshot_check_interval = 20;
        c.snapshot_policy = SnapshotPolicy::EntriesSinceLast(2);
    })
    .await;
    support::wait_for_leader(&nodes, Duration::from_secs(2)).await;

    for i in 0..10u64 {
        nodes[0]
            .handle
            .client_write(ClientWriteRequest {
                command: Command::Put {
                    key: format!("k{i}"),
                    value: i.to_be_bytes().to_vec(),
                    client_id: i,
                    seq: 1,
                },
            })
            .await
            .unwrap_or_else(|_| panic!("write {i} should commit"));
    }

    nodes[0]
        .handle
        .wait()
        .until(Duration::from_secs(2), |m| m.last_applied >= 10)
        .await
        .unwrap();
    // Give the snapshot-check tick a few rounds to actually fire compaction.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let data_dir = nodes[0].config.data_dir.clone();
    nodes[0].handle.shutdown().await.unwrap();

    let on_disk = FileLogStore::open(&data_dir).await.unwrap();
    let remaining = on_disk.read_all().await.unwrap();
    assert!(
        remaining.len() < 10,
        "compaction should have trimmed the on-disk log, found {} entries",
        remaining.len()
    );
    drop(on_disk);

    let restarted = support::restart_node(&network, nodes.remove(0)).await;

    // A fresh node reading its own log + snapshot together must reconstruct
    // every key, whether that key's entry now lives only in the snapshot or
    // still in the trimmed log tail.
    support::wait_for_leader(std::slice::from_ref(&restarted), Duration::from_secs(2)).await;
    for i in 0..10u64 {
        assert_eq!(restarted.handle.local_read(format!("k{i}")).await, Some(i.to_be_bytes().to_vec()));
    }
}
