//! A read-only, best-effort view into a running node's state, published over
//! a `tokio::sync::watch` channel so callers can either poll the latest
//! snapshot or await the next change.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::types::LogId;
use crate::types::NodeId;

/// The role a node currently believes it holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

/// Per-follower replication progress, populated only while this node is leader.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<NodeId, LogId>,
}

/// A point-in-time snapshot of a `RaftCore`'s state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: NodeState,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub snapshot: Option<LogId>,
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: NodeState::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            snapshot: None,
            leader_metrics: None,
        }
    }
}

/// Whether `report_metrics` should update the leader-only portion of the
/// snapshot or leave it as it was.
pub enum Update<T> {
    Update(T),
    Ignore,
}

/// A small wrapper around `watch::Receiver<RaftMetrics>` giving callers a
/// future that resolves once a predicate over the metrics becomes true,
/// instead of hand-rolling a poll loop.
#[derive(Clone)]
pub struct Wait {
    rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    pub fn new(rx: watch::Receiver<RaftMetrics>) -> Self {
        Self { rx }
    }

    /// Block until `condition` holds for a metrics snapshot, or `timeout` elapses.
    pub async fn until<F>(&mut self, timeout: std::time::Duration, condition: F) -> Result<RaftMetrics, WaitError>
    where
        F: Fn(&RaftMetrics) -> bool,
    {
        let fut = async {
            loop {
                {
                    let snap = self.rx.borrow();
                    if condition(&snap) {
                        return snap.clone();
                    }
                }
                if self.rx.changed().await.is_err() {
                    break;
                }
            }
            self.rx.borrow().clone()
        };

        tokio::time::timeout(timeout, fut).await.map_err(|_| WaitError::Timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for the expected metrics condition")]
    Timeout,
}
