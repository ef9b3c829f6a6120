//! Candidate-role behavior: run one election per entry into this state.

use std::time::Duration;

use crate::error::RaftResult;
use crate::log::store::DurableLogStore;
use crate::network::RaftNetwork;
use crate::raft::core::RaftCore;
use crate::raft::core::State;
use crate::raft::core::UpdateCurrentLeader;
use crate::raft::rpc::VoteRequest;

impl<S: DurableLogStore, N: RaftNetwork> RaftCore<S, N> {
    /// Run a single election. Returns once a winner is decided (this node or
    /// another), the election times out and must be retried, or a role
    /// change arrives from the network/API while voting is in flight.
    pub(crate) async fn run_candidate(&mut self) -> RaftResult<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.save_hard_state().await?;
        self.update_current_leader(UpdateCurrentLeader::Unknown);
        self.update_next_election_timeout(false);
        tracing::info!(id = self.id, term = self.current_term, "starting election");

        let req = VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_id: self.log.last_log_id(),
        };

        let deadline = self.get_next_election_timeout();
        let mut votes_granted = 1usize; // vote for self
        let quorum = self.config.quorum_size();

        if votes_granted >= quorum {
            self.become_leader();
            return Ok(());
        }

        let network = self.network.clone();
        let peers: Vec<_> = self.config.peers.iter().map(|p| p.id).collect();
        let ballots = collect_votes(network, peers, req, deadline);
        tokio::pin!(ballots);

        loop {
            if self.target_state != State::Candidate {
                return Ok(());
            }

            tokio::select! {
                ballot = &mut ballots => {
                    for (term, granted) in ballot {
                        if term > self.current_term {
                            self.update_current_term(term, None);
                            self.save_hard_state().await?;
                            self.set_target_state(State::Follower);
                            return Ok(());
                        }
                        if granted {
                            votes_granted += 1;
                        }
                    }
                    if votes_granted >= quorum {
                        self.become_leader();
                        return Ok(());
                    }
                    // Split vote or not enough peers reachable: stay a
                    // candidate and retry with a new term and a fresh
                    // randomized timeout, rather than falling back to
                    // follower and waiting out someone else's timer.
                    tracing::debug!(id = self.id, term = self.current_term, votes_granted, quorum, "election failed, retrying");
                    return Ok(());
                }
                Some(rpc) = self.rx_inbound().recv() => {
                    self.dispatch_inbound(rpc).await?;
                }
                Some(msg) = self.rx_api().recv() => {
                    self.handle_api_msg_as_non_leader(msg).await?;
                }
                _ = self.rx_shutdown() => {
                    self.set_target_state(State::Shutdown);
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(self.config.apply_interval)) => {
                    self.apply_committed_entries().await?;
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

    fn become_leader(&mut self) {
        tracing::info!(id = self.id, term = self.current_term, "won election, becoming leader");
        self.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.set_target_state(State::Leader);
    }
}

/// Send `RequestVote` to every peer concurrently and return `(term,
/// vote_granted)` for whichever responses arrive before `deadline`. A peer
/// that errors or times out simply contributes no vote.
async fn collect_votes<N: RaftNetwork>(network: std::sync::Arc<N>, peers: Vec<crate::types::NodeId>, req: VoteRequest, deadline: std::time::Instant) -> Vec<(u64, bool)> {
    let budget = deadline.saturating_duration_since(std::time::Instant::now());

    let futs = peers.into_iter().map(|peer| {
        let network = network.clone();
        let req = req.clone();
        async move { tokio::time::timeout(budget, network.send_vote(peer, req)).await }
    });

    let results = futures::future::join_all(futs).await;
    results
        .into_iter()
        .filter_map(|r| r.ok())
        .filter_map(|r| r.ok())
        .map(|resp| (resp.term, resp.vote_granted))
        .collect()
}
