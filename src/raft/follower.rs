//! Follower-role behavior: the election timer, and the RPC handlers shared
//! by every role (`RequestVote`/`AppendEntries`/`InstallSnapshot`).

use crate::error::RaftResult;
use crate::log::store::DurableLogStore;
use crate::log::ConflictOpt;
use crate::log::Entry;
use crate::network::RaftNetwork;
use crate::raft::core::RaftCore;
use crate::raft::core::State;
use crate::raft::core::UpdateCurrentLeader;
use crate::raft::rpc::AppendEntriesRequest;
use crate::raft::rpc::AppendEntriesResponse;
use crate::raft::rpc::InstallSnapshotRequest;
use crate::raft::rpc::InstallSnapshotResponse;
use crate::raft::rpc::VoteRequest;
use crate::raft::rpc::VoteResponse;
use crate::raft::RaftMsg;
use crate::snapshot::Snapshot;

impl<S: DurableLogStore, N: RaftNetwork> RaftCore<S, N> {
    /// Run as a follower until the election timer fires or a role change is
    /// requested by an RPC handler.
    pub(crate) async fn run_follower(&mut self) -> RaftResult<()> {
        self.update_next_election_timeout(false);
        loop {
            if self.target_state != State::Follower {
                return Ok(());
            }
            let election_deadline = self.get_next_election_timeout();

            tokio::select! {
                _ = tokio::time::sleep_until(election_deadline.into()) => {
                    tracing::debug!(id = self.id, "election timeout, becoming candidate");
                    self.set_target_state(State::Candidate);
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
                _ = tokio::time::sleep(std::time::Duration::from_millis(self.config.apply_interval)) => {
                    self.apply_committed_entries().await?;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(self.config.snapshot_check_interval)) => {
                    self.maybe_compact_log().await?;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(self.config.access_decay_interval)) => {
                    self.decay_access_tracker();
                }
            }
        }
    }

    /// Reject a client write/read with a leader hint; used by both
    /// follower and candidate loops, which never service client requests.
    /// RPCs arriving on the API channel (rather than the network listener's
    /// `InboundRpc` path) are answered the same way regardless of role.
    pub(crate) async fn handle_api_msg_as_non_leader(&mut self, msg: RaftMsg) -> RaftResult<()> {
        match msg {
            RaftMsg::ClientWriteRequest { tx, .. } => {
                let _ = tx.send(Err(crate::error::ClientWriteError::NotLeader(self.current_leader)));
            }
            RaftMsg::ClientReadRequest { tx, .. } => {
                let _ = tx.send(Err(crate::error::ClientReadError::NotLeader(self.current_leader)));
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

    /// RequestVote: grant iff the term is new enough, we have not already
    /// voted for someone else this term, and the candidate's log is at
    /// least as up to date as ours.
    pub(crate) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            if self.target_state.is_leader() || self.target_state == State::Candidate {
                self.set_target_state(State::Follower);
            }
        }

        let already_voted_for_other = matches!(self.voted_for, Some(v) if v != req.candidate_id);
        let candidate_log_up_to_date = req.last_log_id >= self.log.last_log_id();

        if already_voted_for_other || !candidate_log_up_to_date {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.voted_for = Some(req.candidate_id);
        self.save_hard_state().await?;
        self.update_next_election_timeout(false);

        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }

    /// AppendEntries: the leader's term/log consistency check (§5.3), also
    /// used as a heartbeat when `entries` is empty.
    pub(crate) async fn handle_append_entries_request(&mut self, req: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
                conflict_opt: None,
            });
        }

        self.update_next_election_timeout(true);

        if req.term != self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
        }
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        }
        if !matches!(self.target_state, State::Follower) {
            self.set_target_state(State::Follower);
        }

        let last_log_id = self.log.last_log_id();
        let prev_matches = req.prev_log_id.index == 0 || req.prev_log_id == last_log_id;

        if prev_matches {
            if !req.entries.is_empty() {
                self.append_log_entries(req.entries).await?;
            }
            // Only now that the entries are actually on our log can we trust
            // `leader_commit` against our own last index, per the consistency
            // check above — applying it any earlier could commit entries
            // this append never actually accepted.
            self.commit_index = self.commit_index.max(req.leader_commit.min(self.log.last_log_id().index));
            self.report_metrics();
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: true,
                match_index: self.log.last_log_id().index,
                conflict_opt: None,
            });
        }

        if last_log_id.index < req.prev_log_id.index {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
                conflict_opt: Some(ConflictOpt { log_id: last_log_id }),
            });
        }

        // `last_log_id.index >= prev_log_id.index` but the terms disagree at
        // `prev_log_id.index`: find the point of agreement and let the
        // leader jump back to it in one round trip.
        match self.log.term_at(req.prev_log_id.index) {
            Some(term) if term == req.prev_log_id.term => {
                self.log.truncate_from(req.prev_log_id.index + 1).await?;
                if !req.entries.is_empty() {
                    self.append_log_entries(req.entries).await?;
                }
                self.commit_index = self.commit_index.max(req.leader_commit.min(self.log.last_log_id().index));
                self.report_metrics();
                Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: true,
                    match_index: self.log.last_log_id().index,
                    conflict_opt: None,
                })
            }
            _ => {
                let conflict_opt = self.log.conflict_opt_for(req.prev_log_id.index).unwrap_or(ConflictOpt { log_id: last_log_id });
                Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                    conflict_opt: Some(conflict_opt),
                })
            }
        }
    }

    async fn append_log_entries(&mut self, entries: Vec<Entry>) -> RaftResult<()> {
        if let Some(first) = entries.first() {
            // Any entries we already have at or after this index came from a
            // different term's leader and must be discarded per §5.3.
            if self.log.last_log_id().index >= first.log_id.index {
                self.log.truncate_from(first.log_id.index).await?;
            }
        }
        self.log.append(entries).await
    }

    /// InstallSnapshot: replace the state machine wholesale and fast-forward
    /// the log/`last_applied` to the snapshot bound, per the single-shot
    /// simplification of this transfer.
    pub(crate) async fn handle_install_snapshot_request(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }
        if req.term != self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
        }
        self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        self.update_next_election_timeout(true);

        let snapshot = Snapshot {
            last_included: req.last_included,
            timestamp: 0,
            map: req.map,
            last_applied_seq: req.last_applied_seq,
        };
        self.snapshot_store.save(&snapshot).await?;
        self.state_machine.restore(snapshot.map.clone(), snapshot.last_applied_seq.clone());

        // Never regress `last_applied` below a snapshot bound we just
        // installed, even if our own log's tail was already ahead of it.
        self.last_applied = self.last_applied.max(req.last_included);
        self.commit_index = self.commit_index.max(req.last_included.index);
        self.snapshot_last_included = Some(req.last_included);
        self.log.compact_through(req.last_included.index).await?;
        if self.log.last_log_id().index < req.last_included.index {
            self.log.truncate_from(req.last_included.index + 1).await.ok();
        }

        self.report_metrics();
        Ok(InstallSnapshotResponse { term: self.current_term })
    }
}
