use crate::actor::{Callback, WeakActorClient};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesReq,
    ProtoAppendEntriesResult, ProtoInstallSnapshotResult, ProtoRequestVoteReq,
};
use crate::replica::cluster::{ClusterConfig, ClusterTracker, Peer, ReplicaId};
use crate::replica::election::{CurrentLeader, ElectionState, PeerStateUpdate};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerDescriptor, ClusterInfo, EnqueueForReplicationError, EnqueueForReplicationInput,
    EnqueueForReplicationOutput, InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput,
    InstallSnapshotReplyFromPeer, LeaderRedirectInfo, LeaderTimerTick, MembershipChange, MembershipChangeError,
    MembershipChangeInput, MembershipChangeOutput, PeerReplyError, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult, TermOutOfDateInfo,
};
use crate::replica::snapshot::{SnapshotMeta, SnapshotStore};
use crate::replica::state_machine::StateMachine;
use crate::replica::write_ahead_log::{EntryKind, Index, WalError, WriteAheadLog, WriteAheadLogEntry};
use crate::replica::ElectionStateSnapshot;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::{cmp, fs, io, mem};
use tokio::time::error::Elapsed;
use tokio::time::{Duration, Instant};
use tonic::Status;

const SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;
const SNAPSHOT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct ReplicaConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) election_state: ElectionState,
    pub(crate) write_ahead_log: WriteAheadLog,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) snapshot_store: SnapshotStore,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) max_entries_per_append: usize,
    pub(crate) snapshot_threshold: u64,
}

pub(crate) struct Replica {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    wal: WriteAheadLog,
    state_machine: Box<dyn StateMachine>,
    snapshot_store: SnapshotStore,
    actor_client: WeakActorClient,
    follower_min_timeout: Duration,
    append_entries_timeout: Duration,
    max_entries_per_append: usize,
    snapshot_threshold: u64,

    // Leader only. Completed as entries are applied, failed on losing leadership.
    pending_appends: BTreeMap<Index, Callback<EnqueueForReplicationOutput, EnqueueForReplicationError>>,
    pending_membership_change: Option<(Index, Callback<MembershipChangeOutput, MembershipChangeError>)>,
    queued_membership_changes: VecDeque<(MembershipChange, Callback<MembershipChangeOutput, MembershipChangeError>)>,

    last_leader_contact: Option<Instant>,
}

impl Replica {
    pub(crate) fn new(config: ReplicaConfig) -> Self {
        let my_replica_id = config.cluster_tracker.my_replica_id().clone();
        Replica {
            logger: config.logger,
            my_replica_id,
            cluster_tracker: config.cluster_tracker,
            local_state: config.local_state,
            election_state: config.election_state,
            wal: config.write_ahead_log,
            state_machine: config.state_machine,
            snapshot_store: config.snapshot_store,
            actor_client: config.actor_client,
            follower_min_timeout: config.follower_min_timeout,
            append_entries_timeout: config.append_entries_timeout,
            max_entries_per_append: config.max_entries_per_append,
            snapshot_threshold: config.snapshot_threshold,
            pending_appends: BTreeMap::new(),
            pending_membership_change: None,
            queued_membership_changes: VecDeque::new(),
            last_leader_contact: None,
        }
    }

    pub(crate) fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
        callback: Callback<EnqueueForReplicationOutput, EnqueueForReplicationError>,
    ) {
        if let Err(e) = self.check_leader() {
            callback.send(Err(e.into()));
            return;
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let entry = WriteAheadLogEntry {
            term: self.local_state.current_term(),
            kind: EntryKind::Command,
            data: input.data,
        };
        match self.append_local(entry) {
            Ok(index) => {
                self.pending_appends.insert(index, callback);
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to append to local log: {}", e);
                callback.send(Err(EnqueueForReplicationError::LocalIoError(e.to_string())));
                return;
            }
        }

        self.replicate_after_append();
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > if a server receives a RequestVote request within the minimum election timeout of
        // > hearing from a current leader, it does not update its term or grant its vote
        if self.heard_from_leader_recently() {
            slog::info!(
                self.logger,
                "Not granting vote to {}. We have a live leader. Election state: {:?}",
                input.candidate_id,
                self.election_state
            );
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(input.candidate_term)
            .map_err(|e| RequestVoteError::ServerIoError(e.to_string()))?;
        if increased {
            self.step_down(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Transitioning to follower. Election state: {:?}",
                self.election_state
            );
            // If we've increased the term, it means we haven't voted for anyone this term, and we will vote for the client.
            opt_voted_for = None;
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {}.", voted_for);
                return Ok(RequestVoteOutput { vote_granted: false });
            }
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // ...grant vote
        slog::info!(self.logger, "Voting for {}.", input.candidate_id);
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(|e| RequestVoteError::ServerIoError(e.to_string()))?;

        if cas_success {
            // > If election timeout elapses without receiving AppendEntries RPC from current
            // > leader or granting vote to candidate: convert to candidate
            self.election_state.reset_timeout_if_follower();
            return Ok(RequestVoteOutput { vote_granted: true });
        }

        // Already voted this term. The candidate is retrying if it's the one we voted for.
        if let (reread_current_term, Some(reread_voted_for)) = self.local_state.voted_for_current_term() {
            if reread_current_term == input.candidate_term && reread_voted_for.as_ref() == &input.candidate_id {
                return Ok(RequestVoteOutput { vote_granted: true });
            }
        }

        slog::info!(self.logger, "Not granting vote because idk why.");
        Ok(RequestVoteOutput { vote_granted: false })
    }

    fn heard_from_leader_recently(&self) -> bool {
        match self.election_state.current_leader() {
            CurrentLeader::Me => true,
            CurrentLeader::Other(_) => self
                .last_leader_contact
                .map(|contact| contact.elapsed() < self.follower_min_timeout)
                .unwrap_or(false),
            CurrentLeader::Unknown => false,
        }
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.wal.latest_entry(), candidate_last_entry) {
            (None, None) => true,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (
                Some((my_last_entry_term, my_last_entry_index)),
                Some((candidate_last_entry_term, candidate_last_entry_index)),
            ) => {
                if candidate_last_entry_term > my_last_entry_term {
                    return true;
                } else if candidate_last_entry_term < my_last_entry_term {
                    return false;
                }

                candidate_last_entry_index >= my_last_entry_index
            }
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let votes = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v.clone(),
                    None => {
                        slog::info!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to a election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    votes.len(),
                    self.cluster_tracker.num_voting_replicas(),
                    reply.term,
                );

                if self.has_quorum(&votes) {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::RetryableFailure | RequestVoteResult::MalformedReply => {
                // The next election timeout starts a fresh round.
                slog::warn!(
                    self.logger,
                    "No usable vote reply from {} for term {:?}: {:?}",
                    reply.peer_id,
                    reply.term,
                    reply.result,
                );
            }
        }
    }

    /// Only votes from members of the latest configuration count.
    fn has_quorum(&self, votes: &HashSet<ReplicaId>) -> bool {
        let config = self.cluster_tracker.latest_config();
        let num_votes = votes.iter().filter(|id| config.contains(id)).count();
        num_votes >= Self::get_majority_vote_count(config.len())
    }

    fn get_majority_vote_count(num_voting_replicas: usize) -> usize {
        (num_voting_replicas / 2) + 1
    }

    fn become_leader(&mut self, term: Term) {
        let latest_index = self.wal.latest_entry().map(|(_, index)| index);
        self.election_state
            .transition_to_leader(term, self.cluster_tracker.peer_ids(), latest_index);
        slog::info!(self.logger, "Won election for term {:?}. Election state: {:?}", term, self.election_state);

        // > [a leader] commit[s] a blank no-op entry into the log at the start of its term.
        let noop = WriteAheadLogEntry {
            term,
            kind: EntryKind::Noop,
            data: Bytes::new(),
        };
        if let Err(e) = self.append_local(noop) {
            slog::error!(self.logger, "Failed to append no-op as new leader: {}. Stepping down.", e);
            self.step_down(None);
            return;
        }

        self.replicate_after_append();
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        self.follow_leader(input.leader_term, &input.leader_id)
            .map_err(|e| AppendEntriesError::ServerIoError(e.to_string()))?;

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            let matches = self
                .has_matching_entry(leader_prev_entry_term, leader_prev_entry_index)
                .map_err(|e| AppendEntriesError::ServerIoError(e.to_string()))?;
            if !matches {
                // Hint for the leader: nothing at or after prevLogIndex can be trusted.
                let last_log_index = cmp::min(
                    self.wal.latest_entry().map(|(_, index)| index),
                    leader_prev_entry_index.checked_minus(1),
                );
                return Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index });
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        for new_entry in input.new_entries {
            let index = next_entry_index;
            next_entry_index = next_entry_index.plus(1);

            if self.is_covered_by_snapshot(index) {
                continue;
            }

            let existing_term = self
                .wal
                .term_at(index)
                .map_err(|e| AppendEntriesError::ServerIoError(e.to_string()))?;
            match existing_term {
                // 4. (no-op)
                Some(term) if term == new_entry.term => continue,
                // 3. (delete)
                Some(_) => {
                    slog::info!(self.logger, "Truncating conflicting log suffix starting at {:?}", index);
                    self.wal
                        .truncate(index)
                        .map_err(|e| AppendEntriesError::ServerIoError(e.to_string()))?;
                    self.cluster_tracker.truncate_from(index);
                }
                None => {}
            }

            // 4. (append)
            let entry = WriteAheadLogEntry::from_wire(new_entry.term, new_entry.data)
                .map_err(|e| AppendEntriesError::ServerIoError(e.to_string()))?;
            let appended_index = self
                .append_local(entry)
                .map_err(|e| AppendEntriesError::ServerIoError(e.to_string()))?;
            if appended_index != index {
                return Err(AppendEntriesError::ServerIoError(format!(
                    "Appended log entry to unexpected index {:?}, expected {:?}",
                    appended_index, index
                )));
            }
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, next_entry_index.checked_minus(1))
        {
            self.wal
                .ratchet_fwd_commit_index(cmp::min(leader_commit_index, index_of_last_new_entry));
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_committed_entries();

        Ok(AppendEntriesOutput {})
    }

    /// Common handling of any legitimate leader RPC: adopt its term and reset our election timer.
    fn follow_leader(&mut self, leader_term: Term, leader_id: &ReplicaId) -> io::Result<()> {
        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self.local_state.store_term_if_increased(leader_term)?;

        let leader = LeaderRedirectInfo {
            replica_id: leader_id.clone(),
            addr: self.cluster_tracker.addr_of(leader_id).unwrap_or_default(),
        };
        match self.election_state.current_state() {
            ElectionStateSnapshot::Follower(current) if !increased && current == leader => {}
            ElectionStateSnapshot::FollowerNoLeader if !increased => self.election_state.set_leader_if_unknown(&leader),
            // > If AppendEntries RPC received from new leader: convert to follower
            _ => self.step_down(Some(leader)),
        }

        self.election_state.reset_timeout_if_follower();
        self.last_leader_contact = Some(Instant::now());
        Ok(())
    }

    fn is_covered_by_snapshot(&self, index: Index) -> bool {
        self.wal
            .snapshot_boundary()
            .map(|(_, boundary)| index <= boundary)
            .unwrap_or(false)
    }

    fn has_matching_entry(&self, term: Term, index: Index) -> Result<bool, WalError> {
        // Everything in our snapshot is committed, and committed entries match the leader's.
        if self.is_covered_by_snapshot(index) {
            return Ok(true);
        }

        Ok(self.wal.term_at(index)? == Some(term))
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "Peer" => reply.descriptor.peer_id.to_string(),
            "SeqNo" => reply.descriptor.seq_no
        ));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let current_term = self.local_state.current_term();
        if current_term != reply.descriptor.term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                current_term
            );
            return;
        }

        let peer_state_update = match reply.result {
            Ok(()) => PeerStateUpdate::Success {
                previous_log_entry: reply.descriptor.previous_log_entry_index,
                num_entries_replicated: reply.descriptor.num_log_entries,
            },
            Err(PeerReplyError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                if self.observe_peer_term(new_term) {
                    return;
                }
                PeerStateUpdate::OtherError
            }
            Err(PeerReplyError::PeerMissingPreviousLogEntry { last_log_index }) => {
                slog::info!(logger, "Peer is missing previous log entry. Peer's last entry: {:?}", last_log_index);
                PeerStateUpdate::PeerLogBehind { last_log_index }
            }
            Err(PeerReplyError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "AE failure: {}", err_msg);
                PeerStateUpdate::OtherError
            }
        };

        self.handle_peer_state_update(&logger, &reply.descriptor.peer_id, reply.descriptor.seq_no, peer_state_update);
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => reply.peer_id.to_string(), "SeqNo" => reply.seq_no));

        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(logger, "Received snapshot reply for outdated term {:?}", reply.term);
            return;
        }

        let peer_state_update = match reply.result {
            Ok(()) => {
                slog::info!(logger, "Peer installed snapshot through {:?}", reply.last_included_index);
                PeerStateUpdate::SnapshotInstalled {
                    last_included_index: reply.last_included_index,
                }
            }
            Err(PeerReplyError::StaleTerm { new_term }) => {
                if self.observe_peer_term(new_term) {
                    return;
                }
                PeerStateUpdate::OtherError
            }
            Err(e) => {
                slog::warn!(logger, "Snapshot transfer failed: {:?}", e);
                PeerStateUpdate::OtherError
            }
        };

        self.handle_peer_state_update(&logger, &reply.peer_id, reply.seq_no, peer_state_update);
    }

    /// Returns true if the peer's term was newer and we stepped down.
    fn observe_peer_term(&mut self, peer_term: Term) -> bool {
        match self.local_state.store_term_if_increased(peer_term) {
            Ok(true) => {
                self.step_down(None);
                slog::info!(self.logger, "Observed newer term {:?} from peer. Transitioned to follower.", peer_term);
                true
            }
            Ok(false) => {
                slog::warn!(self.logger, "This should not happen (unless peer has bug). Treating non-incrementing StaleTerm err as generic failure.");
                false
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to persist newer term {:?}: {}", peer_term, e);
                false
            }
        }
    }

    fn handle_peer_state_update(
        &mut self,
        logger: &slog::Logger,
        peer_id: &ReplicaId,
        seq_no: u64,
        update: PeerStateUpdate,
    ) {
        let retry_now = !matches!(update, PeerStateUpdate::OtherError);

        // 1. Update peer log tracker
        let next_index = match self.election_state.leader_state_mut() {
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
            Some(leader_state) => match leader_state.peer_state_mut(peer_id) {
                None => {
                    slog::info!(logger, "Peer is no longer in the configuration. Dropping reply.");
                    return;
                }
                Some(peer_state) => {
                    peer_state.handle_reply(logger, seq_no, update);
                    peer_state.next_and_previous_log_index().0
                }
            },
        };

        // 2. Check for majority replication and apply new commits.
        self.advance_commit_index();

        // 3. Keep going while the peer is behind.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        let peer_is_behind = self
            .wal
            .latest_entry()
            .map(|(_, last_log_index)| last_log_index >= next_index)
            .unwrap_or(false);
        if retry_now && peer_is_behind {
            let current_term = self.local_state.current_term();
            self.replicate_to_peer(peer_id, current_term);
        }
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    /// See also:
    /// > Figure 8: A time sequence showing why a leader cannot determine
    /// > commitment using log entries from older terms.
    fn advance_commit_index(&mut self) {
        let leader_state = match self.election_state.leader_state() {
            Some(leader_state) => leader_state,
            None => return,
        };

        let my_latest_index = self.wal.latest_entry().map(|(_, index)| index);
        let voters_matched_indexes: Vec<Option<Index>> = self
            .cluster_tracker
            .latest_config()
            .voters()
            .map(|(id, _)| {
                if id == &self.my_replica_id {
                    my_latest_index
                } else {
                    leader_state.peer_state(id).and_then(|peer_state| peer_state.matched())
                }
            })
            .collect();

        let tentative_new_commit_index = match Self::get_cluster_commit_index(voters_matched_indexes) {
            Some(index) => index,
            None => return,
        };

        let current_term = self.local_state.current_term();
        match self
            .wal
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, current_term)
        {
            Ok(true) => self.apply_committed_entries(),
            Ok(false) => {}
            Err(e) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {}",
                tentative_new_commit_index,
                e
            ),
        }
    }

    /// Highest index a majority of voters have. The leader's own entry is its latest index,
    /// because our log is the same or longest.
    fn get_cluster_commit_index(mut voters_matched_indexes: Vec<Option<Index>>) -> Option<Index> {
        if voters_matched_indexes.is_empty() {
            return None;
        }
        voters_matched_indexes.sort();

        // Everything at or right of `quorum_idx` is a majority. When in doubt, read the unit tests.
        let quorum_idx = (voters_matched_indexes.len() - 1) / 2;

        voters_matched_indexes.remove(quorum_idx)
    }

    fn apply_committed_entries(&mut self) {
        let mut config_committed = false;

        while let Some(index) = self.wal.next_to_apply() {
            let entry = match self.wal.read(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    slog::error!(self.logger, "Committed entry {:?} is missing from the log", index);
                    return;
                }
                Err(e) => {
                    slog::error!(self.logger, "Failed to read committed entry {:?}: {}", index, e);
                    return;
                }
            };

            match entry.kind {
                EntryKind::Command => self.apply_command(index, entry.data),
                EntryKind::Configuration => {
                    self.cluster_tracker.commit_through(index);
                    config_committed = true;
                    if let Some((pending_index, callback)) = self.pending_membership_change.take() {
                        if pending_index <= index {
                            callback.send(Ok(MembershipChangeOutput {}));
                        } else {
                            self.pending_membership_change = Some((pending_index, callback));
                        }
                    }
                }
                EntryKind::Noop => {}
            }

            self.wal.mark_applied(index);
        }

        if config_committed && self.election_state.is_leader() {
            if self.cluster_tracker.am_voter() {
                self.start_queued_membership_changes();
            } else {
                slog::info!(self.logger, "Committed a configuration without me. Stepping down.");
                self.step_down(None);
            }
        }

        self.maybe_snapshot();
    }

    fn apply_command(&mut self, index: Index, data: Bytes) {
        let result = self.state_machine.apply(data);
        match self.pending_appends.remove(&index) {
            Some(callback) => callback.send(
                result
                    .map(|response| EnqueueForReplicationOutput { index, response })
                    .map_err(|e| EnqueueForReplicationError::StateMachine(e.to_string())),
            ),
            None => {
                if let Err(e) = result {
                    slog::warn!(self.logger, "State machine rejected entry {:?}: {}", index, e);
                }
            }
        }
    }

    fn maybe_snapshot(&mut self) {
        if self.wal.applied_since_snapshot() < self.snapshot_threshold {
            return;
        }

        if let Err(e) = self.take_snapshot() {
            slog::error!(self.logger, "Failed to take snapshot: {}", e);
        }
    }

    fn take_snapshot(&mut self) -> Result<(), SnapshotError> {
        let last_included_index = match self.wal.last_applied_index() {
            Some(index) => index,
            None => return Ok(()),
        };
        let last_included_term = self
            .wal
            .term_at(last_included_index)?
            .ok_or(WalError::MissingEntry(last_included_index))?;

        let meta = SnapshotMeta {
            last_included_index,
            last_included_term,
            config: self.cluster_tracker.committed_config().clone(),
        };
        let mut data = self
            .state_machine
            .snapshot()
            .map_err(|e| SnapshotError::StateMachine(e.to_string()))?;
        self.snapshot_store.create(&meta, &mut data)?;

        self.wal.set_snapshot_boundary(last_included_term, last_included_index);
        self.wal.compact_through(last_included_index)?;
        slog::info!(self.logger, "Took snapshot through {:?}", last_included_index);

        Ok(())
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            discard_file(&self.logger, &input.data_path);
            return Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        if let Err(e) = self.follow_leader(input.leader_term, &input.leader_id) {
            discard_file(&self.logger, &input.data_path);
            return Err(InstallSnapshotError::ServerIoError(e.to_string()));
        }

        let already_applied = self
            .wal
            .last_applied_index()
            .map(|applied| input.meta.last_included_index <= applied)
            .unwrap_or(false);
        if already_applied {
            slog::info!(
                self.logger,
                "Ignoring snapshot through {:?}. Already applied that far.",
                input.meta.last_included_index
            );
            discard_file(&self.logger, &input.data_path);
            return Ok(InstallSnapshotOutput {});
        }

        let last_included_index = input.meta.last_included_index;
        self.install_snapshot(input.meta, &input.data_path).map_err(|e| {
            slog::error!(self.logger, "Failed to install snapshot: {}", e);
            InstallSnapshotError::ServerIoError(e.to_string())
        })?;
        slog::info!(self.logger, "Installed snapshot from leader through {:?}", last_included_index);

        Ok(InstallSnapshotOutput {})
    }

    /// Replaces state machine, log and configuration with the snapshot's. Our whole log is
    /// discarded even if a suffix of it would still match.
    fn install_snapshot(&mut self, meta: SnapshotMeta, data_path: &Path) -> Result<(), SnapshotError> {
        self.snapshot_store.install(&meta, data_path)?;

        let data = self.snapshot_store.open_data(&meta)?;
        self.state_machine
            .restore(Box::new(data))
            .map_err(|e| SnapshotError::StateMachine(e.to_string()))?;

        self.wal
            .reset_to_snapshot(meta.last_included_term, meta.last_included_index)?;
        self.cluster_tracker.reset(Some(meta.last_included_index), meta.config);

        Ok(())
    }

    pub(crate) fn handle_change_membership(
        &mut self,
        input: MembershipChangeInput,
        callback: Callback<MembershipChangeOutput, MembershipChangeError>,
    ) {
        if let Err(e) = self.check_leader() {
            callback.send(Err(e.into()));
            return;
        }

        self.queued_membership_changes.push_back((input.change, callback));
        self.start_queued_membership_changes();
    }

    // > The leader ... only allow[s] one configuration change at a time
    fn start_queued_membership_changes(&mut self) {
        while self.pending_membership_change.is_none() && !self.cluster_tracker.has_uncommitted_config() {
            let (change, callback) = match self.queued_membership_changes.pop_front() {
                Some(queued) => queued,
                None => return,
            };
            self.start_membership_change(change, callback);
        }
    }

    fn start_membership_change(
        &mut self,
        change: MembershipChange,
        callback: Callback<MembershipChangeOutput, MembershipChangeError>,
    ) {
        let current = self.cluster_tracker.latest_config();
        let new_config = match &change {
            MembershipChange::AddVoter { replica_id, addr } => {
                if current.addr(replica_id) == Some(addr.as_str()) {
                    callback.send(Ok(MembershipChangeOutput {}));
                    return;
                }
                current.with_voter(replica_id.clone(), addr.clone())
            }
            MembershipChange::RemoveVoter { replica_id } => {
                if !current.contains(replica_id) {
                    callback.send(Ok(MembershipChangeOutput {}));
                    return;
                }
                current.without_voter(replica_id)
            }
        };
        if new_config.len() == 0 {
            callback.send(Err(MembershipChangeError::LastVoter));
            return;
        }

        let entry = WriteAheadLogEntry {
            term: self.local_state.current_term(),
            kind: EntryKind::Configuration,
            data: new_config.encode(),
        };
        match self.append_local(entry) {
            Ok(index) => {
                slog::info!(self.logger, "Appended configuration change {:?} at {:?}", change, index);
                self.pending_membership_change = Some((index, callback));
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to append configuration change: {}", e);
                callback.send(Err(MembershipChangeError::LocalIoError(e.to_string())));
                return;
            }
        }

        self.replicate_after_append();
    }

    pub(crate) fn cluster_info(&self) -> ClusterInfo {
        let leader_id = match self.election_state.current_leader() {
            CurrentLeader::Me => Some(self.my_replica_id.clone()),
            CurrentLeader::Other(leader) => Some(leader.replica_id),
            CurrentLeader::Unknown => None,
        };

        ClusterInfo {
            leader_id,
            voters: self
                .cluster_tracker
                .latest_config()
                .voters()
                .map(|(id, addr)| (id.clone(), addr.clone()))
                .collect(),
        }
    }

    /// Every append goes through here so configuration entries take effect as soon as they're in
    /// the log.
    fn append_local(&mut self, entry: WriteAheadLogEntry) -> Result<Index, WalError> {
        let config = match entry.kind {
            EntryKind::Configuration => Some(ClusterConfig::decode(&entry.data)?),
            _ => None,
        };

        let index = self.wal.append(entry)?;

        if let Some(config) = config {
            self.cluster_tracker.set_latest(index, config);
            let current_term = self.local_state.current_term();
            self.election_state
                .sync_leader_peers(current_term, &self.cluster_tracker.peer_ids(), Some(index));
        }

        Ok(index)
    }

    fn replicate_after_append(&mut self) {
        // A lone voter commits on its own.
        self.advance_commit_index();

        let peer_ids = match self.election_state.leader_state() {
            Some(leader_state) => leader_state.peer_ids(),
            None => return,
        };
        let current_term = self.local_state.current_term();
        for peer_id in peer_ids {
            self.replicate_to_peer(&peer_id, current_term);
        }
    }

    fn check_leader(&self) -> Result<(), NotLeader> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => Ok(()),
            CurrentLeader::Other(leader) => Err(NotLeader::Redirect(leader)),
            CurrentLeader::Unknown => Err(NotLeader::NoLeader),
        }
    }

    fn step_down(&mut self, new_leader: Option<LeaderRedirectInfo>) {
        self.election_state.transition_to_follower(new_leader);

        for (_, callback) in mem::take(&mut self.pending_appends) {
            callback.send(Err(EnqueueForReplicationError::LeadershipLost));
        }
        if let Some((_, callback)) = self.pending_membership_change.take() {
            callback.send(Err(MembershipChangeError::LeadershipLost));
        }
        for (_, callback) in self.queued_membership_changes.drain(..) {
            callback.send(Err(MembershipChangeError::LeadershipLost));
        }
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        self.replicate_to_peer(&tick.peer_id, current_term);
    }

    fn replicate_to_peer(&mut self, peer_id: &ReplicaId, current_term: Term) {
        match self.try_replicate_to_peer(peer_id, current_term) {
            Ok(()) => {}
            Err(ReplicateError::NoLongerLeader) => {
                slog::debug!(self.logger, "Received leader timer event but no longer leader.")
            }
            Err(ReplicateError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Request to peer {} still outstanding", peer_id)
            }
            Err(ReplicateError::UnknownPeer) => {
                slog::debug!(self.logger, "Peer {} is not in the latest configuration", peer_id)
            }
            Err(e) => slog::error!(self.logger, "Failed to replicate to peer {}: {}", peer_id, e),
        }
    }

    fn try_replicate_to_peer(&mut self, peer_id: &ReplicaId, current_term: Term) -> Result<(), ReplicateError> {
        let peer = self
            .cluster_tracker
            .peer(peer_id)
            .cloned()
            .ok_or(ReplicateError::UnknownPeer)?;
        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(ReplicateError::NoLongerLeader)?;
        let peer_state = leader_state
            .peer_state_mut(peer_id)
            .ok_or(ReplicateError::UnknownPeer)?;

        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. We still batch log entries.
        if peer_state.has_outstanding_request() {
            return Err(ReplicateError::PeerConcurrencyThrottle);
        }

        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        let outbound = leader_timer_handler::next_outbound(
            &self.wal,
            &self.snapshot_store,
            next_index,
            opt_previous_index,
            self.max_entries_per_append,
        )?;

        let seq_no = peer_state.next_seq_no();
        peer_state.reset_heartbeat_timer();

        let logger = self
            .logger
            .new(slog::o!("Peer" => peer_id.to_string(), "SeqNo" => seq_no));
        match outbound {
            leader_timer_handler::Outbound::AppendEntries {
                previous_log_entry,
                entries,
            } => {
                let descriptor = AppendEntriesReplyFromPeerDescriptor {
                    peer_id: peer_id.clone(),
                    term: current_term,
                    seq_no,
                    previous_log_entry_index: opt_previous_index,
                    num_log_entries: entries.len(),
                };
                let proto_request = leader_timer_handler::build_append_entries_request(
                    current_term,
                    self.my_replica_id.clone(),
                    previous_log_entry,
                    self.wal.commit_index(),
                    entries,
                );

                tokio::task::spawn(Self::call_peer_append_entries(
                    logger,
                    peer,
                    proto_request,
                    self.append_entries_timeout,
                    self.actor_client.clone(),
                    descriptor,
                ));
            }
            leader_timer_handler::Outbound::Snapshot(meta) => {
                slog::info!(logger, "Peer needs entries we've compacted. Sending snapshot through {:?}", meta.last_included_index);
                let data_path = self.snapshot_store.data_path(meta.last_included_index);
                let reply_descriptor = InstallSnapshotReplyFromPeer {
                    peer_id: peer_id.clone(),
                    term: current_term,
                    seq_no,
                    last_included_index: meta.last_included_index,
                    result: Ok(()),
                };
                let chunk_header = leader_timer_handler::SnapshotHeader {
                    my_id: self.my_replica_id.clone(),
                    term: current_term,
                    meta,
                };

                tokio::task::spawn(Self::call_peer_install_snapshot(
                    logger,
                    peer,
                    chunk_header,
                    data_path,
                    self.append_entries_timeout,
                    self.actor_client.clone(),
                    reply_descriptor,
                ));
            }
        }

        Ok(())
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        peer: Peer,
        rpc_request: ProtoAppendEntriesReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let result = match peer.client(rpc_timeout).await {
            Ok(mut peer_client) => {
                let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.append_entries(rpc_request)).await;
                slog::debug!(logger, "ClientWire - {:?}", rpc_reply);
                Self::convert_append_entries_rpc_reply(rpc_reply)
            }
            Err(e) => Err(PeerReplyError::RetryableFailure(format!("Failed to connect to peer: {}", e))),
        };

        let callback_input = AppendEntriesReplyFromPeer { descriptor, result };
        callback.notify_append_entries_reply_from_peer(callback_input).await;
    }

    fn convert_append_entries_rpc_reply(
        rpc_reply: Result<Result<ProtoAppendEntriesResult, Status>, Elapsed>,
    ) -> Result<(), PeerReplyError> {
        match rpc_reply {
            Ok(Ok(rpc_result)) => match rpc_result.result {
                Some(proto_append_entries_result::Result::Ok(_)) => Ok(()),
                Some(proto_append_entries_result::Result::Err(err)) => match err.err {
                    Some(proto_append_entries_error::Err::ServerFault(payload)) => Err(
                        PeerReplyError::RetryableFailure(format!("Explicit server fault: {:?}", payload.message)),
                    ),
                    Some(proto_append_entries_error::Err::StaleTerm(payload)) => Err(PeerReplyError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    }),
                    Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                        Err(PeerReplyError::PeerMissingPreviousLogEntry {
                            last_log_index: Index::new(payload.last_log_entry_index),
                        })
                    }
                    None => Err(PeerReplyError::RetryableFailure("Malformed AppendEntries Err".into())),
                },
                None => Err(PeerReplyError::RetryableFailure("Malformed AppendEntries Result".into())),
            },
            Ok(Err(rpc_status)) => Err(PeerReplyError::RetryableFailure(format!(
                "Un-modeled failure from AppendEntries RPC call: {:?}",
                rpc_status
            ))),
            Err(_timeout) => Err(PeerReplyError::RetryableFailure("Timed out calling AppendEntries".into())),
        }
    }

    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        peer: Peer,
        header: leader_timer_handler::SnapshotHeader,
        data_path: PathBuf,
        connect_timeout: Duration,
        callback: WeakActorClient,
        mut reply: InstallSnapshotReplyFromPeer,
    ) {
        let transfer = Self::send_snapshot(peer, header, data_path, connect_timeout);
        reply.result = match tokio::time::timeout(SNAPSHOT_TRANSFER_TIMEOUT, transfer).await {
            Ok(result) => result,
            Err(_timeout) => Err(PeerReplyError::RetryableFailure("Timed out sending snapshot".into())),
        };
        slog::debug!(logger, "Snapshot transfer result: {:?}", reply.result);

        callback.notify_install_snapshot_reply_from_peer(reply).await;
    }

    async fn send_snapshot(
        peer: Peer,
        header: leader_timer_handler::SnapshotHeader,
        data_path: PathBuf,
        connect_timeout: Duration,
    ) -> Result<(), PeerReplyError> {
        let data = tokio::task::spawn_blocking(move || fs::read(data_path))
            .await
            .map_err(|e| PeerReplyError::RetryableFailure(format!("Snapshot reader panicked: {}", e)))?
            .map_err(|e| PeerReplyError::RetryableFailure(format!("Failed to read snapshot: {}", e)))?;
        let chunks = leader_timer_handler::snapshot_chunks(header, data, SNAPSHOT_CHUNK_SIZE);

        let mut peer_client = peer
            .client(connect_timeout)
            .await
            .map_err(|e| PeerReplyError::RetryableFailure(format!("Failed to connect to peer: {}", e)))?;
        let rpc_reply = peer_client.install_snapshot(futures::stream::iter(chunks)).await;

        Self::convert_install_snapshot_rpc_reply(rpc_reply)
    }

    fn convert_install_snapshot_rpc_reply(
        rpc_reply: Result<ProtoInstallSnapshotResult, Status>,
    ) -> Result<(), PeerReplyError> {
        match rpc_reply {
            Ok(rpc_result) => match rpc_result.result {
                Some(proto_install_snapshot_result::Result::Ok(_)) => Ok(()),
                Some(proto_install_snapshot_result::Result::Err(err)) => match err.err {
                    Some(proto_install_snapshot_error::Err::ServerFault(payload)) => Err(
                        PeerReplyError::RetryableFailure(format!("Explicit server fault: {:?}", payload.message)),
                    ),
                    Some(proto_install_snapshot_error::Err::StaleTerm(payload)) => Err(PeerReplyError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    }),
                    None => Err(PeerReplyError::RetryableFailure("Malformed InstallSnapshot Err".into())),
                },
                None => Err(PeerReplyError::RetryableFailure("Malformed InstallSnapshot Result".into())),
            },
            Err(rpc_status) => Err(PeerReplyError::RetryableFailure(format!(
                "Un-modeled failure from InstallSnapshot RPC call: {:?}",
                rpc_status
            ))),
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self) {
        // The timer may have been reset after this event was queued.
        if !self.election_state.is_election_timeout_due() {
            slog::debug!(self.logger, "Ignoring stale election timeout.");
            return;
        }

        if !self.cluster_tracker.am_voter() {
            slog::debug!(self.logger, "Not a voter in the latest configuration. Not starting an election.");
            return;
        }

        self.start_election();
    }

    pub(crate) fn start_election(&mut self) {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist vote for self: {}", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate. Election state: {:?}",
            self.election_state,
        );

        let mut my_vote = HashSet::with_capacity(1);
        my_vote.insert(self.my_replica_id.clone());
        if self.has_quorum(&my_vote) {
            self.become_leader(new_term);
            return;
        }

        let rpc_request = self.new_request_vote_request(new_term);
        for peer in self.cluster_tracker.iter_peers() {
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.new(slog::o!("Peer" => peer.replica_id.to_string())),
                peer.clone(),
                rpc_request.clone(),
                self.append_entries_timeout,
                self.actor_client.clone(),
                new_term,
            ));
        }
    }

    fn new_request_vote_request(&self, term: Term) -> ProtoRequestVoteReq {
        let (last_log_entry_term, last_log_entry_index) = match self.wal.latest_entry() {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index.as_u64()),
        };

        ProtoRequestVoteReq {
            client_node_id: self.my_replica_id.as_str().to_string(),
            term: term.as_u64(),
            last_log_entry_index,
            last_log_entry_term,
        }
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        peer: Peer,
        rpc_request: ProtoRequestVoteReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        term: Term,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = match peer.client(rpc_timeout).await {
            Ok(mut peer_client) => tokio::time::timeout(rpc_timeout, peer_client.request_vote(rpc_request)).await,
            Err(e) => {
                slog::warn!(logger, "Failed to connect to peer for RequestVote: {}", e);
                callback
                    .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
                        peer_id: peer.replica_id,
                        term,
                        result: RequestVoteResult::RetryableFailure,
                    })
                    .await;
                return;
            }
        };
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let callback_result = match rpc_reply {
            Ok(Ok(rpc_result)) => match rpc_result.result {
                Some(proto_request_vote_result::Result::Ok(success_reply)) => {
                    if success_reply.vote_granted {
                        RequestVoteResult::VoteGranted
                    } else {
                        RequestVoteResult::VoteNotGranted
                    }
                }
                Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                    Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                        slog::warn!(logger, "RequestVote Service Fault: {:?}", fault.message);
                        RequestVoteResult::RetryableFailure
                    }
                    None => RequestVoteResult::MalformedReply,
                },
                None => RequestVoteResult::MalformedReply,
            },
            Ok(Err(rpc_status)) => {
                slog::warn!(logger, "Un-modeled failure from RequestVote RPC call: {:?}", rpc_status);
                RequestVoteResult::RetryableFailure
            }
            Err(_timeout) => RequestVoteResult::RetryableFailure,
        };

        let callback_input = RequestVoteReplyFromPeer {
            peer_id: peer.replica_id,
            term,
            result: callback_result,
        };

        callback.notify_request_vote_reply_from_peer(callback_input).await;
    }

    pub(crate) fn shutdown(&mut self) {
        // Dropped callbacks surface as ActorExited.
        self.pending_appends.clear();
        self.pending_membership_change = None;
        self.queued_membership_changes.clear();

        if let Err(e) = self.wal.close() {
            slog::error!(self.logger, "Failed to close write-ahead log: {}", e);
        }
    }
}

fn discard_file(logger: &slog::Logger, path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        slog::warn!(logger, "Failed to remove {:?}: {}", path, e);
    }
}

enum NotLeader {
    Redirect(LeaderRedirectInfo),
    NoLeader,
}

impl From<NotLeader> for EnqueueForReplicationError {
    fn from(e: NotLeader) -> Self {
        match e {
            NotLeader::Redirect(leader) => EnqueueForReplicationError::LeaderRedirect(leader),
            NotLeader::NoLeader => EnqueueForReplicationError::NoLeader,
        }
    }
}

impl From<NotLeader> for MembershipChangeError {
    fn from(e: NotLeader) -> Self {
        match e {
            NotLeader::Redirect(leader) => MembershipChangeError::LeaderRedirect(leader),
            NotLeader::NoLeader => MembershipChangeError::NoLeader,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ReplicateError {
    #[error("no longer leader")]
    NoLongerLeader,
    #[error("request already outstanding")]
    PeerConcurrencyThrottle,
    #[error("peer not in configuration")]
    UnknownPeer,
    #[error("log read failed: {0}")]
    Wal(#[from] WalError),
    #[error("snapshot unavailable: {0}")]
    Snapshot(String),
}

#[derive(Debug, thiserror::Error)]
enum SnapshotError {
    #[error("{0}")]
    Wal(#[from] WalError),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("state machine: {0}")]
    StateMachine(String),
}

mod leader_timer_handler {
    use crate::grpc::{ProtoAppendEntriesReq, ProtoInstallSnapshotChunk, ProtoLogEntry};
    use crate::replica::replica::ReplicateError;
    use crate::replica::snapshot::{SnapshotMeta, SnapshotStore};
    use crate::replica::write_ahead_log::{index_as_u64, Index, WriteAheadLog, WriteAheadLogEntry};
    use crate::replica::{ReplicaId, Term};

    pub(super) enum Outbound {
        AppendEntries {
            previous_log_entry: Option<(Term, Index)>,
            entries: Vec<WriteAheadLogEntry>,
        },
        // The peer needs entries we no longer have.
        Snapshot(SnapshotMeta),
    }

    pub(super) struct SnapshotHeader {
        pub(super) my_id: ReplicaId,
        pub(super) term: Term,
        pub(super) meta: SnapshotMeta,
    }

    pub(super) fn next_outbound(
        wal: &WriteAheadLog,
        snapshot_store: &SnapshotStore,
        next_index: Index,
        opt_previous_index: Option<Index>,
        max_entries: usize,
    ) -> Result<Outbound, ReplicateError> {
        let previous_log_entry = match opt_previous_index {
            None => None,
            Some(previous_index) => match wal.term_at(previous_index)? {
                Some(term) => Some((term, previous_index)),
                None => return latest_snapshot(snapshot_store),
            },
        };

        if next_index < wal.first_index()? && wal.snapshot_boundary().is_some() {
            return latest_snapshot(snapshot_store);
        }

        let entries = wal.entries_from(next_index, max_entries)?;
        Ok(Outbound::AppendEntries {
            previous_log_entry,
            entries,
        })
    }

    fn latest_snapshot(snapshot_store: &SnapshotStore) -> Result<Outbound, ReplicateError> {
        match snapshot_store.latest() {
            Ok(Some(meta)) => Ok(Outbound::Snapshot(meta)),
            Ok(None) => Err(ReplicateError::Snapshot("log is compacted but there is no snapshot".into())),
            Err(e) => Err(ReplicateError::Snapshot(e.to_string())),
        }
    }

    // This is the infallible parts of creating the request object.
    pub(super) fn build_append_entries_request(
        current_term: Term,
        my_id: ReplicaId,
        previous_log_entry_metadata: Option<(Term, Index)>,
        commit_index: Option<Index>,
        new_entries: Vec<WriteAheadLogEntry>,
    ) -> ProtoAppendEntriesReq {
        let (previous_log_entry_term_u64, previous_log_entry_index_u64) = match previous_log_entry_metadata {
            None => (0, 0),
            Some((term, idx)) => (term.as_u64(), idx.as_u64()),
        };

        let new_entries = new_entries
            .into_iter()
            .map(|entry| ProtoLogEntry {
                term: entry.term.as_u64(),
                data: entry.wire_data(),
            })
            .collect();

        ProtoAppendEntriesReq {
            client_node_id: my_id.into_inner(),
            term: current_term.as_u64(),
            commit_index: index_as_u64(commit_index),
            previous_log_entry_term: previous_log_entry_term_u64,
            previous_log_entry_index: previous_log_entry_index_u64,
            new_entries,
        }
    }

    /// Splits snapshot data into stream messages. The first carries the metadata and the last is
    /// marked done. Empty data still produces one message.
    pub(super) fn snapshot_chunks(
        header: SnapshotHeader,
        data: Vec<u8>,
        chunk_size: usize,
    ) -> Vec<ProtoInstallSnapshotChunk> {
        let mut pieces: Vec<&[u8]> = data.chunks(chunk_size).collect();
        if pieces.is_empty() {
            pieces.push(&[]);
        }

        let last = pieces.len() - 1;
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| ProtoInstallSnapshotChunk {
                client_node_id: header.my_id.as_str().to_string(),
                term: header.term.as_u64(),
                meta: if i == 0 { Some((&header.meta).into()) } else { None },
                data: piece.to_vec(),
                done: i == last,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::leader_timer_handler::{snapshot_chunks, SnapshotHeader};
    use crate::replica::cluster::{ClusterConfig, ReplicaId};
    use crate::replica::snapshot::SnapshotMeta;
    use crate::replica::{Index, Replica, Term};

    fn opt_index(v: u64) -> Option<Index> {
        Index::new(v)
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, matches: Vec<u64>) {
            let matches = matches.into_iter().map(opt_index).collect();

            let expected = opt_index(expected);

            assert_eq!(expected, Replica::get_cluster_commit_index(matches));
        }

        // The leader is the 9 on the right.

        // 1-cluster
        run(9, vec![9]);

        // 3-cluster
        run(0, vec![0, 0, 9]);
        run(9, vec![0, 9, 9]);
        run(9, vec![8, 9, 9]);

        // 4-cluster
        run(0, vec![0, 0, 0, 9]);
        run(0, vec![0, 0, 9, 9]);
        run(8, vec![0, 8, 9, 9]);
        run(8, vec![7, 8, 9, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 9, 9]);
        run(8, vec![0, 0, 8, 9, 9]);
        run(8, vec![0, 7, 8, 9, 9]);
        run(8, vec![6, 7, 8, 9, 9]);

        // 6-cluster
        run(0, vec![0, 0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 0, 9, 9]);
        run(0, vec![0, 0, 0, 8, 9, 9]);
        run(7, vec![0, 0, 7, 8, 9, 9]);
        run(7, vec![0, 6, 7, 8, 9, 9]);
        run(7, vec![5, 6, 7, 8, 9, 9]);

        // 7-cluster
        run(0, vec![0, 0, 0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 0, 0, 9, 9]);
        run(0, vec![0, 0, 0, 0, 8, 9, 9]);
        run(7, vec![0, 0, 0, 7, 8, 9, 9]);
        run(7, vec![0, 0, 6, 7, 8, 9, 9]);
        run(7, vec![0, 5, 6, 7, 8, 9, 9]);
        run(7, vec![4, 5, 6, 7, 8, 9, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 9, 8]);
        run(8, vec![7, 9, 9, 8]);
        run(8, vec![6, 9, 0, 8, 9]);
        run(7, vec![9, 8, 0, 9, 0, 7]);

        // Removed leader doesn't count itself.
        run(0, vec![]);
        run(5, vec![5, 5]);
    }

    #[test]
    fn majority() {
        assert_eq!(Replica::get_majority_vote_count(1), 1);
        assert_eq!(Replica::get_majority_vote_count(2), 2);
        assert_eq!(Replica::get_majority_vote_count(3), 2);
        assert_eq!(Replica::get_majority_vote_count(4), 3);
        assert_eq!(Replica::get_majority_vote_count(5), 3);
    }

    fn header() -> SnapshotHeader {
        SnapshotHeader {
            my_id: ReplicaId::new("leader"),
            term: Term::new(4),
            meta: SnapshotMeta {
                last_included_index: Index::new(12).unwrap(),
                last_included_term: Term::new(3),
                config: ClusterConfig::single(ReplicaId::new("leader"), "127.0.0.1:1".into()),
            },
        }
    }

    #[test]
    fn snapshot_is_split_into_chunks() {
        let chunks = snapshot_chunks(header(), vec![7u8; 10], 4);

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.data.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert!(chunks[0].meta.is_some());
        assert!(chunks[1..].iter().all(|c| c.meta.is_none()));
        assert_eq!(chunks.iter().map(|c| c.done).collect::<Vec<_>>(), vec![false, false, true]);
        assert!(chunks.iter().all(|c| c.term == 4 && c.client_node_id == "leader"));
    }

    #[test]
    fn empty_snapshot_is_one_chunk() {
        let chunks = snapshot_chunks(header(), Vec::new(), 4);

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert_eq!(chunks[0].meta.as_ref().map(|m| m.last_included_index), Some(12));
    }
}
