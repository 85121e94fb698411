use crate::replica::cluster::ReplicaId;
use crate::replica::local_state::Term;
use crate::replica::snapshot::SnapshotMeta;
use crate::replica::Index;
use bytes::Bytes;
use std::path::PathBuf;

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationInput {
    pub(crate) data: Bytes,
}

/// Completed once the entry is committed and applied to the local state machine.
#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) index: Index,
    pub(crate) response: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("Not the leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("No leader is known")]
    NoLeader,

    // The entry may or may not end up committed.
    #[error("Lost leadership before the entry was applied")]
    LeadershipLost,

    #[error("Failed to persist log: {0}")]
    LocalIoError(String),

    #[error("State machine rejected the entry: {0}")]
    StateMachine(String),

    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    // Empty if the leader isn't in our copy of the configuration yet.
    pub(crate) addr: String,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("Local IO failure: {0}")]
    ServerIoError(String),
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesLogEntry {
    pub(crate) term: Term,
    // Wire form of a write-ahead log entry.
    pub(crate) data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Missing the previous log entry")]
    ServerMissingPreviousLogEntry { last_log_index: Option<Index> },
    #[error("Local IO failure: {0}")]
    ServerIoError(String),
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) meta: SnapshotMeta,
    // Fully received snapshot data, not yet installed.
    pub(crate) data_path: PathBuf,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Failed to install the snapshot: {0}")]
    ServerIoError(String),
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MembershipChange {
    AddVoter { replica_id: ReplicaId, addr: String },
    RemoveVoter { replica_id: ReplicaId },
}

#[derive(Debug)]
pub(crate) struct MembershipChangeInput {
    pub(crate) change: MembershipChange,
}

/// Completed once the new configuration is committed (or right away if it was a no-op).
#[derive(Debug)]
pub(crate) struct MembershipChangeOutput {
    // Nothing
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MembershipChangeError {
    #[error("Not the leader")]
    LeaderRedirect(LeaderRedirectInfo),
    #[error("No leader is known")]
    NoLeader,
    #[error("Lost leadership before the configuration was committed")]
    LeadershipLost,
    #[error("Refusing to remove the last voter")]
    LastVoter,
    #[error("Failed to persist log: {0}")]
    LocalIoError(String),
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct ClusterInfo {
    pub(crate) leader_id: Option<ReplicaId>,
    // Latest configuration, committed or not.
    pub(crate) voters: Vec<(ReplicaId, String)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    RetryableFailure,
    MalformedReply,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), PeerReplyError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) last_included_index: Index,
    pub(crate) result: Result<(), PeerReplyError>,
}

#[derive(Debug)]
pub(crate) enum PeerReplyError {
    PeerMissingPreviousLogEntry { last_log_index: Option<Index> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}
