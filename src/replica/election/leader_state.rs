use crate::replica::election::timers::TimerHandle;
use crate::replica::{Index, ReplicaId};
use std::collections::{HashMap, HashSet};

/// LeaderStateTracker holds the leader's view of every peer's log.
pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(super) fn contains(&self, peer_id: &ReplicaId) -> bool {
        self.peer_state.contains_key(peer_id)
    }

    pub(super) fn insert(&mut self, peer_id: ReplicaId, state: PeerState) {
        self.peer_state.insert(peer_id, state);
    }

    /// Stop tracking (and heartbeating) every peer not in `keep`.
    pub(super) fn retain(&mut self, keep: &HashSet<ReplicaId>) {
        self.peer_state.retain(|id, _| keep.contains(id));
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat_timer: TimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // SeqNo is a logical clock for one leader's interactions with one peer, so replies to
    // requests older than the latest handled reply are discarded. Snapshot transfers use it too.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(heartbeat_timer: TimerHandle, latest_log_entry_index: Option<Index>) -> Self {
        PeerState {
            heartbeat_timer,
            next: latest_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn handle_reply(&mut self, logger: &slog::Logger, received_seq_no: u64, update: PeerStateUpdate) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(logger, "Dropping out of date seq-no({:?}): {:?}", received_seq_no, update);
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                let new_matched = match (previous_log_entry, num_entries_replicated) {
                    (None, 0) => return,
                    (None, n) => Index::start_index().plus(n as u64 - 1),
                    (Some(prev), n) => prev.plus(n as u64),
                };
                self.ratchet_fwd_matched(new_matched);
            }
            PeerStateUpdate::SnapshotInstalled { last_included_index } => {
                self.ratchet_fwd_matched(last_included_index);
            }
            PeerStateUpdate::PeerLogBehind { last_log_index } => {
                self.rewind(logger, last_log_index);
            }
        }
    }

    fn ratchet_fwd_matched(&mut self, new_matched: Index) {
        if self.matched.map(|m| m < new_matched).unwrap_or(true) {
            self.matched = Some(new_matched);
        }
        if self.next <= new_matched {
            self.next = new_matched.plus(1);
        }
    }

    fn rewind(&mut self, logger: &slog::Logger, peer_last_log_index: Option<Index>) {
        let one_back = match self.next.checked_minus(1) {
            Some(i) => i,
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };

        // The peer told us how long its log is, so skip straight past anything it can't have.
        let hinted = peer_last_log_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        let new_next = std::cmp::min(one_back, hinted);

        // Don't trust a reply that contradicts an earlier success.
        if let Some(matched) = self.matched {
            if new_next <= matched {
                slog::warn!(
                    logger,
                    "Peer claims to be missing entries at or below matched index {:?}. Not rewinding.",
                    matched
                );
                return;
            }
        }

        self.next = new_next;
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    SnapshotInstalled {
        last_included_index: Index,
    },
    PeerLogBehind {
        last_log_index: Option<Index>,
    },
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::{LeaderTimerTick, Term};
    use tokio::time::Duration;

    fn index(i: u64) -> Index {
        Index::new(i).unwrap()
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn peer_state(actor_client: &ActorClient, latest: Option<Index>) -> PeerState {
        let timer = TimerHandle::spawn_heartbeat(
            Duration::from_secs(60),
            actor_client.weak(),
            LeaderTimerTick {
                peer_id: ReplicaId::new("peer"),
                term: Term::new(1),
            },
        );
        PeerState::new(timer, latest)
    }

    #[tokio::test]
    async fn success_ratchets_matched_and_next() {
        let (actor_client, _rx) = ActorClient::new(10);
        let mut state = peer_state(&actor_client, Some(index(5)));
        assert_eq!(state.next_and_previous_log_index(), (index(6), Some(index(5))));

        let seq_no = state.next_seq_no();
        assert!(state.has_outstanding_request());
        state.handle_reply(
            &logger(),
            seq_no,
            PeerStateUpdate::Success {
                previous_log_entry: Some(index(5)),
                num_entries_replicated: 3,
            },
        );
        assert!(!state.has_outstanding_request());
        assert_eq!(state.matched(), Some(index(8)));
        assert_eq!(state.next_and_previous_log_index().0, index(9));

        // Replayed reply is dropped.
        state.handle_reply(&logger(), seq_no, PeerStateUpdate::PeerLogBehind { last_log_index: None });
        assert_eq!(state.next_and_previous_log_index().0, index(9));
    }

    #[tokio::test]
    async fn rewind_uses_peer_hint() {
        let (actor_client, _rx) = ActorClient::new(10);
        let mut state = peer_state(&actor_client, Some(index(100)));

        let seq_no = state.next_seq_no();
        state.handle_reply(
            &logger(),
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                last_log_index: Some(index(10)),
            },
        );
        assert_eq!(state.next_and_previous_log_index().0, index(11));

        // Hint beyond what we'd try next only steps back by one.
        let seq_no = state.next_seq_no();
        state.handle_reply(
            &logger(),
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                last_log_index: Some(index(50)),
            },
        );
        assert_eq!(state.next_and_previous_log_index().0, index(10));
    }

    #[tokio::test]
    async fn snapshot_install_jumps_forward() {
        let (actor_client, _rx) = ActorClient::new(10);
        let mut state = peer_state(&actor_client, None);

        let seq_no = state.next_seq_no();
        state.handle_reply(
            &logger(),
            seq_no,
            PeerStateUpdate::SnapshotInstalled {
                last_included_index: index(40),
            },
        );
        assert_eq!(state.matched(), Some(index(40)));
        assert_eq!(state.next_and_previous_log_index().0, index(41));
    }
}
