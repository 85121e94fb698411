use crate::actor::WeakActorClient;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::TimerHandle;
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::{
    ElectionStateChangeListener, ElectionStateSnapshot, Index, LeaderRedirectInfo, LeaderTimerTick, ReplicaId, Term,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

pub(crate) enum CurrentLeader {
    Me,
    Other(LeaderRedirectInfo),
    Unknown,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState {
            leader: None,
            election_timer: Self::election_timer(&config, &actor_client),
        });
        let (notifier, listener) = state_change_listener::new(Self::snapshot_of(&initial_state));

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    fn election_timer(config: &ElectionConfig, actor_client: &WeakActorClient) -> TimerHandle {
        TimerHandle::spawn_election_timeout(
            config.follower_min_timeout,
            config.follower_max_timeout,
            actor_client.clone(),
        )
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<LeaderRedirectInfo>) {
        self.state = State::Follower(FollowerState {
            leader: new_leader,
            election_timer: Self::election_timer(&self.config, &self.actor_client),
        });
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) {
        let mut received_votes_from = HashSet::with_capacity(3);
        received_votes_from.insert(self.config.my_replica_id.clone());

        self.state = State::Candidate(CandidateState {
            received_votes_from,
            election_timer: Self::election_timer(&self.config, &self.actor_client),
        });
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: HashSet<ReplicaId>,
        latest_log_entry_index: Option<Index>,
    ) {
        let mut tracker = LeaderStateTracker::new(HashMap::with_capacity(peer_ids.len()));
        for peer_id in peer_ids {
            let peer_state = self.new_peer_state(term, peer_id.clone(), latest_log_entry_index);
            tracker.insert(peer_id, peer_state);
        }

        self.state = State::Leader(LeaderState { tracker });
        self.notify_new_state();
    }

    fn new_peer_state(&self, term: Term, peer_id: ReplicaId, latest_log_entry_index: Option<Index>) -> PeerState {
        let heartbeat_timer = TimerHandle::spawn_heartbeat(
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            LeaderTimerTick { peer_id, term },
        );
        PeerState::new(heartbeat_timer, latest_log_entry_index)
    }

    /// Leader only: start tracking new peers and forget removed ones after a configuration change.
    pub(crate) fn sync_leader_peers(
        &mut self,
        term: Term,
        peer_ids: &HashSet<ReplicaId>,
        latest_log_entry_index: Option<Index>,
    ) {
        let new_peers: Vec<ReplicaId> = match &self.state {
            State::Leader(ls) => peer_ids
                .iter()
                .filter(|id| !ls.tracker.contains(id))
                .cloned()
                .collect(),
            _ => return,
        };
        let new_peer_states: Vec<(ReplicaId, PeerState)> = new_peers
            .into_iter()
            .map(|id| {
                let state = self.new_peer_state(term, id.clone(), latest_log_entry_index);
                (id, state)
            })
            .collect();

        if let State::Leader(ls) = &mut self.state {
            ls.tracker.retain(peer_ids);
            for (id, state) in new_peer_states {
                ls.tracker.insert(id, state);
            }
        }
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::snapshot_of(&self.state)
    }

    fn snapshot_of(state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(_) => ElectionStateSnapshot::Leader,
            State::Candidate(_) => ElectionStateSnapshot::Candidate,
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => ElectionStateSnapshot::Follower(leader_info.clone()),
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier.notify_new_state(Self::snapshot_of(&self.state));
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => CurrentLeader::Other(leader.clone()),
            _ => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.election_timer.reset();
        }
    }

    /// False if the election timer was reset after the timeout event was queued, or if we're
    /// leader (no election timer at all).
    pub(crate) fn is_election_timeout_due(&self) -> bool {
        match &self.state {
            State::Leader(_) => false,
            State::Candidate(cs) => cs.election_timer.is_due(),
            State::Follower(fs) => fs.election_timer.is_due(),
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderRedirectInfo) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Returns everyone who voted for us if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<&HashSet<ReplicaId>> {
        if let State::Candidate(cs) = &mut self.state {
            cs.received_votes_from.insert(vote_from);
            Some(&cs.received_votes_from)
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => write!(f, "Follower(Leader={})", leader_info.replica_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    election_timer: TimerHandle,
}

struct FollowerState {
    leader: Option<LeaderRedirectInfo>,
    election_timer: TimerHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;

    fn config() -> ElectionConfig {
        ElectionConfig {
            my_replica_id: ReplicaId::new("me"),
            leader_heartbeat_duration: Duration::from_secs(60),
            follower_min_timeout: Duration::from_secs(60),
            follower_max_timeout: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut state, listener) = ElectionState::new_follower(config(), actor_client.weak());
        assert_eq!(listener.current(), ElectionStateSnapshot::FollowerNoLeader);
        assert!(!state.is_election_timeout_due());

        state.transition_to_candidate_and_vote_for_self();
        assert_eq!(listener.current(), ElectionStateSnapshot::Candidate);
        assert_eq!(state.add_vote_if_candidate(ReplicaId::new("b")).map(|v| v.len()), Some(2));

        let mut peers = HashSet::new();
        peers.insert(ReplicaId::new("b"));
        state.transition_to_leader(Term::new(1), peers.clone(), None);
        assert_eq!(listener.current(), ElectionStateSnapshot::Leader);
        assert!(state.add_vote_if_candidate(ReplicaId::new("c")).is_none());
        assert!(!state.is_election_timeout_due());

        peers.insert(ReplicaId::new("c"));
        peers.remove(&ReplicaId::new("b"));
        state.sync_leader_peers(Term::new(1), &peers, None);
        assert_eq!(state.leader_state().map(|ls| ls.peer_ids()), Some(peers));

        let leader = LeaderRedirectInfo {
            replica_id: ReplicaId::new("c"),
            addr: "127.0.0.1:1".to_string(),
        };
        state.transition_to_follower(None);
        state.set_leader_if_unknown(&leader);
        assert_eq!(listener.current(), ElectionStateSnapshot::Follower(leader));
    }
}
