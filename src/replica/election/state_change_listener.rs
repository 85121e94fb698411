use crate::replica::LeaderRedirectInfo;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElectionStateSnapshot {
    Leader,
    Candidate,
    Follower(LeaderRedirectInfo),
    FollowerNoLeader,
}

impl ElectionStateSnapshot {
    pub(crate) fn has_leader(&self) -> bool {
        matches!(self, ElectionStateSnapshot::Leader | ElectionStateSnapshot::Follower(_))
    }
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // No listeners left is fine.
        let _ = self.snd.send(new_state);
    }
}

/// ElectionStateChangeListener observes the replica's election state from outside the actor.
#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }

    /// Waits for the next change. None once the replica has exited.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    /// Resolves with the first state (current one included) matching `predicate`. None if the
    /// replica exits first.
    pub(crate) async fn wait_for<F>(&mut self, predicate: F) -> Option<ElectionStateSnapshot>
    where
        F: Fn(&ElectionStateSnapshot) -> bool,
    {
        let current = self.current();
        if predicate(&current) {
            return Some(current);
        }

        while let Some(state) = self.next().await {
            if predicate(&state) {
                return Some(state);
            }
        }

        None
    }
}
