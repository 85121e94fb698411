use crate::replica;
use crate::replica::TimerEvent;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Disk interaction is synchronous inside the actor. Anything that waits on the network is spawned
// and reports back through a WeakActorClient.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Write to disk, replicate eagerly, hold the callback until the entry is applied.
    // Candidate/Follower: Reject with a redirect.
    EnqueueForReplication(
        replica::EnqueueForReplicationInput,
        Callback<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError>,
    ),

    // Leader/Candidate/Follower: Grant vote if applicable (includes write to disk). Step down on a
    // newer term.
    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),

    // Candidate: Count the vote. Transition to leader on quorum.
    // Leader/Follower: discard
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader/Candidate: Step down if the caller is a legitimate leader, then as follower.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),

    // Leader: Update peer progress, advance commit index, apply.
    // Candidate/Follower: discard
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Follower: Replace state machine and log with the received snapshot.
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<replica::InstallSnapshotOutput, replica::InstallSnapshotError>,
    ),

    // Leader: Update peer progress after a snapshot transfer.
    InstallSnapshotReplyFromPeer(replica::InstallSnapshotReplyFromPeer),

    // Leader: Add or remove a voter, one change at a time.
    // Candidate/Follower: Reject with a redirect.
    ChangeMembership(
        replica::MembershipChangeInput,
        Callback<replica::MembershipChangeOutput, replica::MembershipChangeError>,
    ),

    // Any state: Report the latest configuration and leader.
    ClusterInfo(oneshot::Sender<replica::ClusterInfo>),

    // Leader tick: AppendEntries (or snapshot) to one peer.
    // Follower timeout: Transition to candidate. Trigger new election.
    Timer(TimerEvent),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        // Caller may have given up waiting. Nothing to do.
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor has exited")]
pub(crate) struct ActorExited;

/// ActorClient is the strong handle to the replica actor. The actor's event loop ends once every
/// ActorClient is dropped.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn enqueue_for_replication(
        &self,
        input: replica::EnqueueForReplicationInput,
    ) -> Result<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::EnqueueForReplication(input, Callback(tx)))
            .await
            .map_err(|_| replica::EnqueueForReplicationError::ActorExited)?;

        rx.await
            .unwrap_or(Err(replica::EnqueueForReplicationError::ActorExited))
    }

    pub(crate) async fn change_membership(
        &self,
        input: replica::MembershipChangeInput,
    ) -> Result<replica::MembershipChangeOutput, replica::MembershipChangeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ChangeMembership(input, Callback(tx)))
            .await
            .map_err(|_| replica::MembershipChangeError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::MembershipChangeError::ActorExited))
    }

    pub(crate) async fn cluster_info(&self) -> Result<replica::ClusterInfo, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ClusterInfo(tx)).await?;

        rx.await.map_err(|_| ActorExited)
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// WeakActorClient is held by everything the actor itself owns or spawns (timers, peer RPC tasks,
/// the raft RPC server), so those never keep the actor alive.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    fn upgrade(&self) -> Result<ActorClient, ActorExited> {
        self.sender
            .upgrade()
            .map(|sender| ActorClient { sender })
            .ok_or(ActorExited)
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(input, Callback(tx)))
            .await
            .map_err(|_| replica::RequestVoteError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(input, Callback(tx)))
            .await
            .map_err(|_| replica::AppendEntriesError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::AppendEntriesError::ActorExited))
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::InstallSnapshot(input, Callback(tx)))
            .await
            .map_err(|_| replica::InstallSnapshotError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::InstallSnapshotError::ActorExited))
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(&self, reply: replica::RequestVoteReplyFromPeer) {
        let _ = self.send(Event::RequestVoteReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(&self, reply: replica::AppendEntriesReplyFromPeer) {
        let _ = self.send(Event::AppendEntriesReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(&self, reply: replica::InstallSnapshotReplyFromPeer) {
        let _ = self.send(Event::InstallSnapshotReplyFromPeer(reply)).await;
    }

    pub(crate) async fn timer_fired(&self, event: TimerEvent) -> Result<(), ActorExited> {
        self.send(Event::Timer(event)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        // The temporary strong handle is dropped as soon as the event is queued.
        self.upgrade()?.send(event).await
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica,
}

impl ReplicaActor {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }

        slog::info!(self.logger, "All actor clients dropped. Shutting down replica.");
        self.replica.shutdown();
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EnqueueForReplication(input, callback) => {
                self.replica.handle_enqueue_for_replication(input, callback);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.server_handle_install_snapshot(input);
                callback.send(result);
            }
            Event::InstallSnapshotReplyFromPeer(reply) => {
                self.replica.handle_install_snapshot_reply_from_peer(reply);
            }
            Event::ChangeMembership(input, callback) => {
                self.replica.handle_change_membership(input, callback);
            }
            Event::ClusterInfo(tx) => {
                let _ = tx.send(self.replica.cluster_info());
            }
            Event::Timer(TimerEvent::LeaderTick(tick)) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::Timer(TimerEvent::FollowerTimeout) => {
                self.replica.handle_follower_timeout();
            }
        }
    }
}
