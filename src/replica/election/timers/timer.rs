use crate::actor::WeakActorClient;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::LeaderTimerTick;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, Weak};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimerEvent {
    LeaderTick(LeaderTimerTick),
    FollowerTimeout,
}

enum Schedule {
    /// Fires right away, then once per `period` unless pushed back by a reset.
    Heartbeat { period: Duration },
    /// Fires after a random duration in `range` unless pushed back by a reset. After firing it
    /// keeps firing every `range.start()` until the owner drops the handle.
    Timeout { range: RangeInclusive<Duration> },
}

/// TimerHandle owns a background task that sends a timer event to the replica actor whenever the
/// deadline passes. Dropping the handle stops the task, so a handle lives exactly as long as the
/// election state that needs it.
pub(crate) struct TimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    // None means "fire now".
    deadline: Mutex<Option<Instant>>,
    schedule: Schedule,
    event: TimerEvent,
    clock: C,
}

struct TimerTask<C: Clock> {
    shared: Weak<Shared<C>>,
    actor_client: WeakActorClient,
    clock: C,
}

enum Step {
    Sleep(Instant),
    Fire(TimerEvent),
}

impl TimerHandle {
    pub(crate) fn spawn_heartbeat(period: Duration, actor_client: WeakActorClient, tick: LeaderTimerTick) -> Self {
        let (task, handle) = TimerHandle::new(
            Schedule::Heartbeat { period },
            TimerEvent::LeaderTick(tick),
            actor_client,
            RealClock,
        );
        tokio::task::spawn(task.run());
        handle
    }

    pub(crate) fn spawn_election_timeout(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let (task, handle) = TimerHandle::new(
            Schedule::Timeout {
                range: min_timeout..=max_timeout,
            },
            TimerEvent::FollowerTimeout,
            actor_client,
            RealClock,
        );
        tokio::task::spawn(task.run());
        handle
    }
}

impl<C: Clock> TimerHandle<C> {
    fn new(schedule: Schedule, event: TimerEvent, actor_client: WeakActorClient, clock: C) -> (TimerTask<C>, Self) {
        let shared = Arc::new(Shared {
            deadline: Mutex::new(None),
            schedule,
            event,
            clock: clock.clone(),
        });

        // A timeout must start armed, otherwise it would fire the moment we become follower.
        if let Schedule::Timeout { .. } = shared.schedule {
            shared.reset();
        }

        let task = TimerTask {
            shared: Arc::downgrade(&shared),
            actor_client,
            clock,
        };

        (task, TimerHandle { shared })
    }

    /// Pushes the next firing back: a full period for heartbeats, a fresh random timeout otherwise.
    pub(crate) fn reset(&self) {
        self.shared.reset();
    }

    /// False if the timer was reset after its last firing. Lets the actor drop timer events that
    /// were already queued when the reset happened. Re-firing on its own never makes it false.
    pub(crate) fn is_due(&self) -> bool {
        match self.shared.deadline() {
            Some(deadline) => deadline <= self.shared.clock.now(),
            None => true,
        }
    }
}

impl<C: Clock> Shared<C> {
    fn deadline(&self) -> Option<Instant> {
        match self.deadline.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_deadline(&self, deadline: Instant) {
        match self.deadline.lock() {
            Ok(mut guard) => *guard = Some(deadline),
            Err(poisoned) => *poisoned.into_inner() = Some(deadline),
        }
    }

    fn reset(&self) {
        let wait = match &self.schedule {
            Schedule::Heartbeat { period } => *period,
            Schedule::Timeout { range } => rand::thread_rng().gen_range(range.clone()),
        };
        self.set_deadline(self.clock.now() + wait);
    }

    fn refire_wait(&self) -> Duration {
        match &self.schedule {
            Schedule::Heartbeat { period } => *period,
            Schedule::Timeout { range } => *range.start(),
        }
    }
}

impl<C: Clock> TimerTask<C> {
    async fn run(self) {
        // Only `reset()` moves the shared deadline. Re-fires are scheduled here, so a timer nobody
        // reset stays due.
        let mut refire_at: Option<Instant> = None;

        loop {
            let step = match self.shared.upgrade() {
                // Handle dropped: the election state that owned us is gone.
                None => return,
                Some(shared) => {
                    let now = self.clock.now();
                    let next = match (shared.deadline(), refire_at) {
                        (Some(deadline), Some(refire)) => Some(deadline.max(refire)),
                        (deadline, refire) => deadline.or(refire),
                    };
                    match next {
                        Some(next) if now < next => Step::Sleep(next),
                        _ => {
                            refire_at = Some(now + shared.refire_wait());
                            Step::Fire(shared.event.clone())
                        }
                    }
                }
            };

            match step {
                Step::Sleep(deadline) => self.clock.sleep_until(deadline).await,
                Step::Fire(event) => {
                    if self.actor_client.timer_fired(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::test_utils::{mocked_clock, TestUtilActor};
    use crate::replica::{ReplicaId, Term};

    fn heartbeat_timer<C: Clock>(
        period: Duration,
        actor_client: WeakActorClient,
        tick: LeaderTimerTick,
        clock: C,
    ) -> (TimerTask<C>, TimerHandle<C>) {
        TimerHandle::new(Schedule::Heartbeat { period }, TimerEvent::LeaderTick(tick), actor_client, clock)
    }

    fn election_timer<C: Clock>(
        timeout: Duration,
        actor_client: WeakActorClient,
        clock: C,
    ) -> (TimerTask<C>, TimerHandle<C>) {
        // We are not testing jitter, so min and max are the same.
        TimerHandle::new(
            Schedule::Timeout {
                range: timeout..=timeout,
            },
            TimerEvent::FollowerTimeout,
            actor_client,
            clock,
        )
    }

    fn tick() -> LeaderTimerTick {
        LeaderTimerTick {
            peer_id: ReplicaId::new("peer-123"),
            term: Term::new(10),
        }
    }

    #[tokio::test]
    async fn heartbeat_fires_immediately_then_periodically() {
        let period = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, controller) = mocked_clock();

        let (task, handle) = heartbeat_timer(period, strong_actor_client.weak(), tick(), clock);
        let join_handle = tokio::task::spawn(task.run());

        actor.assert_leader_tick(tick()).await;
        actor.assert_no_event().await;

        for _ in 0..5 {
            controller.advance(period);
            actor.assert_leader_tick(tick()).await;
            actor.assert_no_event().await;
        }

        // A big leap is still a single tick.
        controller.advance(period * 5);
        actor.assert_leader_tick(tick()).await;
        actor.assert_no_event().await;

        drop(handle);
        controller.advance(period);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn heartbeat_reset_pushes_next_tick_back() {
        let period = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, controller) = mocked_clock();

        let (task, handle) = heartbeat_timer(period, strong_actor_client.weak(), tick(), clock);
        tokio::task::spawn(task.run());
        actor.assert_leader_tick(tick()).await;

        for _ in 0..5 {
            controller.advance(period / 2);
            handle.reset();
        }
        actor.assert_no_event().await;
        assert_eq!(controller.elapsed_time(), period * 5 / 2);

        controller.advance(period / 2);
        actor.assert_no_event().await;

        // Last reset was at T=2.5.
        controller.advance(period / 2);
        actor.assert_leader_tick(tick()).await;
        assert_eq!(controller.elapsed_time(), period * 7 / 2);
    }

    #[tokio::test]
    async fn election_timeout_reset_and_fire() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, controller) = mocked_clock();

        let (task, handle) = election_timer(timeout, strong_actor_client.weak(), clock);
        tokio::task::spawn(task.run());
        actor.assert_no_event().await;

        for _ in 0..5 {
            controller.advance(timeout / 2);
            handle.reset();
        }
        actor.assert_no_event().await;
        assert!(!handle.is_due());

        let one_ns = Duration::from_nanos(1);
        controller.advance(timeout - one_ns);
        actor.assert_no_event().await;

        controller.advance(one_ns);
        actor.assert_follower_timeout().await;
        assert!(handle.is_due());

        // Keeps retrying while nobody resets it.
        controller.advance(timeout);
        actor.assert_follower_timeout().await;
        assert!(handle.is_due());
    }

    #[tokio::test]
    async fn election_timeout_stays_due_between_refires() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, controller) = mocked_clock();

        let (task, handle) = election_timer(timeout, strong_actor_client.weak(), clock);
        tokio::task::spawn(task.run());

        // The actor handles each event some time after it was sent, before the next re-fire.
        for _ in 0..3 {
            controller.advance(timeout);
            actor.assert_follower_timeout().await;
            controller.advance(timeout / 2);
            assert!(handle.is_due());
            controller.advance(timeout / 2);
            actor.assert_follower_timeout().await;
            assert!(handle.is_due());
            handle.reset();
            assert!(!handle.is_due());
        }
    }

    #[tokio::test]
    async fn election_timeout_stops_when_dropped() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, controller) = mocked_clock();

        let (task, handle) = election_timer(timeout, strong_actor_client.weak(), clock);
        let join_handle = tokio::task::spawn(task.run());
        drop(handle);

        controller.advance(timeout * 2);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn election_timeout_can_be_reset_after_firing() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, controller) = mocked_clock();

        let (task, handle) = election_timer(timeout, strong_actor_client.weak(), clock);
        tokio::task::spawn(task.run());

        // An AppendEntries may already be queued behind the timeout event in the actor.
        controller.advance(timeout);
        actor.assert_follower_timeout().await;
        handle.reset();

        for _ in 0..5 {
            controller.advance(timeout / 2);
            handle.reset();
        }
        actor.assert_no_event().await;
    }
}
