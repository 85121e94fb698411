use crate::actor::Event;
use crate::replica::election::timers::clock::Clock;
use crate::replica::election::timers::TimerEvent;
use crate::replica::LeaderTimerTick;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

pub(super) fn mocked_clock() -> (MockClock, MockClockController) {
    let time = Arc::new(MockTime {
        now: Mutex::new(Instant::now()),
        ticked: Notify::new(),
    });
    let start = time.read();

    (MockClock { time: time.clone() }, MockClockController { time, start })
}

struct MockTime {
    now: Mutex<Instant>,
    ticked: Notify,
}

impl MockTime {
    fn read(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

/// MockClock only moves when its controller says so.
#[derive(Clone)]
pub(super) struct MockClock {
    time: Arc<MockTime>,
}

#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.time.read()
    }

    async fn sleep_until(&self, deadline: Instant) {
        loop {
            // Created before the check so an advance in between still wakes us.
            let ticked = self.time.ticked.notified();
            if self.time.read() >= deadline {
                return;
            }
            ticked.await;
        }
    }
}

pub(super) struct MockClockController {
    time: Arc<MockTime>,
    start: Instant,
}

impl MockClockController {
    pub(super) fn now(&self) -> Instant {
        self.time.read()
    }

    pub(super) fn elapsed_time(&self) -> Duration {
        self.now() - self.start
    }

    /// Sleepers wake at most once per call, so a big jump looks like one late wakeup rather than
    /// many on-time ones. Advance in small steps when that matters.
    pub(super) fn advance(&self, duration: Duration) {
        *self.time.now.lock().unwrap() += duration;
        self.time.ticked.notify_waiters();
    }
}

pub(super) struct TestUtilActor {
    rx: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl TestUtilActor {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        TestUtilActor {
            rx,
            quiet_period: Duration::from_millis(10),
        }
    }

    async fn recv_timer_event(&mut self) -> TimerEvent {
        let event = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Actor queue closed");
        match event {
            Event::Timer(timer_event) => timer_event,
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn assert_leader_tick(&mut self, expected: LeaderTimerTick) {
        assert_eq!(self.recv_timer_event().await, TimerEvent::LeaderTick(expected));
    }

    pub(super) async fn assert_follower_timeout(&mut self) {
        assert_eq!(self.recv_timer_event().await, TimerEvent::FollowerTimeout);
    }

    pub(super) async fn assert_no_event(&mut self) {
        tokio::time::timeout(self.quiet_period, self.rx.recv())
            .await
            .expect_err("Expected no event");
    }
}

#[tokio::test]
async fn mock_clock_wakes_sleepers_past_deadline() {
    let (clock, controller) = mocked_clock();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let deadline = controller.now() + Duration::from_millis(300);

    tokio::spawn(async move {
        clock.sleep_until(deadline).await;
        tx.send(()).unwrap();
    });

    controller.advance(Duration::from_millis(200));
    tokio::time::timeout(Duration::from_millis(20), rx.recv())
        .await
        .expect_err("woke too early");

    controller.advance(Duration::from_millis(100));
    rx.recv().await.unwrap();
    assert_eq!(controller.elapsed_time(), Duration::from_millis(300));
}
