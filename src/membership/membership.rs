use crate::gossip::{gossip_message, GossipMember, GossipMessage};
use crate::membership::member::{Member, MemberStatus, MemberTable, MembershipEvent};
use crate::server::{shutdown_signal, ShutdownHandle, ShutdownSignal};
use prost::Message;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

// Largest UDP payload.
const MAX_DATAGRAM_SIZE: usize = 65_507;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler is told about other nodes joining and leaving. Calls are made one at a time, in event
/// order. Errors are logged and don't stop later events.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<(), HandlerError>;

    async fn leave(&self, name: &str) -> Result<(), HandlerError>;
}

#[derive(Clone, Debug)]
pub struct MembershipConfig {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub tags: HashMap<String, String>,
    /// Gossip addresses of existing members to contact until someone answers.
    pub start_join_addrs: Vec<SocketAddr>,
    pub gossip_interval: Duration,
    pub gossip_fanout: usize,
    pub suspect_timeout: Duration,
    /// How long left and failed members are remembered after they were last heard from.
    pub tombstone_retention: Duration,
}

impl MembershipConfig {
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        MembershipConfig {
            node_name: node_name.into(),
            bind_addr,
            tags: HashMap::new(),
            start_join_addrs: Vec::new(),
            gossip_interval: Duration::from_millis(200),
            gossip_fanout: 3,
            suspect_timeout: Duration::from_secs(3),
            tombstone_retention: Duration::from_secs(60),
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.node_name.is_empty() {
            return Err("Node name must be non-empty");
        }
        if self.gossip_interval == Duration::from_millis(0) {
            return Err("Gossip interval must be non-zero");
        }
        if self.gossip_fanout == 0 {
            return Err("Gossip fanout must be non-zero");
        }
        if self.suspect_timeout <= self.gossip_interval {
            return Err("Suspect timeout must be greater than the gossip interval");
        }
        if self.tombstone_retention <= self.suspect_timeout {
            return Err("Tombstone retention must be greater than the suspect timeout");
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("invalid membership config: {0}")]
    InvalidConfig(&'static str),
    #[error("gossip socket failure: {0}")]
    Io(#[from] io::Error),
}

/// Membership runs gossip for this node and feeds join/leave events of other nodes to a `Handler`.
pub struct Membership {
    logger: slog::Logger,
    local_addr: SocketAddr,
    table: Arc<Mutex<MemberTable>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

struct Running {
    socket: Arc<UdpSocket>,
    gossip_shutdown: ShutdownHandle,
    gossip_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
}

impl Membership {
    pub async fn new(
        logger: slog::Logger,
        handler: Arc<dyn Handler>,
        config: MembershipConfig,
    ) -> Result<Self, MembershipError> {
        config.validate().map_err(MembershipError::InvalidConfig)?;
        let logger = logger.new(slog::o!("Component" => "Membership"));

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local = Member {
            name: config.node_name.clone(),
            addr: socket.local_addr()?,
            tags: config.tags.clone(),
            incarnation: chrono::Utc::now().timestamp_millis() as u64,
            heartbeat: 0,
            status: MemberStatus::Alive,
        };
        let local_addr = local.addr;
        slog::info!(logger, "Gossiping as {} on {:?}", local.name, local_addr);
        let table = Arc::new(Mutex::new(MemberTable::new(local, Instant::now())));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let event_task = tokio::spawn(run_event_loop(
            logger.clone(),
            config.node_name.clone(),
            handler,
            event_rx,
        ));

        let (gossip_shutdown, shutdown) = shutdown_signal();
        let gossiper = Gossiper {
            logger: logger.clone(),
            socket: socket.clone(),
            table: table.clone(),
            events: event_tx,
            seeds: config.start_join_addrs,
            gossip_interval: config.gossip_interval,
            gossip_fanout: config.gossip_fanout,
            suspect_timeout: config.suspect_timeout,
            tombstone_retention: config.tombstone_retention,
        };
        let gossip_task = tokio::spawn(gossiper.run(shutdown));

        Ok(Membership {
            logger,
            local_addr,
            table,
            running: tokio::sync::Mutex::new(Some(Running {
                socket,
                gossip_shutdown,
                gossip_task,
                event_task,
            })),
        })
    }

    /// Address the gossip socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Every member this node has heard of, itself included, in any status.
    pub fn members(&self) -> Vec<Member> {
        lock(&self.table).members()
    }

    /// Tells the cluster this node is leaving, then stops gossiping. Safe to call repeatedly.
    pub async fn leave(&self) -> Result<(), MembershipError> {
        let running = match self.running.lock().await.take() {
            Some(running) => running,
            None => return Ok(()),
        };

        running.gossip_shutdown.shutdown();
        if let Err(e) = running.gossip_task.await {
            slog::warn!(self.logger, "Gossip task failed: {:?}", e);
        }

        let (datagram, peers) = {
            let mut table = lock(&self.table);
            table.mark_local_left();
            (encode(gossip_message::Kind::Push, &table), table.alive_peer_addrs())
        };
        for peer in peers {
            if let Err(e) = running.socket.send_to(&datagram, peer).await {
                slog::debug!(self.logger, "Failed to tell {:?} we're leaving: {:?}", peer, e);
            }
        }

        // The gossip task owned the only event sender, so this ends once queued events are handled.
        if let Err(e) = running.event_task.await {
            slog::warn!(self.logger, "Membership event task failed: {:?}", e);
        }

        slog::info!(self.logger, "Left the cluster.");
        Ok(())
    }
}

fn lock(table: &Mutex<MemberTable>) -> MutexGuard<'_, MemberTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode(kind: gossip_message::Kind, table: &MemberTable) -> Vec<u8> {
    let message = GossipMessage {
        kind: kind as i32,
        from: table.local_name().to_string(),
        members: table.members().iter().map(GossipMember::from).collect(),
    };

    let mut buf = Vec::with_capacity(message.encoded_len());
    // Vec grows as needed, so encoding can't run out of space.
    let _ = message.encode(&mut buf);
    buf
}

struct Gossiper {
    logger: slog::Logger,
    socket: Arc<UdpSocket>,
    table: Arc<Mutex<MemberTable>>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    seeds: Vec<SocketAddr>,
    gossip_interval: Duration,
    gossip_fanout: usize,
    suspect_timeout: Duration,
    tombstone_retention: Duration,
}

impl Gossiper {
    async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.gossip_interval);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.gossip_round().await,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(e) => slog::debug!(self.logger, "Failed to receive gossip: {:?}", e),
                },
            }
        }

        slog::info!(self.logger, "Gossip loop has exited.");
    }

    async fn gossip_round(&self) {
        let (datagram, targets) = {
            let mut table = lock(&self.table);
            let now = Instant::now();
            table.bump_local_heartbeat(now);
            for event in table.detect_failures(now, self.suspect_timeout) {
                self.publish(event);
            }
            for name in table.prune_departed(now, self.tombstone_retention) {
                slog::debug!(self.logger, "Forgot departed member {}", name);
            }

            let mut peers = table.alive_peer_addrs();
            if peers.is_empty() {
                peers = self.seeds.clone();
            }
            let targets: Vec<SocketAddr> = peers
                .choose_multiple(&mut rand::thread_rng(), self.gossip_fanout)
                .copied()
                .collect();

            (encode(gossip_message::Kind::Push, &table), targets)
        };

        for target in targets {
            if let Err(e) = self.socket.send_to(&datagram, target).await {
                slog::debug!(self.logger, "Failed to gossip to {:?}: {:?}", target, e);
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let message = match GossipMessage::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                slog::debug!(self.logger, "Dropping malformed gossip from {:?}: {:?}", from, e);
                return;
            }
        };

        let reply = {
            let mut table = lock(&self.table);
            let now = Instant::now();
            for proto in message.members {
                match Member::try_from(proto) {
                    Ok(member) => {
                        if let Some(event) = table.merge(member, now) {
                            self.publish(event);
                        }
                    }
                    Err(e) => slog::debug!(self.logger, "Dropping malformed member from {:?}: {}", from, e),
                }
            }

            match gossip_message::Kind::from_i32(message.kind) {
                Some(gossip_message::Kind::Push) => Some(encode(gossip_message::Kind::Pull, &table)),
                _ => None,
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = self.socket.send_to(&reply, from).await {
                slog::debug!(self.logger, "Failed to answer {:?}: {:?}", from, e);
            }
        }
    }

    fn publish(&self, event: MembershipEvent) {
        slog::info!(self.logger, "Membership event: {:?}", event);
        // Only fails once the event loop is gone, i.e. during shutdown.
        let _ = self.events.send(event);
    }
}

async fn run_event_loop(
    logger: slog::Logger,
    local_name: String,
    handler: Arc<dyn Handler>,
    mut events: mpsc::UnboundedReceiver<MembershipEvent>,
) {
    while let Some(event) = events.recv().await {
        if event.member().name == local_name {
            continue;
        }

        let result = match &event {
            MembershipEvent::MemberJoined(member) => match member.rpc_addr() {
                Some(rpc_addr) => handler.join(&member.name, rpc_addr).await,
                None => Err(format!("member {} has no {} tag", member.name, super::RPC_ADDR_TAG).into()),
            },
            MembershipEvent::MemberLeft(member) | MembershipEvent::MemberFailed(member) => {
                handler.leave(&member.name).await
            }
        };

        if let Err(e) = result {
            let member = event.member();
            slog::error!(
                logger,
                "Membership handler failed";
                "name" => &member.name,
                "rpc_addr" => member.rpc_addr().unwrap_or_default(),
                "event" => format!("{:?}", event),
                "error" => e.to_string()
            );
        }
    }

    slog::info!(logger, "Membership event loop has exited.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::RPC_ADDR_TAG;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Join(String, String),
        Leave(String),
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingHandler {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Handler for RecordingHandler {
        async fn join(&self, name: &str, rpc_addr: &str) -> Result<(), HandlerError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Join(name.to_string(), rpc_addr.to_string()));
            Ok(())
        }

        async fn leave(&self, name: &str) -> Result<(), HandlerError> {
            self.calls.lock().unwrap().push(Call::Leave(name.to_string()));
            Ok(())
        }
    }

    fn config(name: &str, seeds: Vec<SocketAddr>) -> MembershipConfig {
        let mut config = MembershipConfig::new(name, "127.0.0.1:0".parse().unwrap());
        config
            .tags
            .insert(RPC_ADDR_TAG.to_string(), format!("{}.rpc:8400", name));
        config.start_join_addrs = seeds;
        config.gossip_interval = Duration::from_millis(20);
        config.suspect_timeout = Duration::from_millis(500);
        config
    }

    async fn start(name: &str, seeds: Vec<SocketAddr>) -> (Membership, Arc<RecordingHandler>, SocketAddr) {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let handler = Arc::new(RecordingHandler::default());
        let membership = Membership::new(logger, handler.clone(), config(name, seeds)).await.unwrap();
        let addr = membership
            .members()
            .into_iter()
            .find(|m| m.name == name)
            .unwrap()
            .addr;
        (membership, handler, addr)
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Condition not met in time");
    }

    #[tokio::test]
    async fn join_and_leave_are_reported() {
        let (m0, h0, addr0) = start("0", vec![]).await;
        let (m1, h1, _) = start("1", vec![addr0]).await;
        let (m2, _h2, _) = start("2", vec![addr0]).await;

        eventually(|| {
            let calls = h0.calls();
            calls.contains(&Call::Join("1".into(), "1.rpc:8400".into()))
                && calls.contains(&Call::Join("2".into(), "2.rpc:8400".into()))
        })
        .await;
        // Node 1 learns about 2 through 0.
        eventually(|| h1.calls().contains(&Call::Join("2".into(), "2.rpc:8400".into()))).await;
        assert!(!h0.calls().iter().any(|c| matches!(c, Call::Join(name, _) if name == "0")));

        m2.leave().await.unwrap();
        m2.leave().await.unwrap();
        eventually(|| h0.calls().contains(&Call::Leave("2".into()))).await;

        let left = m0.members().into_iter().find(|m| m.name == "2").unwrap();
        assert_eq!(left.status, MemberStatus::Left);

        m1.leave().await.unwrap();
        m0.leave().await.unwrap();
    }

    #[tokio::test]
    async fn silent_member_is_reported_failed() {
        let (m0, h0, addr0) = start("0", vec![]).await;
        let (m1, _h1, _) = start("1", vec![addr0]).await;
        eventually(|| h0.calls().contains(&Call::Join("1".into(), "1.rpc:8400".into()))).await;

        // Stop gossiping without saying goodbye.
        if let Some(running) = m1.running.lock().await.take() {
            running.gossip_task.abort();
            running.event_task.abort();
        }

        eventually(|| h0.calls().contains(&Call::Leave("1".into()))).await;
        let failed = m0.members().into_iter().find(|m| m.name == "1").unwrap();
        assert_eq!(failed.status, MemberStatus::Failed);

        m0.leave().await.unwrap();
    }

    #[test]
    fn config_is_validated() {
        let mut slow = config("a", vec![]);
        slow.suspect_timeout = slow.gossip_interval;
        assert!(slow.validate().is_err());

        let mut forgetful = config("a", vec![]);
        forgetful.tombstone_retention = forgetful.suspect_timeout;
        assert!(forgetful.validate().is_err());

        let mut silent = config("a", vec![]);
        silent.gossip_fanout = 0;
        assert!(silent.validate().is_err());

        assert!(config("a", vec![]).validate().is_ok());
    }
}
