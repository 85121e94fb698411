use crate::api::{DistributedLog, DistributedLogConfig, DistributedLogError, RaftOptions};
use crate::auth::Authorizer;
use crate::commitlog::SegmentOptions;
use crate::membership::{Handler, HandlerError, MemberStatus, Membership, MembershipConfig, MembershipError, RPC_ADDR_TAG};
use crate::replica::ElectionStateSnapshot;
use crate::server::{shutdown_signal, CommitLog, LogService, ShutdownHandle, ShutdownSignal};
use crate::transport::StreamLayer;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tonic::transport::ServerTlsConfig;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const BOOTSTRAP_LEADER_TIMEOUT: Duration = Duration::from_secs(10);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AgentConfig {
    pub logger: slog::Logger,
    pub node_name: String,
    /// Gossip address. Its host is also where the RPC listener binds.
    pub bind_addr: SocketAddr,
    /// Port of the shared RPC listener. 0 picks a free one.
    pub rpc_port: u16,
    /// Host other nodes dial for RPCs. Defaults to the host of `bind_addr`.
    pub advertise_host: Option<IpAddr>,
    /// Gossip addresses of existing members.
    pub start_join_addrs: Vec<SocketAddr>,
    pub data_dir: PathBuf,
    pub bootstrap: bool,
    /// Serve client RPCs over TLS. Peer certificates become the subject checked by `authorizer`.
    pub server_tls: Option<ServerTlsConfig>,
    pub authorizer: Arc<dyn Authorizer>,
    pub raft: RaftOptions,
    pub segment: SegmentOptions,
}

impl AgentConfig {
    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr.ip(), self.rpc_port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to bind rpc listener: {0}")]
    Listener(#[from] io::Error),
    #[error("distributed log failure: {0}")]
    Log(#[from] DistributedLogError),
    #[error("membership failure: {0}")]
    Membership(#[from] MembershipError),
}

/// Agent runs every component of one node: the shared RPC listener, the replicated log, the client
/// API and gossip membership.
pub struct Agent {
    logger: slog::Logger,
    config: AgentConfig,
    rpc_addr: SocketAddr,
    log: Arc<DistributedLog>,
    membership: Arc<Membership>,
    running: Mutex<Option<Running>>,
}

struct Running {
    reconcile_shutdown: ShutdownHandle,
    reconcile_task: JoinHandle<()>,
    accept_shutdown: ShutdownHandle,
    accept_task: JoinHandle<()>,
    rpc_shutdown: ShutdownHandle,
    rpc_task: JoinHandle<()>,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Agent, AgentError> {
        let logger = config.logger.new(slog::o!("Node" => config.node_name.clone()));

        let (layer, routes) = StreamLayer::bind(
            logger.new(slog::o!("Component" => "StreamLayer")),
            config.rpc_addr(),
            HANDSHAKE_TIMEOUT,
        )
        .await?;
        let rpc_addr = SocketAddr::new(
            config.advertise_host.unwrap_or_else(|| config.bind_addr.ip()),
            layer.local_addr()?.port(),
        );

        let log = Arc::new(DistributedLog::new(
            &config.data_dir,
            DistributedLogConfig {
                logger: config.logger.clone(),
                node_name: config.node_name.clone(),
                rpc_addr: rpc_addr.to_string(),
                bootstrap: config.bootstrap,
                raft: config.raft.clone(),
                segment: config.segment.clone(),
            },
            routes.consensus,
        )?);

        let (rpc_shutdown, rpc_signal) = shutdown_signal();
        let service = LogService::new(
            logger.new(slog::o!("Component" => "LogService")),
            log.clone() as Arc<dyn CommitLog>,
            config.authorizer.clone(),
        );
        let rpc_task = {
            let logger = logger.clone();
            let tls = config.server_tls.clone();
            let client_incoming = routes.client;
            tokio::spawn(async move {
                if let Err(e) = service.run(client_incoming, tls, rpc_signal).await {
                    slog::error!(logger, "Log service stopped: {}", e);
                }
            })
        };

        // Accept before anything else waits on the network, so a restarted node can vote.
        let (accept_shutdown, accept_signal) = shutdown_signal();
        let accept_task = layer.serve(accept_signal);

        if config.bootstrap {
            if let Err(e) = log.wait_for_leader(BOOTSTRAP_LEADER_TIMEOUT).await {
                slog::warn!(logger, "No leader after bootstrap: {}", e);
            }
        }

        let mut membership_config = MembershipConfig::new(config.node_name.clone(), config.bind_addr);
        membership_config
            .tags
            .insert(RPC_ADDR_TAG.to_string(), rpc_addr.to_string());
        membership_config.start_join_addrs = config.start_join_addrs.clone();
        let handler = Arc::new(ReplicationHandler {
            logger: logger.new(slog::o!("Component" => "ReplicationHandler")),
            log: log.clone(),
        });
        let membership = Arc::new(Membership::new(logger.clone(), handler, membership_config).await?);

        let (reconcile_shutdown, reconcile_signal) = shutdown_signal();
        let reconciler = Reconciler {
            logger: logger.new(slog::o!("Component" => "Reconciler")),
            local_name: config.node_name.clone(),
            log: log.clone(),
            membership: membership.clone(),
        };
        let reconcile_task = tokio::spawn(reconciler.run(reconcile_signal));

        slog::info!(logger, "Agent started. RPC on {:?}, gossip on {:?}", rpc_addr, membership.local_addr());
        Ok(Agent {
            logger,
            config,
            rpc_addr,
            log,
            membership,
            running: Mutex::new(Some(Running {
                reconcile_shutdown,
                reconcile_task,
                accept_shutdown,
                accept_task,
                rpc_shutdown,
                rpc_task,
            })),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Address of the shared RPC listener, as advertised to other nodes.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Gossip address, for other agents' `start_join_addrs`.
    pub fn bind_addr(&self) -> SocketAddr {
        self.membership.local_addr()
    }

    pub fn log(&self) -> &DistributedLog {
        &self.log
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Stops the client API and the listener, then consensus, then leaves the cluster, then closes
    /// storage. Every step runs even if an earlier one failed; the first failure is returned. Safe
    /// to call repeatedly.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let running = match self.running.lock().await.take() {
            Some(running) => running,
            None => return Ok(()),
        };
        slog::info!(self.logger, "Shutting down.");

        running.reconcile_shutdown.shutdown();
        await_task(&self.logger, "reconcile", running.reconcile_task).await;

        running.rpc_shutdown.shutdown();
        running.accept_shutdown.shutdown();
        await_task(&self.logger, "accept", running.accept_task).await;
        await_task(&self.logger, "log service", running.rpc_task).await;

        self.log.stop_consensus().await;

        let mut first_error = None;
        keep_first_error(&self.logger, "leave", self.membership.leave().await, &mut first_error);
        keep_first_error(&self.logger, "close storage", self.log.close_storage(), &mut first_error);

        match first_error {
            None => {
                slog::info!(self.logger, "Shut down.");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }
}

fn keep_first_error<E: Into<AgentError>>(
    logger: &slog::Logger,
    step: &str,
    result: Result<(), E>,
    first_error: &mut Option<AgentError>,
) {
    if let Err(e) = result {
        let e = e.into();
        slog::error!(logger, "Shutdown step failed"; "step" => step, "error" => %e);
        if first_error.is_none() {
            *first_error = Some(e);
        }
    }
}

async fn await_task(logger: &slog::Logger, name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        slog::warn!(logger, "Task failed"; "task" => name, "error" => ?e);
    }
}

/// Turns membership events into voter changes. Only the leader can make those, so followers let
/// the events pass and the leader's `Reconciler` picks up whatever it missed.
struct ReplicationHandler {
    logger: slog::Logger,
    log: Arc<DistributedLog>,
}

impl ReplicationHandler {
    fn filter(&self, result: Result<(), DistributedLogError>) -> Result<(), HandlerError> {
        match result {
            Ok(()) => Ok(()),
            Err(DistributedLogError::NotLeader { .. }) | Err(DistributedLogError::NoLeader) => {
                slog::debug!(self.logger, "Not the leader, skipping voter change.");
                Ok(())
            }
            Err(e) => Err(Box::new(e)),
        }
    }
}

#[async_trait::async_trait]
impl Handler for ReplicationHandler {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<(), HandlerError> {
        self.filter(self.log.join(name, rpc_addr).await)
    }

    async fn leave(&self, name: &str) -> Result<(), HandlerError> {
        self.filter(self.log.leave(name).await)
    }
}

/// Reconciler makes the voter set follow gossip while this node leads: alive members that aren't
/// voters are added, voters gossip saw leave or fail are removed.
struct Reconciler {
    logger: slog::Logger,
    local_name: String,
    log: Arc<DistributedLog>,
    membership: Arc<Membership>,
}

impl Reconciler {
    async fn run(self, mut shutdown: ShutdownSignal) {
        let mut election_state = self.log.election_state();
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                state = election_state.next() => match state {
                    Some(ElectionStateSnapshot::Leader) => self.reconcile().await,
                    Some(_) => {}
                    None => break,
                },
                _ = interval.tick() => {
                    if self.log.is_leader() {
                        self.reconcile().await;
                    }
                }
            }
        }
    }

    async fn reconcile(&self) {
        let voters: HashSet<String> = match self.log.servers().await {
            Ok(servers) => servers.into_iter().map(|server| server.id).collect(),
            Err(e) => {
                slog::warn!(self.logger, "Failed to list voters: {}", e);
                return;
            }
        };

        for member in self.membership.members() {
            if member.name == self.local_name {
                continue;
            }
            let is_voter = voters.contains(&member.name);
            let result = match (member.status, member.rpc_addr()) {
                (MemberStatus::Alive, Some(rpc_addr)) if !is_voter => {
                    slog::info!(self.logger, "Adding voter {} at {}", member.name, rpc_addr);
                    self.log.join(&member.name, rpc_addr).await
                }
                (MemberStatus::Left, _) | (MemberStatus::Failed, _) if is_voter => {
                    slog::info!(self.logger, "Removing voter {}", member.name);
                    self.log.leave(&member.name).await
                }
                _ => Ok(()),
            };

            if let Err(e) = result {
                slog::warn!(self.logger, "Voter change failed"; "member" => &member.name, "error" => %e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::commitlog::Record;

    fn config(data_dir: PathBuf) -> AgentConfig {
        AgentConfig {
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            node_name: "solo".to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            rpc_port: 0,
            advertise_host: None,
            start_join_addrs: Vec::new(),
            data_dir,
            bootstrap: true,
            server_tls: None,
            authorizer: Arc::new(AllowAll),
            raft: RaftOptions::default(),
            segment: SegmentOptions::default(),
        }
    }

    #[test]
    fn rpc_addr_uses_bind_host() {
        let mut config = config(PathBuf::from("/unused"));
        config.bind_addr = "10.1.2.3:8401".parse().unwrap();
        config.rpc_port = 8400;

        assert_eq!(config.rpc_addr(), "10.1.2.3:8400".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn bootstrapped_agent_serves_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(config(dir.path().to_path_buf())).await.unwrap();

        assert_ne!(agent.rpc_addr().port(), 0);
        assert_ne!(agent.bind_addr().port(), 0);
        assert!(agent.log().is_leader());
        assert_eq!(agent.log().append(Record::new("hello")).await.unwrap(), 0);

        let servers = agent.log().servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].rpc_addr, agent.rpc_addr().to_string());

        let members = agent.membership().members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].rpc_addr(), Some(agent.rpc_addr().to_string().as_str()));

        agent.shutdown().await.unwrap();
        agent.shutdown().await.unwrap();
        assert!(agent.log().append(Record::new("late")).await.is_err());
    }

    #[test]
    fn shutdown_errors_keep_the_first_and_continue() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let mut first_error = None;

        keep_first_error::<MembershipError>(&logger, "ok", Ok(()), &mut first_error);
        assert!(first_error.is_none());

        let leave = MembershipError::Io(io::Error::new(io::ErrorKind::Other, "socket gone"));
        keep_first_error(&logger, "leave", Err(leave), &mut first_error);
        keep_first_error(&logger, "close storage", Err(DistributedLogError::NoLeader), &mut first_error);

        match first_error {
            Some(AgentError::Membership(MembershipError::Io(e))) => assert_eq!(e.to_string(), "socket gone"),
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_closes_storage_when_membership_already_left() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(config(dir.path().to_path_buf())).await.unwrap();
        agent.log().append(Record::new("hello")).await.unwrap();

        agent.membership().leave().await.unwrap();
        agent.shutdown().await.unwrap();

        assert!(agent.log().read(0).is_err());
    }
}
