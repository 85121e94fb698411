use crate::actor::ActorClient;
use crate::api::options::RaftOptionsValidated;
use crate::api::state_machine::{decode_offset, encode_append, LogStateMachine};
use crate::api::RaftOptions;
use crate::commitlog::{CommitLogError, Log, Record, SegmentConfig, SegmentOptions};
use crate::replica::{
    self, ElectionStateChangeListener, ElectionStateSnapshot, EnqueueForReplicationError,
    EnqueueForReplicationInput, LeaderRedirectInfo, MembershipChange, MembershipChangeError, MembershipChangeInput,
    ReplicaId, ReplicaWiringConfig,
};
use crate::server::{shutdown_signal, CommitLog, RaftRpcServer, ShutdownHandle};
use crate::transport::Incoming;
use std::convert::TryFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub struct DistributedLogConfig {
    pub logger: slog::Logger,
    /// Unique within the cluster. Doubles as the raft replica id.
    pub node_name: String,
    /// Address other nodes reach this node's shared listener at.
    pub rpc_addr: String,
    /// Start a single node cluster if this node has no raft state yet.
    pub bootstrap: bool,
    pub raft: RaftOptions,
    pub segment: SegmentOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub rpc_addr: String,
    pub is_leader: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderInfo {
    pub id: String,
    /// Empty if this node doesn't know the leader's address yet.
    pub rpc_addr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DistributedLogError {
    #[error("not the leader, leader is {} at {:?}", leader.id, leader.rpc_addr)]
    NotLeader { leader: LeaderInfo },
    #[error("no leader elected")]
    NoLeader,
    #[error("timed out waiting for the entry to commit")]
    CommitTimeout,
    #[error("leadership was lost before the entry was applied")]
    LeadershipLost,
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },
    #[error("state machine failed to apply the entry: {0}")]
    Apply(String),
    #[error("refusing to remove the last voter")]
    LastVoter,
    #[error("io failure: {0}")]
    Io(String),
    #[error("commit log failure: {0}")]
    Log(CommitLogError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to start replica: {0}")]
    Setup(String),
    #[error("replica has exited")]
    ReplicaExited,
}

impl From<CommitLogError> for DistributedLogError {
    fn from(e: CommitLogError) -> Self {
        match e {
            CommitLogError::OffsetOutOfRange { offset } => DistributedLogError::OffsetOutOfRange { offset },
            other => DistributedLogError::Log(other),
        }
    }
}

impl From<LeaderRedirectInfo> for LeaderInfo {
    fn from(info: LeaderRedirectInfo) -> Self {
        LeaderInfo {
            id: info.replica_id.into_inner(),
            rpc_addr: info.addr,
        }
    }
}

impl From<EnqueueForReplicationError> for DistributedLogError {
    fn from(e: EnqueueForReplicationError) -> Self {
        match e {
            EnqueueForReplicationError::LeaderRedirect(info) => DistributedLogError::NotLeader { leader: info.into() },
            EnqueueForReplicationError::NoLeader => DistributedLogError::NoLeader,
            EnqueueForReplicationError::LeadershipLost => DistributedLogError::LeadershipLost,
            EnqueueForReplicationError::LocalIoError(message) => DistributedLogError::Io(message),
            EnqueueForReplicationError::StateMachine(message) => DistributedLogError::Apply(message),
            EnqueueForReplicationError::ActorExited => DistributedLogError::ReplicaExited,
        }
    }
}

impl From<MembershipChangeError> for DistributedLogError {
    fn from(e: MembershipChangeError) -> Self {
        match e {
            MembershipChangeError::LeaderRedirect(info) => DistributedLogError::NotLeader { leader: info.into() },
            MembershipChangeError::NoLeader => DistributedLogError::NoLeader,
            MembershipChangeError::LeadershipLost => DistributedLogError::LeadershipLost,
            MembershipChangeError::LastVoter => DistributedLogError::LastVoter,
            MembershipChangeError::LocalIoError(message) => DistributedLogError::Io(message),
            MembershipChangeError::ActorExited => DistributedLogError::ReplicaExited,
        }
    }
}

/// DistributedLog is a commit log replicated with raft. Appends go through the leader and return
/// once the record is committed and applied locally. Reads are served from the local copy and may
/// lag behind the leader.
pub struct DistributedLog {
    logger: slog::Logger,
    log: Arc<Log>,
    commit_timeout: Duration,
    election_state: ElectionStateChangeListener,
    running: Mutex<Option<Running>>,
}

struct Running {
    actor_client: ActorClient,
    actor_task: JoinHandle<()>,
    raft_server_shutdown: ShutdownHandle,
    raft_server_task: JoinHandle<()>,
}

impl DistributedLog {
    /// Opens `data_dir/log` and `data_dir/raft`, starts the replica and serves raft RPCs on
    /// `consensus`. Must be called within a tokio runtime.
    pub fn new(
        data_dir: impl AsRef<Path>,
        config: DistributedLogConfig,
        consensus: Incoming,
    ) -> Result<Self, DistributedLogError> {
        let raft_options = RaftOptionsValidated::try_from(config.raft).map_err(DistributedLogError::InvalidConfig)?;
        let segment_config = SegmentConfig::try_from(config.segment).map_err(DistributedLogError::InvalidConfig)?;
        let logger = config.logger.new(slog::o!("Node" => config.node_name.clone()));
        let data_dir = data_dir.as_ref();

        let log = Arc::new(Log::open(data_dir.join("log"), segment_config)?);
        let state_machine = LogStateMachine::new(
            logger.new(slog::o!("Component" => "LogStateMachine")),
            log.clone(),
            segment_config.initial_offset,
        );

        let wired = replica::create_replica(ReplicaWiringConfig {
            logger: logger.new(slog::o!("Component" => "Replica")),
            my_replica_id: ReplicaId::new(config.node_name),
            my_addr: config.rpc_addr,
            raft_dir: data_dir.join("raft"),
            segment_config,
            state_machine: Box::new(state_machine),
            bootstrap: config.bootstrap,
            leader_heartbeat_duration: raft_options.leader_heartbeat_duration,
            follower_min_timeout: raft_options.follower_min_timeout,
            follower_max_timeout: raft_options.follower_max_timeout,
            append_entries_timeout: raft_options.leader_append_entries_timeout,
            max_entries_per_append: raft_options.max_entries_per_append,
            snapshot_threshold: raft_options.snapshot_threshold,
        })
        .map_err(|e| DistributedLogError::Setup(e.to_string()))?;

        let (raft_server_shutdown, shutdown_signal) = shutdown_signal();
        let raft_server = RaftRpcServer::new(
            logger.new(slog::o!("Component" => "RaftRpcServer")),
            wired.actor_client.weak(),
            wired.snapshot_store.clone(),
        );
        let raft_server_task = tokio::spawn(raft_server.run(consensus, shutdown_signal));

        Ok(DistributedLog {
            logger,
            log,
            commit_timeout: raft_options.commit_timeout,
            election_state: wired.election_state_listener,
            running: Mutex::new(Some(Running {
                actor_client: wired.actor_client,
                actor_task: wired.actor_task,
                raft_server_shutdown,
                raft_server_task,
            })),
        })
    }

    /// Replicates `record` and returns the offset it was assigned.
    pub async fn append(&self, record: Record) -> Result<u64, DistributedLogError> {
        let data = encode_append(&record)?;
        let actor_client = self.actor_client().await?;

        let output = tokio::time::timeout(
            self.commit_timeout,
            actor_client.enqueue_for_replication(EnqueueForReplicationInput { data }),
        )
        .await
        .map_err(|_| DistributedLogError::CommitTimeout)??;

        decode_offset(&output.response).ok_or_else(|| {
            DistributedLogError::Apply(format!("malformed append output at index {:?}", output.index))
        })
    }

    pub fn read(&self, offset: u64) -> Result<Record, DistributedLogError> {
        Ok(self.log.read(offset)?)
    }

    /// Adds `name` as a voter. Succeeds right away if it's already one at `rpc_addr`.
    pub async fn join(&self, name: &str, rpc_addr: &str) -> Result<(), DistributedLogError> {
        self.change_membership(MembershipChange::AddVoter {
            replica_id: ReplicaId::new(name),
            addr: rpc_addr.to_string(),
        })
        .await
    }

    /// Removes `name` from the voters. Succeeds right away if it isn't one.
    pub async fn leave(&self, name: &str) -> Result<(), DistributedLogError> {
        self.change_membership(MembershipChange::RemoveVoter {
            replica_id: ReplicaId::new(name),
        })
        .await
    }

    async fn change_membership(&self, change: MembershipChange) -> Result<(), DistributedLogError> {
        slog::info!(self.logger, "Requesting membership change {:?}", change);
        let actor_client = self.actor_client().await?;

        tokio::time::timeout(
            self.commit_timeout,
            actor_client.change_membership(MembershipChangeInput { change }),
        )
        .await
        .map_err(|_| DistributedLogError::CommitTimeout)??;

        Ok(())
    }

    /// Resolves once any node, this one included, is known to be leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<(), DistributedLogError> {
        let mut listener = self.election_state.clone();
        match tokio::time::timeout(timeout, listener.wait_for(ElectionStateSnapshot::has_leader)).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(DistributedLogError::ReplicaExited),
            Err(_) => Err(DistributedLogError::NoLeader),
        }
    }

    /// Voters of the latest configuration this node knows of.
    pub async fn servers(&self) -> Result<Vec<ServerInfo>, DistributedLogError> {
        let info = self
            .actor_client()
            .await?
            .cluster_info()
            .await
            .map_err(|_| DistributedLogError::ReplicaExited)?;

        let leader_id = info.leader_id;
        Ok(info
            .voters
            .into_iter()
            .map(|(id, rpc_addr)| ServerInfo {
                is_leader: leader_id.as_ref() == Some(&id),
                id: id.into_inner(),
                rpc_addr,
            })
            .collect())
    }

    pub fn is_leader(&self) -> bool {
        self.election_state.current() == ElectionStateSnapshot::Leader
    }

    pub(crate) fn election_state(&self) -> ElectionStateChangeListener {
        self.election_state.clone()
    }

    /// Stops the raft server and the replica, then closes the local log. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), DistributedLogError> {
        self.stop_consensus().await;
        self.close_storage()
    }

    /// Stops the raft server, then the replica, and waits for both.
    pub(crate) async fn stop_consensus(&self) {
        let running = match self.running.lock().await.take() {
            Some(running) => running,
            None => return,
        };

        running.raft_server_shutdown.shutdown();
        if let Err(e) = running.raft_server_task.await {
            slog::warn!(self.logger, "Raft server task failed: {:?}", e);
        }

        // The replica exits once its last strong client is gone.
        drop(running.actor_client);
        if let Err(e) = running.actor_task.await {
            slog::warn!(self.logger, "Replica task failed: {:?}", e);
        }
        slog::info!(self.logger, "Consensus stopped.");
    }

    pub(crate) fn close_storage(&self) -> Result<(), DistributedLogError> {
        self.log.close()?;
        Ok(())
    }

    async fn actor_client(&self) -> Result<ActorClient, DistributedLogError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.actor_client.clone())
            .ok_or(DistributedLogError::ReplicaExited)
    }
}

#[async_trait::async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> Result<u64, DistributedLogError> {
        DistributedLog::append(self, record).await
    }

    fn read(&self, offset: u64) -> Result<Record, DistributedLogError> {
        DistributedLog::read(self, offset)
    }

    async fn servers(&self) -> Result<Vec<ServerInfo>, DistributedLogError> {
        DistributedLog::servers(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamLayer;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    async fn single_node(dir: &Path) -> (DistributedLog, tokio::task::JoinHandle<()>, ShutdownHandle) {
        let (layer, routes) = StreamLayer::bind(logger(), "127.0.0.1:0".parse().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        let addr = layer.local_addr().unwrap();
        let (accept_shutdown, accept_signal) = shutdown_signal();
        let accept_task = layer.serve(accept_signal);

        let log = DistributedLog::new(
            dir,
            DistributedLogConfig {
                logger: logger(),
                node_name: "solo".to_string(),
                rpc_addr: addr.to_string(),
                bootstrap: true,
                raft: RaftOptions::default(),
                segment: SegmentOptions::default(),
            },
            routes.consensus,
        )
        .unwrap();

        (log, accept_task, accept_shutdown)
    }

    #[tokio::test]
    async fn bootstrapped_node_appends_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _accept_task, _accept_shutdown) = single_node(dir.path()).await;

        log.wait_for_leader(Duration::from_secs(3)).await.unwrap();
        assert!(log.is_leader());

        for expected in 0..3u64 {
            let offset = log.append(Record::new(format!("hello-{}", expected))).await.unwrap();
            assert_eq!(offset, expected);
        }
        assert_eq!(&log.read(2).unwrap().value[..], b"hello-2");

        match log.read(3) {
            Err(DistributedLogError::OffsetOutOfRange { offset }) => assert_eq!(offset, 3),
            other => panic!("Unexpected read result: {:?}", other),
        }

        let servers = log.servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "solo");
        assert!(servers[0].is_leader);

        log.close().await.unwrap();
        log.close().await.unwrap();
        assert!(matches!(
            log.append(Record::new("late")).await,
            Err(DistributedLogError::ReplicaExited)
        ));
    }

    #[tokio::test]
    async fn removing_last_voter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _accept_task, _accept_shutdown) = single_node(dir.path()).await;
        log.wait_for_leader(Duration::from_secs(3)).await.unwrap();

        assert!(matches!(log.leave("solo").await, Err(DistributedLogError::LastVoter)));
        // Absent voters are a no-op.
        log.leave("nobody").await.unwrap();

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, _accept_task, _accept_shutdown) = single_node(dir.path()).await;
            log.wait_for_leader(Duration::from_secs(3)).await.unwrap();
            log.append(Record::new("first")).await.unwrap();
            log.append(Record::new("second")).await.unwrap();
            log.close().await.unwrap();
        }

        let (log, _accept_task, _accept_shutdown) = single_node(dir.path()).await;
        log.wait_for_leader(Duration::from_secs(3)).await.unwrap();
        let offset = log.append(Record::new("third")).await.unwrap();
        assert_eq!(offset, 2);
        assert_eq!(&log.read(0).unwrap().value[..], b"first");

        log.close().await.unwrap();
    }
}
