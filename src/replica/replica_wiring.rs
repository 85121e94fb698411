use crate::actor::{ActorClient, ReplicaActor};
use crate::commitlog::SegmentConfig;
use crate::replica::cluster::{ClusterConfig, ClusterTracker, ReplicaId};
use crate::replica::election::{ElectionConfig, ElectionState, ElectionStateChangeListener};
use crate::replica::local_state::{DurableLocalState, PersistentLocalState, Term};
use crate::replica::replica::{Replica, ReplicaConfig};
use crate::replica::snapshot::SnapshotStore;
use crate::replica::state_machine::StateMachine;
use crate::replica::write_ahead_log::{EntryKind, Index, WalError, WriteAheadLog, WriteAheadLogEntry};
use std::path::PathBuf;
use std::{cmp, fs, io};
use tokio::task::JoinHandle;
use tokio::time::Duration;

const ACTOR_QUEUE_SIZE: usize = 64;

pub(crate) struct ReplicaWiringConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) my_replica_id: ReplicaId,
    // Address peers reach our raft server at.
    pub(crate) my_addr: String,
    pub(crate) raft_dir: PathBuf,
    pub(crate) segment_config: SegmentConfig,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) bootstrap: bool,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) max_entries_per_append: usize,
    pub(crate) snapshot_threshold: u64,
}

/// Handles to a running replica actor.
pub(crate) struct WiredReplica {
    pub(crate) actor_client: ActorClient,
    pub(crate) election_state_listener: ElectionStateChangeListener,
    pub(crate) snapshot_store: SnapshotStore,
    pub(crate) actor_task: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReplicaSetupError {
    #[error("failed to open durable term/vote state: {0}")]
    LocalState(io::Error),
    #[error("failed to open snapshot store: {0}")]
    Snapshot(io::Error),
    #[error("failed to open write-ahead log: {0}")]
    Wal(#[from] WalError),
    #[error("failed to restore state machine: {0}")]
    StateMachine(String),
}

/// Opens (or creates) everything under `raft_dir` and spawns the replica actor. Must be called
/// within a tokio runtime.
pub(crate) fn create_replica(config: ReplicaWiringConfig) -> Result<WiredReplica, ReplicaSetupError> {
    let logger = config.logger;
    let my_replica_id = config.my_replica_id;

    fs::create_dir_all(&config.raft_dir).map_err(ReplicaSetupError::LocalState)?;
    let mut local_state = DurableLocalState::open(config.raft_dir.join("state"), my_replica_id.clone())
        .map_err(ReplicaSetupError::LocalState)?;
    let snapshot_store =
        SnapshotStore::open(config.raft_dir.join("snapshots")).map_err(ReplicaSetupError::Snapshot)?;
    let mut write_ahead_log = WriteAheadLog::open(
        logger.new(slog::o!("Component" => "WriteAheadLog")),
        &config.raft_dir.join("log"),
        config.segment_config,
    )?;
    let mut state_machine = config.state_machine;

    let mut cluster_tracker = restore_from_disk(
        &logger,
        &my_replica_id,
        &snapshot_store,
        &mut write_ahead_log,
        state_machine.as_mut(),
    )?;

    let bootstrap = config.bootstrap && local_state.is_fresh() && write_ahead_log.latest_entry().is_none();
    if bootstrap {
        bootstrap_cluster(
            &logger,
            &mut local_state,
            &mut write_ahead_log,
            &mut cluster_tracker,
            config.my_addr,
        )?;
    }

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);
    let (election_state, election_state_listener) = ElectionState::new_follower(
        ElectionConfig {
            my_replica_id: my_replica_id.clone(),
            leader_heartbeat_duration: config.leader_heartbeat_duration,
            follower_min_timeout: config.follower_min_timeout,
            follower_max_timeout: config.follower_max_timeout,
        },
        actor_client.weak(),
    );

    let mut replica = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        cluster_tracker,
        local_state: Box::new(local_state),
        election_state,
        write_ahead_log,
        state_machine,
        snapshot_store: snapshot_store.clone(),
        actor_client: actor_client.weak(),
        follower_min_timeout: config.follower_min_timeout,
        append_entries_timeout: config.append_entries_timeout,
        max_entries_per_append: config.max_entries_per_append,
        snapshot_threshold: config.snapshot_threshold,
    });
    if bootstrap {
        // Don't wait out a follower timeout; we're the only voter.
        replica.start_election();
    }

    let replica_actor = ReplicaActor::new(logger, actor_queue_rx, replica);
    let actor_task = tokio::spawn(replica_actor.run_event_loop());

    Ok(WiredReplica {
        actor_client,
        election_state_listener,
        snapshot_store,
        actor_task,
    })
}

/// Brings the state machine back to the latest snapshot (or empty) and rebuilds the
/// configuration history. Entries after the snapshot are re-applied once the commit index is
/// learned again.
fn restore_from_disk(
    logger: &slog::Logger,
    my_replica_id: &ReplicaId,
    snapshot_store: &SnapshotStore,
    write_ahead_log: &mut WriteAheadLog,
    state_machine: &mut dyn StateMachine,
) -> Result<ClusterTracker, ReplicaSetupError> {
    let mut cluster_tracker = match snapshot_store.latest().map_err(ReplicaSetupError::Snapshot)? {
        Some(meta) => {
            let data = snapshot_store.open_data(&meta).map_err(ReplicaSetupError::Snapshot)?;
            state_machine
                .restore(Box::new(data))
                .map_err(|e| ReplicaSetupError::StateMachine(e.to_string()))?;
            write_ahead_log.set_snapshot_boundary(meta.last_included_term, meta.last_included_index);
            slog::info!(logger, "Restored state machine from snapshot through {:?}", meta.last_included_index);

            ClusterTracker::new(my_replica_id.clone(), Some(meta.last_included_index), meta.config)
        }
        None => {
            state_machine
                .restore(Box::new(io::empty()))
                .map_err(|e| ReplicaSetupError::StateMachine(e.to_string()))?;

            ClusterTracker::new(my_replica_id.clone(), None, ClusterConfig::default())
        }
    };

    let latest_index = match write_ahead_log.latest_entry() {
        Some((_, index)) => index,
        None => return Ok(cluster_tracker),
    };
    let after_snapshot = write_ahead_log
        .snapshot_boundary()
        .map(|(_, index)| index.plus(1))
        .unwrap_or_else(Index::start_index);
    let mut index = cmp::max(write_ahead_log.first_index()?, after_snapshot);
    while index <= latest_index {
        let entry = write_ahead_log.read_required(index)?;
        if entry.kind == EntryKind::Configuration {
            let config = ClusterConfig::decode(&entry.data).map_err(WalError::from)?;
            cluster_tracker.set_latest(index, config);
        }
        index = index.plus(1);
    }
    slog::info!(
        logger,
        "Recovered cluster configuration: {:?}",
        cluster_tracker.latest_config()
    );

    Ok(cluster_tracker)
}

/// Seeds a brand new single-voter cluster: term 1 and our own configuration at index 1.
fn bootstrap_cluster(
    logger: &slog::Logger,
    local_state: &mut DurableLocalState,
    write_ahead_log: &mut WriteAheadLog,
    cluster_tracker: &mut ClusterTracker,
    my_addr: String,
) -> Result<(), ReplicaSetupError> {
    let term = Term::new(1);
    local_state
        .store_term_if_increased(term)
        .map_err(ReplicaSetupError::LocalState)?;

    let config = ClusterConfig::single(cluster_tracker.my_replica_id().clone(), my_addr);
    let index = write_ahead_log.append(WriteAheadLogEntry {
        term,
        kind: EntryKind::Configuration,
        data: config.encode(),
    })?;
    cluster_tracker.set_latest(index, config);
    slog::info!(logger, "Bootstrapped new cluster at index {:?}", index);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{ElectionStateSnapshot, EnqueueForReplicationInput};
    use crate::replica::state_machine::StateMachineError;
    use bytes::Bytes;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    /// Keeps applied commands in memory, shared with the test.
    #[derive(Clone, Default)]
    struct VecStateMachine {
        applied: Arc<Mutex<Vec<Bytes>>>,
    }

    impl StateMachine for VecStateMachine {
        fn apply(&mut self, command: Bytes) -> Result<Bytes, StateMachineError> {
            let mut applied = self.applied.lock().unwrap();
            applied.push(command);
            Ok(Bytes::from((applied.len() as u64).to_be_bytes().to_vec()))
        }

        fn snapshot(&mut self) -> Result<Box<dyn Read + Send>, StateMachineError> {
            let applied = self.applied.lock().unwrap();
            let mut buf = Vec::new();
            for command in applied.iter() {
                buf.push(command.len() as u8);
                buf.extend_from_slice(command);
            }
            Ok(Box::new(io::Cursor::new(buf)))
        }

        fn restore(&mut self, mut snapshot: Box<dyn Read + Send>) -> Result<(), StateMachineError> {
            let mut buf = Vec::new();
            snapshot.read_to_end(&mut buf)?;
            let mut applied = self.applied.lock().unwrap();
            applied.clear();
            let mut rest = &buf[..];
            while let Some((len, tail)) = rest.split_first() {
                let (command, tail) = tail.split_at(*len as usize);
                applied.push(Bytes::copy_from_slice(command));
                rest = tail;
            }
            Ok(())
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn config(dir: &std::path::Path, state_machine: VecStateMachine, bootstrap: bool) -> ReplicaWiringConfig {
        ReplicaWiringConfig {
            logger: logger(),
            my_replica_id: ReplicaId::new("solo"),
            my_addr: "127.0.0.1:1".into(),
            raft_dir: dir.to_path_buf(),
            segment_config: SegmentConfig::default(),
            state_machine: Box::new(state_machine),
            bootstrap,
            leader_heartbeat_duration: Duration::from_millis(100),
            follower_min_timeout: Duration::from_millis(500),
            follower_max_timeout: Duration::from_millis(1500),
            append_entries_timeout: Duration::from_millis(300),
            max_entries_per_append: 64,
            snapshot_threshold: 3,
        }
    }

    async fn append(replica: &WiredReplica, data: &'static [u8]) -> u64 {
        let output = replica
            .actor_client
            .enqueue_for_replication(EnqueueForReplicationInput {
                data: Bytes::from_static(data),
            })
            .await
            .unwrap();
        let mut be = [0u8; 8];
        be.copy_from_slice(&output.response);
        u64::from_be_bytes(be)
    }

    #[tokio::test]
    async fn bootstrapped_replica_commits_alone() {
        let dir = tempfile::tempdir().unwrap();
        let state_machine = VecStateMachine::default();
        let replica = create_replica(config(dir.path(), state_machine.clone(), true)).unwrap();

        assert_eq!(replica.election_state_listener.current(), ElectionStateSnapshot::Leader);
        assert_eq!(append(&replica, b"a").await, 1);
        assert_eq!(append(&replica, b"b").await, 2);

        let info = replica.actor_client.cluster_info().await.unwrap();
        assert_eq!(info.leader_id, Some(ReplicaId::new("solo")));
        assert_eq!(info.voters, vec![(ReplicaId::new("solo"), "127.0.0.1:1".to_string())]);
        assert_eq!(state_machine.applied.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn restart_replays_from_snapshot_and_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let replica = create_replica(config(dir.path(), VecStateMachine::default(), true)).unwrap();
            // Snapshot threshold is 3 applied entries, config and no-op included.
            for data in [&b"a"[..], b"b", b"c", b"d"].iter() {
                replica
                    .actor_client
                    .enqueue_for_replication(EnqueueForReplicationInput {
                        data: Bytes::from_static(data),
                    })
                    .await
                    .unwrap();
            }
            let WiredReplica {
                actor_client,
                actor_task,
                ..
            } = replica;
            drop(actor_client);
            actor_task.await.unwrap();
        }

        let state_machine = VecStateMachine::default();
        let replica = create_replica(config(dir.path(), state_machine.clone(), true)).unwrap();

        // Not bootstrapped twice; we become leader again after a timeout and catch up.
        let mut listener = replica.election_state_listener.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            listener.wait_for(|state| *state == ElectionStateSnapshot::Leader),
        )
        .await
        .expect("Restarted replica never became leader")
        .unwrap();
        append(&replica, b"e").await;

        let applied = state_machine.applied.lock().unwrap().clone();
        assert_eq!(
            applied,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
                Bytes::from_static(b"d"),
                Bytes::from_static(b"e"),
            ]
        );
    }

    #[tokio::test]
    async fn fresh_replica_without_bootstrap_waits() {
        let dir = tempfile::tempdir().unwrap();
        let replica = create_replica(config(dir.path(), VecStateMachine::default(), false)).unwrap();

        let err = replica
            .actor_client
            .enqueue_for_replication(EnqueueForReplicationInput {
                data: Bytes::from_static(b"a"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::replica::EnqueueForReplicationError::NoLeader));
        assert!(replica.actor_client.cluster_info().await.unwrap().voters.is_empty());
    }
}
