mod cluster;
mod election;
mod local_state;
mod peer_client;
#[allow(clippy::module_inception)]
mod replica;
mod replica_api;
mod replica_wiring;
mod snapshot;
mod state_machine;
mod write_ahead_log;

pub(crate) use cluster::ReplicaId;
pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use election::TimerEvent;
pub(crate) use local_state::Term;
pub(crate) use replica::Replica;
pub(crate) use replica_api::*;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaWiringConfig;
pub(crate) use snapshot::SnapshotMeta;
pub(crate) use snapshot::SnapshotStore;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineError;
pub(crate) use write_ahead_log::Index;
