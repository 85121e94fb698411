//! This mod is meant to hold most of the code for the library's client-facing API.
mod distributed_log;
mod options;
mod state_machine;

pub use distributed_log::DistributedLog;
pub use distributed_log::DistributedLogConfig;
pub use distributed_log::DistributedLogError;
pub use distributed_log::LeaderInfo;
pub use distributed_log::ServerInfo;
pub use options::RaftOptions;
