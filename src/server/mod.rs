mod log_service;
mod raft_server;
mod shutdown;

pub use log_service::CommitLog;
pub use log_service::LogService;
pub(crate) use raft_server::RaftRpcServer;
pub use shutdown::shutdown_signal;
pub use shutdown::ShutdownHandle;
pub use shutdown::ShutdownSignal;
