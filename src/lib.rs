mod agent;
mod api;
mod auth;
mod commitlog;
mod membership;
mod replica;
mod server;
mod transport;
mod grpc {
    include!("../generated/raft.rs");
}
mod logapi {
    include!("../generated/logapi.rs");
}
mod gossip {
    include!("../generated/gossip.rs");
}

mod actor;

pub use agent::Agent;
pub use agent::AgentConfig;
pub use agent::AgentError;
pub use api::DistributedLog;
pub use api::DistributedLogConfig;
pub use api::DistributedLogError;
pub use api::LeaderInfo;
pub use api::RaftOptions;
pub use api::ServerInfo;
pub use auth::AclAuthorizer;
pub use auth::AllowAll;
pub use auth::AuthError;
pub use auth::Authorizer;
pub use auth::PolicyError;
pub use auth::CONSUME_ACTION;
pub use auth::OBJECT_WILDCARD;
pub use auth::PRODUCE_ACTION;
pub use commitlog::CommitLogError;
pub use commitlog::Log;
pub use commitlog::LogReader;
pub use commitlog::Record;
pub use commitlog::SegmentConfig;
pub use commitlog::SegmentOptions;
pub use logapi::log_client::LogClient;
pub use logapi::ConsumeRequest;
pub use logapi::ConsumeResponse;
pub use logapi::GetServersRequest;
pub use logapi::GetServersResponse;
pub use logapi::ProduceRequest;
pub use logapi::ProduceResponse;
pub use logapi::Record as WireRecord;
pub use logapi::Server as WireServer;
pub use membership::Handler;
pub use membership::HandlerError;
pub use membership::Member;
pub use membership::MemberStatus;
pub use membership::Membership;
pub use membership::MembershipConfig;
pub use membership::MembershipError;
pub use membership::MembershipEvent;
pub use membership::RPC_ADDR_TAG;
pub use server::shutdown_signal;
pub use server::CommitLog;
pub use server::LogService;
pub use server::ShutdownHandle;
pub use server::ShutdownSignal;
pub use transport::Incoming;
pub use transport::MuxStream;
pub use transport::Routes;
pub use transport::StreamLayer;
pub use transport::RAFT_RPC;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
