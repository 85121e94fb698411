mod dialer;
mod stream_layer;

pub(crate) use dialer::RaftDialer;
pub use stream_layer::Incoming;
pub use stream_layer::MuxStream;
pub use stream_layer::Routes;
pub use stream_layer::StreamLayer;
pub use stream_layer::RAFT_RPC;
