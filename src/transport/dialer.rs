use crate::transport::RAFT_RPC;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// RaftDialer opens raft connections to a peer's shared listener. The first byte written tags the
/// connection so the peer routes it to its raft server instead of the client API.
#[derive(Clone, Debug)]
pub(crate) struct RaftDialer {
    addr: String,
}

impl RaftDialer {
    pub(crate) fn new(addr: String) -> Self {
        RaftDialer { addr }
    }

    pub(crate) async fn dial(self) -> std::io::Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&[RAFT_RPC]).await?;
        Ok(stream)
    }
}
