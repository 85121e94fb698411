use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotChunk, ProtoInstallSnapshotResult,
    ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::transport::RaftDialer;
use futures::Stream;
use tokio::time::Duration;
use tonic::codegen::http::uri;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Status;

/// RaftClient calls the raft RPCs of one peer. Connections are tagged as raft traffic so the peer's
/// shared listener routes them to its raft server.
#[derive(Clone)]
pub(crate) struct RaftClient {
    inner: GrpcRaftClient<Channel>,
}

impl RaftClient {
    pub(crate) async fn connect(addr: String, connect_timeout: Duration) -> Result<Self, ConnectError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))?;

        let dialer = RaftDialer::new(addr);
        let connection = tokio::time::timeout(
            connect_timeout,
            endpoint.connect_with_connector(tower::service_fn(move |_: Uri| dialer.clone().dial())),
        )
        .await
        .map_err(|_| ConnectError::Timeout)??;

        Ok(RaftClient {
            inner: GrpcRaftClient::new(connection),
        })
    }

    pub(crate) async fn request_vote(&mut self, request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        self.inner.request_vote(request).await.map(|r| r.into_inner())
    }

    pub(crate) async fn append_entries(
        &mut self,
        request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        self.inner.append_entries(request).await.map(|r| r.into_inner())
    }

    pub(crate) async fn install_snapshot<S>(&mut self, chunks: S) -> Result<ProtoInstallSnapshotResult, Status>
    where
        S: Stream<Item = ProtoInstallSnapshotChunk> + Send + Sync + 'static,
    {
        self.inner.install_snapshot(chunks).await.map(|r| r.into_inner())
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectError {
    #[error("invalid peer address: {0}")]
    InvalidUri(#[from] uri::InvalidUri),
    #[error("failed to connect: {0}")]
    ConnectFailure(#[from] tonic::transport::Error),
    #[error("timed out connecting")]
    Timeout,
}
