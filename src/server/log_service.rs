use crate::api::{DistributedLogError, ServerInfo};
use crate::auth::{AuthError, Authorizer, CONSUME_ACTION, OBJECT_WILDCARD, PRODUCE_ACTION};
use crate::commitlog::Record;
use crate::logapi;
use crate::logapi::log_server::{Log, LogServer};
use crate::logapi::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, ProduceRequest, ProduceResponse,
};
use crate::server::ShutdownSignal;
use crate::transport::Incoming;
use futures::channel::mpsc;
use futures::SinkExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};

const STREAM_BUFFER: usize = 16;

/// CommitLog is what the client API needs from the log it serves.
#[async_trait::async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> Result<u64, DistributedLogError>;

    fn read(&self, offset: u64) -> Result<Record, DistributedLogError>;

    async fn servers(&self) -> Result<Vec<ServerInfo>, DistributedLogError>;
}

/// LogService is the client facing gRPC API: produce and consume records, discover servers.
#[derive(Clone)]
pub struct LogService {
    logger: slog::Logger,
    log: Arc<dyn CommitLog>,
    authorizer: Arc<dyn Authorizer>,
    consume_poll_interval: Duration,
    // Flips to true once graceful shutdown starts, so open streams can end.
    stopping: watch::Receiver<bool>,
}

impl LogService {
    pub fn new(logger: slog::Logger, log: Arc<dyn CommitLog>, authorizer: Arc<dyn Authorizer>) -> Self {
        let (_, stopping) = watch::channel(false);
        LogService {
            logger,
            log,
            authorizer,
            consume_poll_interval: Duration::from_millis(50),
            stopping,
        }
    }

    /// How long `ConsumeStream` waits before looking for a record that wasn't there yet.
    pub fn with_consume_poll_interval(mut self, interval: Duration) -> Self {
        self.consume_poll_interval = interval;
        self
    }

    /// Serves client connections until `shutdown_signal` resolves. With `tls`, connections are
    /// TLS-terminated and the subject is taken from the client certificate.
    pub async fn run(
        mut self,
        incoming: Incoming,
        tls: Option<ServerTlsConfig>,
        shutdown_signal: ShutdownSignal,
    ) -> Result<(), tonic::transport::Error> {
        let logger = self.logger.clone();
        let (stopping_tx, stopping_rx) = watch::channel(false);
        self.stopping = stopping_rx;

        let mut builder = Server::builder();
        if let Some(tls) = tls {
            builder = builder.tls_config(tls)?;
        }

        slog::info!(logger, "Serving client RPCs");
        let result = builder
            .add_service(LogServer::new(self))
            .serve_with_incoming_shutdown(incoming, async move {
                shutdown_signal.await;
                let _ = stopping_tx.send(true);
            })
            .await;
        slog::info!(logger, "Server run() has exited: {:?}", result);

        result
    }

    fn authorize<T>(&self, request: &Request<T>, action: &str) -> Result<(), Status> {
        let subject = subject(request)?;
        self.authorizer
            .authorize(&subject, OBJECT_WILDCARD, action)
            .map_err(status_from_auth)
    }
}

#[async_trait::async_trait]
impl Log for LogService {
    async fn produce(&self, request: Request<ProduceRequest>) -> Result<Response<ProduceResponse>, Status> {
        self.authorize(&request, PRODUCE_ACTION)?;

        let offset = produce(self.log.as_ref(), request.into_inner()).await?;
        Ok(Response::new(ProduceResponse { offset }))
    }

    async fn consume(&self, request: Request<ConsumeRequest>) -> Result<Response<ConsumeResponse>, Status> {
        self.authorize(&request, CONSUME_ACTION)?;

        let record = self.log.read(request.into_inner().offset).map_err(status_from)?;
        Ok(Response::new(ConsumeResponse {
            record: Some(record.into()),
        }))
    }

    type ConsumeStreamStream = mpsc::Receiver<Result<ConsumeResponse, Status>>;

    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        self.authorize(&request, CONSUME_ACTION)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(consume_stream(
            self.logger.clone(),
            self.log.clone(),
            request.into_inner().offset,
            self.consume_poll_interval,
            self.stopping.clone(),
            tx,
        ));

        Ok(Response::new(rx))
    }

    type ProduceStreamStream = mpsc::Receiver<Result<ProduceResponse, Status>>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        self.authorize(&request, PRODUCE_ACTION)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(produce_stream(
            self.log.clone(),
            request.into_inner(),
            self.stopping.clone(),
            tx,
        ));

        Ok(Response::new(rx))
    }

    async fn get_servers(&self, _request: Request<GetServersRequest>) -> Result<Response<GetServersResponse>, Status> {
        let servers = self.log.servers().await.map_err(status_from)?;
        Ok(Response::new(GetServersResponse {
            servers: servers
                .into_iter()
                .map(|server| logapi::Server {
                    id: server.id,
                    rpc_addr: server.rpc_addr,
                    is_leader: server.is_leader,
                })
                .collect(),
        }))
    }
}

async fn produce(log: &dyn CommitLog, request: ProduceRequest) -> Result<u64, Status> {
    let record = request
        .record
        .ok_or_else(|| Status::invalid_argument("ProduceRequest is missing its record"))?;

    log.append(Record::from(record)).await.map_err(status_from)
}

/// Sends records from `offset` on, waiting for new ones, until the client goes away or the server
/// stops.
async fn consume_stream(
    logger: slog::Logger,
    log: Arc<dyn CommitLog>,
    mut offset: u64,
    poll_interval: Duration,
    mut stopping: watch::Receiver<bool>,
    mut tx: mpsc::Sender<Result<ConsumeResponse, Status>>,
) {
    loop {
        if *stopping.borrow() {
            return;
        }

        match log.read(offset) {
            Ok(record) => {
                let response = ConsumeResponse {
                    record: Some(record.into()),
                };
                if tx.send(Ok(response)).await.is_err() {
                    slog::debug!(logger, "Consumer disconnected at offset {}", offset);
                    return;
                }
                offset += 1;
            }
            Err(DistributedLogError::OffsetOutOfRange { .. }) => {
                if tx.is_closed() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = stopping.changed() => return,
                }
            }
            Err(e) => {
                let _ = tx.send(Err(status_from(e))).await;
                return;
            }
        }
    }
}

async fn produce_stream(
    log: Arc<dyn CommitLog>,
    mut requests: Streaming<ProduceRequest>,
    mut stopping: watch::Receiver<bool>,
    mut tx: mpsc::Sender<Result<ProduceResponse, Status>>,
) {
    loop {
        let next = tokio::select! {
            next = requests.message() => next,
            _ = stopping.changed() => return,
        };

        let request = match next {
            Ok(Some(request)) => request,
            // Client finished sending.
            Ok(None) => return,
            Err(status) => {
                let _ = tx.send(Err(status)).await;
                return;
            }
        };

        let reply = produce(log.as_ref(), request)
            .await
            .map(|offset| ProduceResponse { offset });
        let failed = reply.is_err();
        if tx.send(reply).await.is_err() || failed {
            return;
        }
    }
}

/// Common name of the client's certificate. Empty for plaintext connections.
fn subject<T>(request: &Request<T>) -> Result<String, Status> {
    let certs = match request.peer_certs() {
        Some(certs) => certs,
        None => return Ok(String::new()),
    };
    let cert = match certs.first() {
        Some(cert) => cert,
        None => return Ok(String::new()),
    };

    let (_, parsed) = x509_parser::parse_x509_certificate(cert.get_ref())
        .map_err(|e| Status::unauthenticated(format!("unreadable client certificate: {}", e)))?;
    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default();

    Ok(common_name.to_string())
}

fn status_from_auth(e: AuthError) -> Status {
    Status::permission_denied(e.to_string())
}

pub(crate) fn status_from(e: DistributedLogError) -> Status {
    match e {
        DistributedLogError::OffsetOutOfRange { .. } => Status::out_of_range(e.to_string()),
        DistributedLogError::NotLeader { .. } | DistributedLogError::NoLeader | DistributedLogError::LastVoter => {
            Status::failed_precondition(e.to_string())
        }
        DistributedLogError::CommitTimeout => Status::deadline_exceeded(e.to_string()),
        DistributedLogError::LeadershipLost | DistributedLogError::ReplicaExited => Status::unavailable(e.to_string()),
        DistributedLogError::Apply(_)
        | DistributedLogError::Io(_)
        | DistributedLogError::Log(_)
        | DistributedLogError::InvalidConfig(_)
        | DistributedLogError::Setup(_) => Status::internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LeaderInfo;
    use crate::auth::{AclAuthorizer, AllowAll};
    use crate::logapi::log_client::LogClient;
    use crate::server::shutdown_signal;
    use crate::transport::StreamLayer;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tonic::transport::Channel;

    /// In-memory log. Appends fail with NotLeader once `follower` is set.
    #[derive(Default)]
    struct MemoryLog {
        records: Mutex<Vec<Record>>,
        follower: bool,
    }

    #[async_trait::async_trait]
    impl CommitLog for MemoryLog {
        async fn append(&self, mut record: Record) -> Result<u64, DistributedLogError> {
            if self.follower {
                return Err(DistributedLogError::NotLeader {
                    leader: LeaderInfo {
                        id: "leader".to_string(),
                        rpc_addr: "10.0.0.1:8400".to_string(),
                    },
                });
            }
            let mut records = self.records.lock().unwrap();
            record.offset = records.len() as u64;
            records.push(record);
            Ok(records.len() as u64 - 1)
        }

        fn read(&self, offset: u64) -> Result<Record, DistributedLogError> {
            self.records
                .lock()
                .unwrap()
                .get(offset as usize)
                .cloned()
                .ok_or(DistributedLogError::OffsetOutOfRange { offset })
        }

        async fn servers(&self) -> Result<Vec<ServerInfo>, DistributedLogError> {
            Ok(vec![ServerInfo {
                id: "memory".to_string(),
                rpc_addr: "127.0.0.1:1".to_string(),
                is_leader: true,
            }])
        }
    }

    struct TestServer {
        client: LogClient<Channel>,
        log: Arc<MemoryLog>,
        _shutdown: (crate::server::ShutdownHandle, crate::server::ShutdownHandle),
    }

    async fn start(log: MemoryLog, authorizer: Arc<dyn Authorizer>) -> TestServer {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (layer, routes) = StreamLayer::bind(logger.clone(), "127.0.0.1:0".parse().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        let addr: SocketAddr = layer.local_addr().unwrap();
        let (accept_handle, accept_signal) = shutdown_signal();
        layer.serve(accept_signal);

        let log = Arc::new(log);
        let service = LogService::new(logger, log.clone(), authorizer).with_consume_poll_interval(Duration::from_millis(10));
        let (server_handle, server_signal) = shutdown_signal();
        tokio::spawn(service.run(routes.client, None, server_signal));

        let client = LogClient::connect(format!("http://{}", addr)).await.unwrap();
        TestServer {
            client,
            log,
            _shutdown: (accept_handle, server_handle),
        }
    }

    fn produce_request(value: &'static str) -> ProduceRequest {
        ProduceRequest {
            record: Some(logapi::Record {
                value: value.as_bytes().to_vec(),
                offset: 0,
            }),
        }
    }

    #[tokio::test]
    async fn produce_consume() {
        let mut server = start(MemoryLog::default(), Arc::new(AllowAll)).await;

        let produced = server.client.produce(produce_request("hello world")).await.unwrap();
        assert_eq!(produced.into_inner().offset, 0);

        let consumed = server.client.consume(ConsumeRequest { offset: 0 }).await.unwrap();
        let record = consumed.into_inner().record.unwrap();
        assert_eq!(record.value, b"hello world".to_vec());
        assert_eq!(record.offset, 0);
    }

    #[tokio::test]
    async fn consume_past_boundary_is_out_of_range() {
        let mut server = start(MemoryLog::default(), Arc::new(AllowAll)).await;
        server.client.produce(produce_request("only")).await.unwrap();

        let status = server.client.consume(ConsumeRequest { offset: 1 }).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::OutOfRange);
    }

    #[tokio::test]
    async fn produce_stream_replies_in_order() {
        let mut server = start(MemoryLog::default(), Arc::new(AllowAll)).await;

        let requests = futures::stream::iter(vec![produce_request("first"), produce_request("second")]);
        let mut replies = server.client.produce_stream(requests).await.unwrap().into_inner();

        assert_eq!(replies.message().await.unwrap().unwrap().offset, 0);
        assert_eq!(replies.message().await.unwrap().unwrap().offset, 1);
        assert!(replies.message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consume_stream_waits_for_new_records() {
        let mut server = start(MemoryLog::default(), Arc::new(AllowAll)).await;
        server.client.produce(produce_request("first")).await.unwrap();

        let mut stream = server
            .client
            .consume_stream(ConsumeRequest { offset: 0 })
            .await
            .unwrap()
            .into_inner();
        let first = stream.message().await.unwrap().unwrap().record.unwrap();
        assert_eq!(first.value, b"first".to_vec());

        // Nothing at offset 1 yet. Produce it after the stream started waiting.
        let log = server.log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            log.append(Record::new(Bytes::from_static(b"second"))).await.unwrap();
        });

        let second = tokio::time::timeout(Duration::from_secs(2), stream.message())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .record
            .unwrap();
        assert_eq!(second.value, b"second".to_vec());
        assert_eq!(second.offset, 1);
    }

    #[tokio::test]
    async fn unauthorized_subject_is_denied() {
        // Plaintext clients have an empty subject.
        let acl = AclAuthorizer::new().allow("root", OBJECT_WILDCARD, PRODUCE_ACTION);
        let mut server = start(MemoryLog::default(), Arc::new(acl)).await;

        let status = server.client.produce(produce_request("nope")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert_eq!(status.message(), "forbidden: subject , object *, action produce");

        let status = server.client.consume(ConsumeRequest { offset: 0 }).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn follower_redirects_with_leader_address() {
        let log = MemoryLog {
            follower: true,
            ..MemoryLog::default()
        };
        let mut server = start(log, Arc::new(AllowAll)).await;

        let status = server.client.produce(produce_request("redirect me")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert!(status.message().contains("10.0.0.1:8400"));
    }

    #[tokio::test]
    async fn get_servers_lists_log_servers() {
        let mut server = start(MemoryLog::default(), Arc::new(AllowAll)).await;

        let servers = server.client.get_servers(GetServersRequest {}).await.unwrap().into_inner().servers;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "memory");
        assert!(servers[0].is_leader);
    }
}
