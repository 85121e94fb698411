use futures::channel::mpsc;
use futures::{SinkExt, Stream};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tonic::transport::server::Connected;

/// First byte of every raft connection. Client connections start with either a TLS record (0x16)
/// or the HTTP/2 preface ("PRI"), so they can never be mistaken for raft traffic.
pub const RAFT_RPC: u8 = 1;

const ROUTE_QUEUE_SIZE: usize = 64;

/// StreamLayer owns the node's single listener and demultiplexes accepted connections between the
/// raft server and the client API server.
pub struct StreamLayer {
    logger: slog::Logger,
    listener: TcpListener,
    handshake_timeout: Duration,
    consensus_tx: mpsc::Sender<MuxStream>,
    client_tx: mpsc::Sender<MuxStream>,
}

/// The two connection streams fed by a `StreamLayer`. Each ends once the accept loop has stopped.
pub struct Routes {
    pub consensus: Incoming,
    pub client: Incoming,
}

impl StreamLayer {
    pub async fn bind(
        logger: slog::Logger,
        addr: SocketAddr,
        handshake_timeout: Duration,
    ) -> io::Result<(StreamLayer, Routes)> {
        let listener = TcpListener::bind(addr).await?;
        let (consensus_tx, consensus_rx) = mpsc::channel(ROUTE_QUEUE_SIZE);
        let (client_tx, client_rx) = mpsc::channel(ROUTE_QUEUE_SIZE);

        let layer = StreamLayer {
            logger: logger.new(slog::o!("Component" => "StreamLayer")),
            listener,
            handshake_timeout,
            consensus_tx,
            client_tx,
        };
        let routes = Routes {
            consensus: Incoming { rx: consensus_rx },
            client: Incoming { rx: client_rx },
        };

        Ok((layer, routes))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawns the accept loop. It runs until `shutdown` resolves, after which both `Incoming`
    /// streams end as soon as in-flight handshakes are done.
    pub fn serve<F>(self, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.accept_loop(shutdown))
    }

    async fn accept_loop<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::pin!(shutdown);
        slog::info!(self.logger, "Accepting connections on {:?}", self.listener.local_addr());

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    let logger = self.logger.new(slog::o!("Remote" => remote_addr.to_string()));
                    tokio::spawn(route_connection(
                        logger,
                        stream,
                        self.handshake_timeout,
                        self.consensus_tx.clone(),
                        self.client_tx.clone(),
                    ));
                }
                Err(e) => {
                    // Usually fd exhaustion. Back off instead of spinning.
                    slog::warn!(self.logger, "Failed to accept connection: {:?}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        slog::info!(self.logger, "Accept loop has exited.");
    }
}

async fn route_connection(
    logger: slog::Logger,
    stream: TcpStream,
    handshake_timeout: Duration,
    consensus_tx: mpsc::Sender<MuxStream>,
    client_tx: mpsc::Sender<MuxStream>,
) {
    match tokio::time::timeout(handshake_timeout, classify(stream)).await {
        Ok(Ok(Some(Route::Consensus(stream)))) => forward(&logger, consensus_tx, stream).await,
        Ok(Ok(Some(Route::Client(stream)))) => forward(&logger, client_tx, stream).await,
        Ok(Ok(None)) => slog::debug!(logger, "Connection closed before sending anything"),
        Ok(Err(e)) => slog::debug!(logger, "Failed to read first byte: {:?}", e),
        Err(_) => slog::debug!(logger, "Timed out waiting for first byte"),
    }
}

enum Route {
    Consensus(MuxStream),
    Client(MuxStream),
}

async fn classify(mut stream: TcpStream) -> io::Result<Option<Route>> {
    let mut first = [0u8; 1];
    if stream.peek(&mut first).await? == 0 {
        return Ok(None);
    }

    if first[0] == RAFT_RPC {
        // Consume the tag so the raft server sees a plain HTTP/2 connection.
        stream.read_exact(&mut first).await?;
        Ok(Some(Route::Consensus(MuxStream { inner: stream })))
    } else {
        Ok(Some(Route::Client(MuxStream { inner: stream })))
    }
}

async fn forward(logger: &slog::Logger, mut tx: mpsc::Sender<MuxStream>, stream: MuxStream) {
    if tx.send(stream).await.is_err() {
        slog::debug!(logger, "Server for this connection type has stopped. Dropping connection.");
    }
}

/// Stream of routed connections, in the shape tonic's `serve_with_incoming*` expects.
pub struct Incoming {
    rx: mpsc::Receiver<MuxStream>,
}

impl Stream for Incoming {
    type Item = Result<MuxStream, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx).map(|next| next.map(Ok))
    }
}

/// An accepted connection, after routing.
#[derive(Debug)]
pub struct MuxStream {
    inner: TcpStream,
}

impl Connected for MuxStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr().ok()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RaftDialer;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    async fn start() -> (SocketAddr, Routes, oneshot::Sender<()>, JoinHandle<()>) {
        let (layer, routes) = StreamLayer::bind(logger(), "127.0.0.1:0".parse().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        let addr = layer.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = layer.serve(async move {
            let _ = rx.await;
        });
        (addr, routes, tx, task)
    }

    #[tokio::test]
    async fn raft_connections_are_routed_to_consensus_without_the_tag() {
        let (addr, mut routes, _shutdown, _task) = start().await;

        let mut conn = RaftDialer::new(addr.to_string()).dial().await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        let mut routed = routes.consensus.next().await.unwrap().unwrap();
        let mut buf = [0u8; 5];
        routed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn other_connections_are_routed_to_client_untouched() {
        let (addr, mut routes, _shutdown, _task) = start().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"PRI * HTTP/2.0").await.unwrap();

        let mut routed = routes.client.next().await.unwrap().unwrap();
        let mut buf = [0u8; 3];
        routed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PRI");
    }

    #[tokio::test]
    async fn routes_end_after_shutdown() {
        let (_addr, mut routes, shutdown, task) = start().await;

        shutdown.send(()).unwrap();
        task.await.unwrap();

        assert!(routes.consensus.next().await.is_none());
        assert!(routes.client.next().await.is_none());
    }
}
