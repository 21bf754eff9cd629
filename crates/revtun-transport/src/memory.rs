//! In-process transport built on `tokio::io::duplex`
//!
//! Mimics a multiplexed connection without any networking: streams are duplex
//! pipes handed to the peer over a channel, and both ends of a connection
//! share one cancellation token acting as the liveness signal. Streams issued
//! by a connection fail with `ConnectionAborted` once it is closed.

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::{
    TransportConnection, TransportConnector, TransportError, TransportListener, TransportResult,
    TransportStream,
};

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PORT: AtomicU16 = AtomicU16::new(40000);

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// One end of an in-memory stream
pub struct MemoryStream {
    inner: DuplexStream,
    stream_id: u64,
    dead: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl MemoryStream {
    fn new(inner: DuplexStream, stream_id: u64, closed: &CancellationToken) -> Self {
        Self {
            inner,
            stream_id,
            dead: Box::pin(closed.clone().cancelled_owned()),
        }
    }

    fn poll_dead(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        self.dead.as_mut().poll(cx).map(|()| {
            io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
        })
    }
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_dead(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Poll::Ready(e) = self.poll_dead(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for MemoryStream {
    fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

/// One end of an in-memory multiplexed connection
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    connection_id: String,
    local: SocketAddr,
    remote: SocketAddr,
    closed: CancellationToken,
    next_stream_id: Arc<AtomicU64>,
    outgoing: mpsc::UnboundedSender<MemoryStream>,
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<MemoryStream>>>,
}

/// Create two connected ends of one in-memory connection
///
/// The first element plays the dialing client, the second the accepting server.
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let client_addr = loopback(NEXT_PORT.fetch_add(1, Ordering::Relaxed));
    let server_addr = loopback(9999);

    let closed = CancellationToken::new();
    let next_stream_id = Arc::new(AtomicU64::new(0));
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();

    let client = MemoryConnection {
        connection_id: format!("mem-{}", id),
        local: client_addr,
        remote: server_addr,
        closed: closed.clone(),
        next_stream_id: next_stream_id.clone(),
        outgoing: to_server,
        incoming: Arc::new(Mutex::new(from_server)),
    };
    let server = MemoryConnection {
        connection_id: format!("mem-{}", id),
        local: server_addr,
        remote: client_addr,
        closed,
        next_stream_id,
        outgoing: to_client,
        incoming: Arc::new(Mutex::new(from_client)),
    };

    (client, server)
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    type Stream = MemoryStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionError(
                "connection closed".to_string(),
            ));
        }

        let stream_id = self.next_stream_id.fetch_add(4, Ordering::Relaxed);
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);

        self.outgoing
            .send(MemoryStream::new(remote, stream_id, &self.closed))
            .map_err(|_| TransportError::ConnectionError("peer went away".to_string()))?;

        Ok(MemoryStream::new(local, stream_id, &self.closed))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let mut incoming = self.incoming.lock().await;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            stream = incoming.recv() => Ok(stream),
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        debug!(
            "Memory connection {} closed: {} (code: {})",
            self.connection_id, reason, error_code
        );
        self.closed.cancel();
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn local_address(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

/// Accepting side of an in-memory endpoint
#[derive(Debug)]
pub struct MemoryListener {
    incoming: Mutex<mpsc::Receiver<MemoryConnection>>,
    closed: CancellationToken,
}

/// Dialing side of an in-memory endpoint
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::Sender<MemoryConnection>,
}

/// Create a listener and a connector that dials it
pub fn endpoint() -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::channel(16);
    (
        MemoryListener {
            incoming: Mutex::new(rx),
            closed: CancellationToken::new(),
        },
        MemoryConnector { outgoing: tx },
    )
}

#[async_trait]
impl TransportListener for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::ListenerClosed),
            connection = incoming.recv() => match connection {
                Some(connection) => {
                    let remote = connection.remote_address();
                    Ok((connection, remote))
                }
                None => Err(TransportError::ListenerClosed),
            },
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(loopback(9999))
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        _addr: SocketAddr,
        _server_name: &str,
    ) -> TransportResult<Self::Connection> {
        let (client, server) = pair();

        self.outgoing.send(server).await.map_err(|_| {
            TransportError::ConnectionError("connection refused".to_string())
        })?;

        Ok(client)
    }
}
