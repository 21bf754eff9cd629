//! QUIC connection implementation

use async_trait::async_trait;
use quinn::{Connection, ConnectionError};
use revtun_transport::{TransportConnection, TransportError, TransportResult};
use std::net::SocketAddr;
use tracing::{debug, error, trace};

use crate::stream::QuicStream;

/// QUIC connection wrapper
///
/// Cloning yields another handle to the same connection.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    connection_id: String,
    local_addr: Option<SocketAddr>,
}

impl QuicConnection {
    pub fn new(connection: Connection, local_addr: Option<SocketAddr>) -> Self {
        let connection_id = format!("quic-{}", connection.stable_id());

        Self {
            inner: connection,
            connection_id,
            local_addr,
        }
    }

    /// Get the underlying quinn connection
    pub fn inner(&self) -> &Connection {
        &self.inner
    }
}

/// Terminations that end the stream supply without being a fault
fn ends_quietly(e: &ConnectionError) -> bool {
    matches!(
        e,
        ConnectionError::ApplicationClosed(_)
            | ConnectionError::ConnectionClosed(_)
            | ConnectionError::LocallyClosed
            | ConnectionError::TimedOut
    )
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let (send, recv) = self.inner.open_bi().await.map_err(|e| {
            debug!("{}: cannot open stream: {}", self.connection_id, e);
            TransportError::ConnectionError(e.to_string())
        })?;

        trace!("{}: opened stream {}", self.connection_id, send.id().index());
        Ok(QuicStream::new(send, recv))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let (send, recv) = match self.inner.accept_bi().await {
            Ok(pair) => pair,
            Err(e) if ends_quietly(&e) => {
                debug!("{}: no more streams: {}", self.connection_id, e);
                return Ok(None);
            }
            Err(e) => {
                error!("{}: stream accept failed: {}", self.connection_id, e);
                return Err(TransportError::ConnectionError(e.to_string()));
            }
        };

        trace!("{}: accepted stream {}", self.connection_id, send.id().index());
        Ok(Some(QuicStream::new(send, recv)))
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner.close(error_code.into(), reason.as_bytes());

        debug!("{}: closed locally, code {} ({})", self.connection_id, error_code, reason);
    }

    async fn closed(&self) {
        let reason = self.inner.closed().await;
        trace!("{}: terminated: {}", self.connection_id, reason);
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
