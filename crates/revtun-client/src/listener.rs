//! Adapter exposing a tunnel connection's incoming streams as a listener

use revtun_transport::{TransportConnection, TransportStream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{ClientError, LISTENER_CLOSE_CODE};

/// Yields one [`TunnelConn`] per stream the tunnel server opens
pub struct StreamListener<C> {
    connection: Arc<C>,
}

impl<C: TransportConnection> StreamListener<C> {
    pub fn new(connection: Arc<C>) -> Self {
        Self { connection }
    }

    /// Wait for the next server-opened stream
    ///
    /// Fails once the tunnel connection is gone.
    pub async fn accept(&self) -> Result<TunnelConn<C::Stream>, ClientError> {
        match self.connection.accept_stream().await? {
            Some(stream) => Ok(TunnelConn {
                stream,
                local: self.connection.local_address(),
                remote: self.connection.remote_address(),
            }),
            None => Err(ClientError::ConnectionClosed),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.local_address()
    }

    /// Close the underlying tunnel connection
    pub async fn close(&self) {
        self.connection.close(LISTENER_CLOSE_CODE, "die").await;
    }
}

/// A stream presented as a plain connection, carrying its tunnel's addresses
#[derive(Debug)]
pub struct TunnelConn<S> {
    stream: S,
    local: Option<SocketAddr>,
    remote: SocketAddr,
}

impl<S: TransportStream> TunnelConn<S> {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn stream_id(&self) -> u64 {
        self.stream.stream_id()
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: TransportStream> AsyncRead for TunnelConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: TransportStream> AsyncWrite for TunnelConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtun_transport::memory;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accept_wraps_stream_with_addresses() {
        let (client, server) = memory::pair();
        let listener = StreamListener::new(Arc::new(client.clone()));

        let mut opened = server.open_stream().await.unwrap();
        opened.write_all(b"hi").await.unwrap();

        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.remote_addr(), client.remote_address());
        assert_eq!(conn.local_addr(), client.local_address());
        assert_eq!(conn.stream_id(), opened.stream_id());

        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_accept_fails_after_close() {
        let (client, server) = memory::pair();
        let listener = StreamListener::new(Arc::new(client));

        listener.close().await;

        assert!(server.is_closed());
        assert!(matches!(
            listener.accept().await,
            Err(ClientError::ConnectionClosed)
        ));
    }
}
