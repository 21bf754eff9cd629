//! Transport abstraction layer for reverse tunnel connections
//!
//! The tunnel server and clients only ever talk to a secure multiplexed
//! connection through the traits defined here. A connection can open and
//! accept independent ordered byte streams and reports its own death through
//! [`TransportConnection::closed`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        revtun-server / revtun-client (dispatch)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            revtun-transport (this crate)                 │
//! │  - TransportListener    - TransportConnection            │
//! │  - TransportStream      - TransportConnector             │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌────────────────────────────┬────────────────────────────┐
//! │ revtun-transport-quic      │ memory (in-process, tests) │
//! └────────────────────────────┴────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod memory;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional byte stream carried inside a transport connection
///
/// Streams are plain `AsyncRead + AsyncWrite` endpoints so they can be wired
/// to TCP sockets with ordinary tokio I/O helpers. Shutting down the write
/// half signals end-of-stream to the peer.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static {
    /// Get the stream ID (unique within its connection)
    fn stream_id(&self) -> u64;
}

/// A secure multiplexed connection between one tunnel client and the server
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug + 'static {
    /// The stream type created by this connection
    type Stream: TransportStream;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection with an application error code and reason
    async fn close(&self, error_code: u32, reason: &str);

    /// Resolves once the connection has terminated, whatever the cause
    async fn closed(&self);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get the remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Get the local address of this end, when the transport knows it
    fn local_address(&self) -> Option<SocketAddr>;

    /// Get a unique stable identifier for this connection
    ///
    /// Two handles refer to the same connection exactly when their IDs match.
    fn connection_id(&self) -> String;
}

/// Server-side: accepts incoming tunnel connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug + 'static {
    /// The connection type accepted by this listener
    type Connection: TransportConnection;

    /// Accept an incoming connection
    ///
    /// Returns [`TransportError::ListenerClosed`] once the listener can no
    /// longer produce connections. Any other error is transient.
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the listener (stop accepting new connections)
    async fn close(&self);
}

/// Client-side: establishes outgoing tunnel connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug + 'static {
    /// The connection type created by this connector
    type Connection: TransportConnection;

    /// Connect to a remote server
    ///
    /// # Arguments
    /// * `addr` - The socket address to connect to
    /// * `server_name` - The server name for TLS verification
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection>;
}

/// PEM material for mutual TLS
#[derive(Debug, Clone, Default)]
pub struct TransportSecurityConfig {
    /// CA bundle used to verify the peer
    pub ca_cert_path: Option<String>,

    /// Own certificate chain presented to the peer
    pub cert_path: Option<String>,

    /// Private key for `cert_path`
    pub key_path: Option<String>,

    /// Application-Layer Protocol Negotiation (ALPN) protocols
    pub alpn_protocols: Vec<String>,
}

impl TransportSecurityConfig {
    pub fn new(ca_cert_path: &str, cert_path: &str, key_path: &str) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.to_string()),
            cert_path: Some(cert_path.to_string()),
            key_path: Some(key_path.to_string()),
            alpn_protocols: Vec::new(),
        }
    }
}
