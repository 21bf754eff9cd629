//! Tunnel server dispatch
//!
//! Runs two accept loops: one admitting tunnel clients into the registry,
//! one accepting plaintext TCP connections and piping each through a new
//! stream on a pooled tunnel connection.

use revtun_connection::pipe;
use revtun_transport::{TransportConnection, TransportError, TransportListener, TransportStream};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::registry::ConnectionRegistry;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },
}

/// Reverse tunnel server over any [`TransportListener`]
pub struct TunnelServer<L: TransportListener> {
    tunnel_listener: L,
    tcp_listener: TcpListener,
    registry: ConnectionRegistry<L::Connection>,
}

impl<L: TransportListener> TunnelServer<L> {
    pub fn new(tunnel_listener: L, tcp_listener: TcpListener) -> Self {
        Self {
            tunnel_listener,
            tcp_listener,
            registry: ConnectionRegistry::new(),
        }
    }

    /// Bind the plaintext TCP listener on `tcp_addr` and build the server
    pub async fn bind(tunnel_listener: L, tcp_addr: SocketAddr) -> Result<Self, ServerError> {
        let tcp_listener =
            TcpListener::bind(tcp_addr)
                .await
                .map_err(|e| ServerError::BindError {
                    address: tcp_addr,
                    reason: e.to_string(),
                })?;

        Ok(Self::new(tunnel_listener, tcp_listener))
    }

    /// Use an externally owned registry
    pub fn with_registry(mut self, registry: ConnectionRegistry<L::Connection>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry<L::Connection> {
        &self.registry
    }

    pub fn tunnel_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.tunnel_listener.local_addr()?)
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.tcp_listener.local_addr()?)
    }

    /// Run both accept loops
    ///
    /// The tunnel loop runs in its own task and stops only once the tunnel
    /// listener is closed; the inbound loop runs until the future is dropped.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            tunnel = %self.tunnel_addr()?,
            tcp = %self.tcp_addr()?,
            "Tunnel server started"
        );

        let tunnel_loop = tokio::spawn(accept_tunnels(self.tunnel_listener, self.registry.clone()));
        let result = accept_inbound(self.tcp_listener, self.registry).await;
        tunnel_loop.abort();

        result
    }
}

async fn accept_tunnels<L: TransportListener>(
    listener: L,
    registry: ConnectionRegistry<L::Connection>,
) {
    loop {
        match listener.accept().await {
            Ok((connection, remote)) => {
                debug!("Tunnel client connected from {}", remote);
                registry.add(connection);
            }
            Err(TransportError::ListenerClosed) => {
                info!("Tunnel listener closed, no longer accepting tunnel clients");
                return;
            }
            Err(e) => {
                error!("Failed to accept tunnel connection: {}", e);
            }
        }
    }
}

async fn accept_inbound<C: TransportConnection>(
    listener: TcpListener,
    registry: ConnectionRegistry<C>,
) -> Result<(), ServerError> {
    loop {
        let (inbound, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
                continue;
            }
        };

        let connection = match registry.next() {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Dropping inbound connection from {}: {}", peer_addr, e);
                drop(inbound);
                continue;
            }
        };

        let stream = match connection.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "Failed to open stream on {} for {}: {}",
                    connection.connection_id(),
                    peer_addr,
                    e
                );
                continue;
            }
        };

        let span = info_span!(
            "session",
            peer = %peer_addr,
            tunnel = %connection.connection_id(),
            stream_id = stream.stream_id()
        );
        tokio::spawn(forward(inbound, stream).instrument(span));
    }
}

async fn forward<S: TransportStream>(inbound: TcpStream, stream: S) {
    debug!("Forwarding inbound connection");
    let stats = pipe(inbound, stream).await;
    debug!(
        sent = stats.a_to_b,
        received = stats.b_to_a,
        "Session finished"
    );
}
