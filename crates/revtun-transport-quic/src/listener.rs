//! QUIC listener and connector implementations

use async_trait::async_trait;
use quinn::Endpoint;
use revtun_transport::{TransportConnector, TransportError, TransportListener, TransportResult};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;

/// Handshakes finished but not yet picked up by `accept`
const ACCEPT_BACKLOG: usize = 64;

type Accepted = (QuicConnection, SocketAddr);

/// QUIC listener for accepting tunnel clients
///
/// A driver task takes every incoming connection off the endpoint and runs
/// its handshake in a task of its own, so a peer that never finishes the
/// handshake only holds up itself. Clients that fail the handshake
/// (including the client certificate check) are logged and dropped.
///
/// Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    accept_rx: Mutex<mpsc::Receiver<Accepted>>,
    driver: JoinHandle<()>,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: &QuicConfig) -> TransportResult<Self> {
        let server_config = config.build_server_config()?;

        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let driver = tokio::spawn(drive_incoming(endpoint.clone(), local_addr, accept_tx));

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self {
            endpoint,
            local_addr,
            accept_rx: Mutex::new(accept_rx),
            driver,
        })
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive_incoming(
    endpoint: Endpoint,
    local_addr: SocketAddr,
    accept_tx: mpsc::Sender<Accepted>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let remote = incoming.remote_address();
        debug!("Incoming QUIC connection from {}", remote);

        let accept_tx = accept_tx.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => {
                    info!("QUIC connection established from {}", remote);
                    let accepted = (QuicConnection::new(connection, Some(local_addr)), remote);
                    if accept_tx.send(accepted).await.is_err() {
                        debug!("Listener gone, dropping connection from {}", remote);
                    }
                }
                Err(e) => {
                    warn!("Failed to establish QUIC connection from {}: {}", remote, e);
                }
            }
        });
    }

    debug!("QUIC endpoint stopped accepting");
}

#[async_trait]
impl TransportListener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx.recv().await.ok_or(TransportError::ListenerClosed)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"Listener closed");
        self.driver.abort();
        // A pending accept() holds the receiver; it sees the closed channel
        // once the in-flight handshakes fail against the closed endpoint.
        if let Ok(mut accept_rx) = self.accept_rx.try_lock() {
            accept_rx.close();
        }
        info!("QUIC listener closed");
    }
}

/// QUIC connector for dialing the tunnel server
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: &QuicConfig) -> TransportResult<Self> {
        let client_config = config.build_client_config()?;

        let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(TransportError::IoError)?;

        endpoint.set_default_client_config(client_config);

        debug!("QUIC connector created");

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection> {
        debug!("Connecting to QUIC server: {} ({})", server_name, addr);

        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        info!("QUIC connection established to {} ({})", server_name, addr);

        let local_addr = self.endpoint.local_addr().ok();
        Ok(QuicConnection::new(connection, local_addr))
    }
}
