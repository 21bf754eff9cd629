//! Fixed-upstream tunnel client

use revtun_connection::{pipe, ReconnectManager};
use revtun_transport::{TransportConnection, TransportConnector, TransportStream};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::dial::{dial, retire};
use crate::{ClientConfig, ClientError};

/// Forwards every stream the tunnel server opens to one static destination
pub struct UpstreamClient<T: TransportConnector> {
    connector: T,
    config: ClientConfig,
    upstream: String,
}

impl<T: TransportConnector> UpstreamClient<T> {
    pub fn new(connector: T, config: ClientConfig, upstream: impl Into<String>) -> Self {
        Self {
            connector,
            config,
            upstream: upstream.into(),
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Serve the tunnel until the reconnect ceiling is reached
    pub async fn run(&self) -> Result<(), ClientError> {
        info!(
            server = %self.config.server_addr,
            upstream = %self.upstream,
            "Tunnel client started"
        );

        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());
        loop {
            let connection = dial(&self.connector, &self.config, &mut reconnect).await?;
            self.serve(&connection).await;
            retire(&connection, &self.config).await;
        }
    }

    /// Accept streams until the connection stops yielding them
    async fn serve(&self, connection: &T::Connection) {
        loop {
            let stream = match connection.accept_stream().await {
                Ok(Some(stream)) => stream,
                Ok(None) => {
                    warn!("Tunnel connection {} closed", connection.connection_id());
                    return;
                }
                Err(e) => {
                    error!("Could not accept stream: {}", e);
                    return;
                }
            };

            let stream_id = stream.stream_id();
            debug!(stream_id, "Got a new stream from the server");

            let span = info_span!("session", stream_id, upstream = %self.upstream);
            match TcpStream::connect(&self.upstream).await {
                Ok(upstream) => {
                    tokio::spawn(forward(stream, upstream).instrument(span));
                }
                Err(e) => {
                    let e = ClientError::DialFailed {
                        address: self.upstream.clone(),
                        source: e,
                    };
                    span.in_scope(|| error!("{}", e));
                    close_stream(stream).await;
                }
            }
        }
    }
}

async fn forward<S: TransportStream>(stream: S, upstream: TcpStream) {
    let stats = pipe(stream, upstream).await;
    debug!(
        to_upstream = stats.a_to_b,
        from_upstream = stats.b_to_a,
        "Session finished"
    );
}

async fn close_stream<S: TransportStream>(mut stream: S) {
    if let Err(e) = stream.shutdown().await {
        debug!("Failed to shut down stream {}: {}", stream.stream_id(), e);
    }
}
