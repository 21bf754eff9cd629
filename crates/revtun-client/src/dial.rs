//! Dialing the tunnel server with backoff

use revtun_connection::ReconnectManager;
use revtun_transport::{TransportConnection, TransportConnector};
use std::net::SocketAddr;
use tracing::{debug, error, info};

use crate::{ClientConfig, ClientError, LISTENER_CLOSE_CODE};

async fn resolve(address: &str) -> Result<SocketAddr, ClientError> {
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| ClientError::Resolve {
            address: address.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ClientError::Resolve {
            address: address.to_string(),
            reason: "no addresses found".to_string(),
        })
}

async fn try_dial<T: TransportConnector>(
    connector: &T,
    config: &ClientConfig,
) -> Result<T::Connection, ClientError> {
    let addr = resolve(&config.server_addr).await?;
    debug!("Dialing tunnel server {} ({})", config.server_addr, addr);
    Ok(connector.connect(addr, &config.server_name).await?)
}

/// Dial until a connection is established or the attempt ceiling is reached
pub(crate) async fn dial<T: TransportConnector>(
    connector: &T,
    config: &ClientConfig,
    reconnect: &mut ReconnectManager,
) -> Result<T::Connection, ClientError> {
    loop {
        match try_dial(connector, config).await {
            Ok(connection) => {
                info!(
                    connection_id = %connection.connection_id(),
                    "Connected to tunnel server {}",
                    config.server_addr
                );
                reconnect.reset();
                return Ok(connection);
            }
            Err(e) => {
                error!("Could not dial tunnel server {}: {}", config.server_addr, e);
                reconnect.wait().await?;
            }
        }
    }
}

/// Close a connection that stopped yielding streams and pause before redialing
pub(crate) async fn retire<C: TransportConnection>(connection: &C, config: &ClientConfig) {
    connection.close(LISTENER_CLOSE_CODE, "die").await;
    info!(
        "Tunnel connection {} closed, reconnecting in {:?}",
        connection.connection_id(),
        config.reconnect_pause
    );
    tokio::time::sleep(config.reconnect_pause).await;
}
