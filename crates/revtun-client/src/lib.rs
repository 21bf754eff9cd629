//! Tunnel clients
//!
//! A tunnel client dials the tunnel server, keeps the connection up, and
//! serves every stream the server opens on it. Two variants exist:
//!
//! - [`UpstreamClient`] forwards each stream to one fixed `host:port`
//! - [`ConnectProxyClient`] reads an HTTP `CONNECT` request from each stream
//!   and forwards it to the requested destination

pub mod config;
pub mod connect_proxy;
pub mod listener;
pub mod upstream;

mod dial;

pub use config::ClientConfig;
pub use connect_proxy::{handle_connect, ConnectProxyClient, CONNECT_RESPONSE};
pub use listener::{StreamListener, TunnelConn};
pub use upstream::UpstreamClient;

use revtun_connection::ReconnectError;
use revtun_transport::TransportError;
use thiserror::Error;

/// Application close code sent when the client gives up on a connection
pub const LISTENER_CLOSE_CODE: u32 = 100;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Giving up on tunnel server: {0}")]
    Reconnect(#[from] ReconnectError),

    #[error("Could not resolve {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("Failed to connect to {address}: {source}")]
    DialFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Tunnel connection closed")]
    ConnectionClosed,
}
