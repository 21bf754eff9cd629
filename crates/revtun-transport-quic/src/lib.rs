//! QUIC transport for the reverse tunnel, built on quinn
//!
//! Both sides authenticate with certificates (mutual TLS 1.3): the server
//! only admits clients whose certificate chains to the configured CA, and
//! clients verify the server against their own CA bundle.
//!
//! # Example
//!
//! ```no_run
//! use revtun_transport_quic::{QuicConfig, QuicConnector, QuicListener};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Server side
//! let config = QuicConfig::server("server.crt", "server.key", "ca.crt");
//! let listener = QuicListener::new("0.0.0.0:8888".parse()?, &config)?;
//!
//! // Client side
//! let config = QuicConfig::client("ca.crt", "client.crt", "client.key");
//! let connector = QuicConnector::new(&config)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::{QuicConfig, DEFAULT_ALPN, DEFAULT_SERVER_NAME};
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::QuicStream;

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the ring crypto provider as the process default (idempotent)
pub fn ensure_crypto_provider() {
    INIT.call_once(|| {
        // Another component may already have installed a provider
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
