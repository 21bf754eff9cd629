//! Tunnel client configuration

use revtun_connection::ReconnectConfig;
use std::time::Duration;

/// Settings shared by both client variants
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the tunnel server, resolved again on every dial
    pub server_addr: String,

    /// Name the server certificate must be valid for
    pub server_name: String,

    /// Backoff between failed dials
    pub reconnect: ReconnectConfig,

    /// Pause after an established connection dies, before dialing again
    pub reconnect_pause: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9999".to_string(),
            server_name: "quic-tunnel-server".to_string(),
            reconnect: ReconnectConfig::default(),
            reconnect_pause: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_reconnect_pause(mut self, pause: Duration) -> Self {
        self.reconnect_pause = pause;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_addr, "127.0.0.1:9999");
        assert_eq!(config.server_name, "quic-tunnel-server");
        assert_eq!(config.reconnect_pause, Duration::from_secs(5));
        assert!(config.reconnect.max_attempts.is_none());
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::new("tunnel.example.com:8888")
            .with_server_name("tunnel.example.com")
            .with_reconnect_pause(Duration::from_millis(10));

        assert_eq!(config.server_addr, "tunnel.example.com:8888");
        assert_eq!(config.server_name, "tunnel.example.com");
        assert_eq!(config.reconnect_pause, Duration::from_millis(10));
    }
}
