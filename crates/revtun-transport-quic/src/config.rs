//! QUIC transport configuration

use revtun_transport::{TransportError, TransportResult, TransportSecurityConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// ALPN protocol spoken by tunnel clients and the tunnel server
pub const DEFAULT_ALPN: &str = "quic-echo-example";

/// Server name clients expect in the server certificate
pub const DEFAULT_SERVER_NAME: &str = "quic-tunnel-server";

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Mutual TLS material
    security: TransportSecurityConfig,

    /// Keep-alive interval (clients only; servers rely on the client's pings)
    pub keep_alive_interval: Option<Duration>,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the peer may open
    pub max_concurrent_streams: u64,

    /// Per-stream receive window in bytes
    pub stream_receive_window: u64,

    /// Per-connection receive window in bytes
    pub receive_window: u64,
}

impl QuicConfig {
    fn with_security(security: TransportSecurityConfig, keep_alive: Option<Duration>) -> Self {
        Self {
            security,
            keep_alive_interval: keep_alive,
            max_idle_timeout: Duration::from_secs(5),
            max_concurrent_streams: 10_000,
            stream_receive_window: 246 * (1 << 20),
            receive_window: 500 * (1 << 20),
        }
    }

    /// Tunnel client configuration
    ///
    /// Presents `cert_path`/`key_path` to the server and verifies the server
    /// against the CA bundle at `ca_path`.
    pub fn client(ca_path: &str, cert_path: &str, key_path: &str) -> Self {
        let mut security = TransportSecurityConfig::new(ca_path, cert_path, key_path);
        security.alpn_protocols = vec![DEFAULT_ALPN.to_string()];
        Self::with_security(security, Some(Duration::from_secs(2)))
    }

    /// Tunnel server configuration
    ///
    /// Serves `cert_path`/`key_path` and requires every client to present a
    /// certificate issued by the CA bundle at `client_ca_path`.
    pub fn server(cert_path: &str, key_path: &str, client_ca_path: &str) -> Self {
        let mut security = TransportSecurityConfig::new(client_ca_path, cert_path, key_path);
        security.alpn_protocols = vec![DEFAULT_ALPN.to_string()];
        Self::with_security(security, None)
    }

    pub fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Set maximum concurrent streams
    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Set per-stream and per-connection receive windows in bytes
    pub fn with_receive_windows(mut self, stream: u64, connection: u64) -> Self {
        self.stream_receive_window = stream;
        self.receive_window = connection;
        self
    }

    /// Set custom ALPN protocols
    pub fn with_alpn_protocols(mut self, protocols: Vec<String>) -> Self {
        self.security.alpn_protocols = protocols;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if let Some(keep_alive) = self.keep_alive_interval {
            if keep_alive.is_zero() {
                return Err(TransportError::ConfigurationError(
                    "Keep-alive interval must be > 0".to_string(),
                ));
            }

            if self.max_idle_timeout < keep_alive * 2 {
                return Err(TransportError::ConfigurationError(
                    "Idle timeout must be at least 2x keep-alive interval".to_string(),
                ));
            }
        }

        if self.max_concurrent_streams == 0 {
            return Err(TransportError::ConfigurationError(
                "Maximum concurrent streams must be > 0".to_string(),
            ));
        }

        for (name, path) in [
            ("CA bundle", &self.security.ca_cert_path),
            ("certificate", &self.security.cert_path),
            ("private key", &self.security.key_path),
        ] {
            if path.is_none() {
                return Err(TransportError::ConfigurationError(format!(
                    "{} path required",
                    name
                )));
            }
        }

        Ok(())
    }

    fn paths(&self) -> TransportResult<(&str, &str, &str)> {
        self.validate()?;
        // validate() guarantees all three are set
        match (
            self.security.ca_cert_path.as_deref(),
            self.security.cert_path.as_deref(),
            self.security.key_path.as_deref(),
        ) {
            (Some(ca), Some(cert), Some(key)) => Ok((ca, cert, key)),
            _ => Err(TransportError::ConfigurationError(
                "Incomplete TLS configuration".to_string(),
            )),
        }
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.security
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }

    fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let varint = |value: u64, what: &str| {
            quinn::VarInt::from_u64(value).map_err(|_| {
                TransportError::ConfigurationError(format!("{} out of range: {}", what, value))
            })
        };

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(self.keep_alive_interval);
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::ConfigurationError(format!(
                "Idle timeout out of range: {:?}",
                self.max_idle_timeout
            ))
        })?));
        transport.max_concurrent_bidi_streams(varint(
            self.max_concurrent_streams,
            "Concurrent streams",
        )?);
        transport.max_concurrent_uni_streams(varint(
            self.max_concurrent_streams,
            "Concurrent streams",
        )?);
        transport.stream_receive_window(varint(self.stream_receive_window, "Stream window")?);
        transport.receive_window(varint(self.receive_window, "Connection window")?);

        Ok(transport)
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        crate::ensure_crypto_provider();
        let (ca_path, cert_path, key_path) = self.paths()?;

        let roots = revtun_cert::load_root_store(Path::new(ca_path)).map_err(tls_err)?;
        let certs = revtun_cert::load_certs(Path::new(cert_path)).map_err(tls_err)?;
        let key = revtun_cert::load_private_key(Path::new(key_path)).map_err(tls_err)?;

        let mut client_crypto = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid client cert/key: {}", e)))?;
        client_crypto.alpn_protocols = self.alpn();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(self.transport_config()?));

        Ok(client_config)
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        crate::ensure_crypto_provider();
        let (client_ca_path, cert_path, key_path) = self.paths()?;

        let certs = revtun_cert::load_certs(Path::new(cert_path)).map_err(tls_err)?;
        let key = revtun_cert::load_private_key(Path::new(key_path)).map_err(tls_err)?;
        let client_roots =
            revtun_cert::load_root_store(Path::new(client_ca_path)).map_err(tls_err)?;

        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(client_roots))
            .build()
            .map_err(|e| TransportError::TlsError(format!("Invalid client CA: {}", e)))?;

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;
        server_crypto.alpn_protocols = self.alpn();

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(self.transport_config()?));

        Ok(server_config)
    }
}

fn tls_err(e: revtun_cert::CertError) -> TransportError {
    TransportError::TlsError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = QuicConfig::client("ca.crt", "client.crt", "client.key");
        assert_eq!(config.keep_alive_interval, Some(Duration::from_secs(2)));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_streams, 10_000);
        assert_eq!(config.security_config().alpn_protocols, vec![DEFAULT_ALPN]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_has_no_keep_alive() {
        let config = QuicConfig::server("server.crt", "server.key", "ca.crt");
        assert!(config.keep_alive_interval.is_none());
        assert_eq!(
            config.security_config().ca_cert_path.as_deref(),
            Some("ca.crt")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_idle_timeout() {
        let config = QuicConfig::client("ca.crt", "client.crt", "client.key")
            .with_idle_timeout(Duration::from_secs(1));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_receive_windows_builder() {
        let config = QuicConfig::client("ca.crt", "client.crt", "client.key")
            .with_receive_windows(1 << 20, 4 << 20);
        assert_eq!(config.stream_receive_window, 1 << 20);
        assert_eq!(config.receive_window, 4 << 20);
        assert!(config.transport_config().is_ok());
    }

    #[test]
    fn test_zero_streams_rejected() {
        let config = QuicConfig::server("server.crt", "server.key", "ca.crt").with_max_streams(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_cert_file_is_tls_error() {
        let config = QuicConfig::client("/nonexistent/ca.crt", "client.crt", "client.key");
        assert!(matches!(
            config.build_client_config(),
            Err(TransportError::TlsError(_))
        ));
    }
}
