//! revtun - QUIC reverse tunnel
//!
//! Tunnel clients behind NAT dial out to a public tunnel server; the server
//! forwards inbound TCP connections back through them.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use revtun_cert::DevPki;
use revtun_client::{ClientConfig, ConnectProxyClient, UpstreamClient};
use revtun_connection::ReconnectConfig;
use revtun_server::TunnelServer;
use revtun_transport_quic::{QuicConfig, QuicConnector, QuicListener, DEFAULT_SERVER_NAME};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// revtun - expose services behind NAT through a QUIC reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "revtun")]
#[command(about = "revtun - expose services behind NAT through a QUIC reverse tunnel")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, global = true, default_value = "info", env = "REVTUN_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept tunnel clients and forward inbound TCP connections through them
    #[command(long_about = r#"
Listen for tunnel clients over QUIC (mutual TLS) and forward every inbound
TCP connection through one of them, picked round robin.

EXAMPLES:
  revtun server --cert-file server.crt --cert-key server.key \
    --client-ca-file ca.crt --listen-quic 0.0.0.0:8888 --listen-tcp 0.0.0.0:8443
    "#)]
    Server(ServerArgs),

    /// Dial the tunnel server and forward every stream to a fixed upstream
    #[command(long_about = r#"
Connect to the tunnel server and forward every stream it opens to a single
upstream address. Reconnects automatically if the connection drops.

EXAMPLES:
  revtun client --ca-file ca.crt --cert-file client.crt --cert-key client.key \
    --server tunnel.example.com:8888 --upstream 127.0.0.1:443
    "#)]
    Client {
        #[command(flatten)]
        tunnel: TunnelArgs,

        /// host:port every stream is forwarded to (e.g. www.example.com:443)
        #[arg(long, env = "REVTUN_UPSTREAM")]
        upstream: Option<String>,
    },

    /// Dial the tunnel server and serve HTTP CONNECT requests on its streams
    #[command(long_about = r#"
Connect to the tunnel server and treat every stream it opens as an HTTP
CONNECT proxy connection: the requested host:port is dialed and the stream
becomes a raw tunnel to it.

EXAMPLES:
  revtun connect-proxy --ca-file ca.crt --cert-file client.crt \
    --cert-key client.key --server tunnel.example.com:8888
    "#)]
    ConnectProxy {
        #[command(flatten)]
        tunnel: TunnelArgs,
    },

    /// Generate a development CA plus server and client certificates
    GenCerts {
        /// Directory the PEM files are written to
        #[arg(long, default_value = "certs", env = "REVTUN_OUT_DIR")]
        out_dir: PathBuf,

        /// DNS names or IP addresses the server certificate is valid for
        #[arg(long = "server-name", default_values = [DEFAULT_SERVER_NAME, "localhost", "127.0.0.1"])]
        server_names: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Server certificate (PEM)
    #[arg(long, env = "REVTUN_CERT_FILE")]
    cert_file: String,

    /// Server private key (PEM)
    #[arg(long, env = "REVTUN_CERT_KEY")]
    cert_key: String,

    /// CA bundle tunnel client certificates must chain to
    #[arg(long, env = "REVTUN_CLIENT_CA_FILE")]
    client_ca_file: String,

    /// Address to accept tunnel clients on
    #[arg(long, default_value = "0.0.0.0:8888", env = "REVTUN_LISTEN_QUIC")]
    listen_quic: String,

    /// Address to accept inbound TCP connections on
    #[arg(long, default_value = "0.0.0.0:8443", env = "REVTUN_LISTEN_TCP")]
    listen_tcp: String,
}

#[derive(Args, Debug)]
struct TunnelArgs {
    /// CA bundle the server certificate must chain to
    #[arg(long, env = "REVTUN_CA_FILE")]
    ca_file: String,

    /// Client certificate (PEM)
    #[arg(long, env = "REVTUN_CERT_FILE")]
    cert_file: String,

    /// Client private key (PEM)
    #[arg(long, env = "REVTUN_CERT_KEY")]
    cert_key: String,

    /// host:port of the tunnel server
    #[arg(long, default_value = "127.0.0.1:9999", env = "REVTUN_SERVER")]
    server: String,

    /// Name the server certificate must be valid for
    #[arg(long, default_value = DEFAULT_SERVER_NAME, env = "REVTUN_SERVER_NAME")]
    server_name: String,

    /// Maximum reconnection attempts (0 = infinite)
    #[arg(long, default_value = "0", env = "REVTUN_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: usize,

    /// Initial reconnection delay in seconds
    #[arg(
        long,
        default_value = "1",
        env = "REVTUN_RECONNECT_DELAY",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    reconnect_delay: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "30", env = "REVTUN_MAX_RECONNECT_DELAY")]
    max_reconnect_delay: u64,

    /// Pause in seconds after an established connection dies
    #[arg(long, default_value = "5", env = "REVTUN_RECONNECT_PAUSE")]
    reconnect_pause: u64,
}

impl TunnelArgs {
    fn client_config(&self) -> Result<ClientConfig> {
        validate_address(&self.server, "server")?;

        let reconnect = ReconnectConfig {
            initial_backoff: Duration::from_secs(self.reconnect_delay),
            max_backoff: Duration::from_secs(self.max_reconnect_delay.max(self.reconnect_delay)),
            max_attempts: (self.max_reconnect_attempts > 0).then_some(self.max_reconnect_attempts),
            ..ReconnectConfig::default()
        };

        Ok(ClientConfig::new(&self.server)
            .with_server_name(&self.server_name)
            .with_reconnect(reconnect)
            .with_reconnect_pause(Duration::from_secs(self.reconnect_pause)))
    }

    fn connector(&self) -> Result<QuicConnector> {
        let config = QuicConfig::client(&self.ca_file, &self.cert_file, &self.cert_key);
        QuicConnector::new(&config).context("Failed to set up QUIC client")
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

fn parse_listen_address(addr: &str, addr_type: &str) -> Result<SocketAddr> {
    validate_address(addr, addr_type)?;
    addr.parse()
        .with_context(|| format!("Invalid {} listen address: {}", addr_type, addr))
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let quic_addr = parse_listen_address(&args.listen_quic, "QUIC")?;
    let tcp_addr = parse_listen_address(&args.listen_tcp, "TCP")?;

    let config = QuicConfig::server(&args.cert_file, &args.cert_key, &args.client_ca_file);
    let listener = QuicListener::new(quic_addr, &config)
        .with_context(|| format!("Failed to start QUIC listener on {}", quic_addr))?;

    let server = TunnelServer::bind(listener, tcp_addr)
        .await
        .context("Failed to start TCP listener")?;

    until_ctrl_c(server.run()).await
}

/// Drive `task` until it finishes or Ctrl+C is received
async fn until_ctrl_c<F, E>(task: F) -> Result<()>
where
    F: Future<Output = Result<(), E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = task => {
            if let Err(e) = &result {
                error!("Stopped: {}", e);
            }
            Ok(result?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Client { tunnel, upstream } => {
            let upstream = upstream
                .context("Upstream address is required (use --upstream or REVTUN_UPSTREAM)")?;
            validate_address(&upstream, "upstream")?;

            let client = UpstreamClient::new(tunnel.connector()?, tunnel.client_config()?, upstream);
            until_ctrl_c(client.run()).await
        }
        Commands::ConnectProxy { tunnel } => {
            let client = ConnectProxyClient::new(tunnel.connector()?, tunnel.client_config()?);
            until_ctrl_c(client.run()).await
        }
        Commands::GenCerts {
            out_dir,
            server_names,
        } => {
            let pki = DevPki::generate(&server_names).context("Failed to generate certificates")?;
            pki.save_to_dir(&out_dir)
                .with_context(|| format!("Failed to write certificates to {}", out_dir.display()))?;
            info!("Development certificates written to {}", out_dir.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("tunnel.example.com:8888", "server").is_ok());
        assert!(validate_address("127.0.0.1:9999", "server").is_ok());
        assert!(validate_address("[::1]:443", "upstream").is_ok());

        assert!(validate_address("tunnel.example.com", "server").is_err());
        assert!(validate_address(":8888", "server").is_err());
        assert!(validate_address("localhost:99999", "server").is_err());
        assert!(validate_address("localhost:http", "server").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from([
            "revtun",
            "server",
            "--cert-file",
            "server.crt",
            "--cert-key",
            "server.key",
            "--client-ca-file",
            "ca.crt",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Server(args) => {
                assert_eq!(args.listen_quic, "0.0.0.0:8888");
                assert_eq!(args.listen_tcp, "0.0.0.0:8443");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_client_reconnect_flags() {
        let cli = Cli::try_parse_from([
            "revtun",
            "client",
            "--ca-file",
            "ca.crt",
            "--cert-file",
            "client.crt",
            "--cert-key",
            "client.key",
            "--upstream",
            "127.0.0.1:443",
            "--max-reconnect-attempts",
            "3",
            "--reconnect-pause",
            "1",
        ])
        .unwrap();

        let Commands::Client { tunnel, upstream } = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(upstream.as_deref(), Some("127.0.0.1:443"));
        assert_eq!(tunnel.server, "127.0.0.1:9999");
        assert_eq!(tunnel.server_name, DEFAULT_SERVER_NAME);

        let config = tunnel.client_config().unwrap();
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.reconnect_pause, Duration::from_secs(1));
    }

    #[test]
    fn test_unlimited_reconnects_by_default() {
        let cli = Cli::try_parse_from([
            "revtun",
            "connect-proxy",
            "--ca-file",
            "ca.crt",
            "--cert-file",
            "client.crt",
            "--cert-key",
            "client.key",
        ])
        .unwrap();

        let Commands::ConnectProxy { tunnel } = cli.command else {
            panic!("expected connect-proxy command");
        };
        assert!(tunnel.client_config().unwrap().reconnect.max_attempts.is_none());
    }

    #[test]
    fn test_zero_reconnect_delay_rejected() {
        let result = Cli::try_parse_from([
            "revtun",
            "connect-proxy",
            "--ca-file",
            "ca.crt",
            "--cert-file",
            "client.crt",
            "--cert-key",
            "client.key",
            "--reconnect-delay",
            "0",
        ]);
        assert!(result.is_err());
    }
}
