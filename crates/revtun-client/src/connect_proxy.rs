//! HTTP CONNECT proxy tunnel client
//!
//! Each server-opened stream carries one HTTP/1.1 `CONNECT host:port`
//! request. The client dials the destination, answers with a bare
//! `200 OK`, and from then on the stream is a raw byte tunnel to it.

use revtun_connection::ReconnectManager;
use revtun_transport::TransportConnector;
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::dial::{dial, retire};
use crate::listener::StreamListener;
use crate::{ClientConfig, ClientError};

/// Status line written once the destination has been dialed
pub const CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Largest accepted request head (request line plus headers)
const MAX_HEAD_SIZE: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

/// Serves HTTP CONNECT requests arriving over the tunnel
pub struct ConnectProxyClient<T: TransportConnector> {
    connector: T,
    config: ClientConfig,
}

impl<T: TransportConnector> ConnectProxyClient<T> {
    pub fn new(connector: T, config: ClientConfig) -> Self {
        Self { connector, config }
    }

    /// Serve the tunnel until the reconnect ceiling is reached
    pub async fn run(&self) -> Result<(), ClientError> {
        info!(server = %self.config.server_addr, "CONNECT proxy client started");

        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());
        loop {
            let connection = Arc::new(dial(&self.connector, &self.config, &mut reconnect).await?);
            let listener = StreamListener::new(connection.clone());

            debug!("Serving CONNECT requests");
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let span = info_span!(
                            "connect",
                            stream_id = conn.stream_id(),
                            remote = %conn.remote_addr()
                        );
                        tokio::spawn(
                            async move {
                                if let Err(e) = handle_connect(conn).await {
                                    warn!("CONNECT request failed: {}", e);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        error!("Failure on CONNECT serving: {}", e);
                        break;
                    }
                }
            }

            retire(connection.as_ref(), &self.config).await;
        }
    }
}

/// Outcome of reading a request head
enum Head {
    Connect { target: String },
    Other { method: String },
    Malformed(String),
    TooLarge,
    Eof,
}

async fn read_head<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> std::io::Result<Head> {
    let mut head = Vec::with_capacity(512);

    loop {
        let remaining = (MAX_HEAD_SIZE - head.len()) as u64;
        let n = (&mut *reader).take(remaining).read_until(b'\n', &mut head).await?;

        if n == 0 {
            if head.is_empty() {
                return Ok(Head::Eof);
            }
            if head.len() >= MAX_HEAD_SIZE {
                return Ok(Head::TooLarge);
            }
            return Ok(Head::Malformed("connection closed mid-request".to_string()));
        }

        if !head.ends_with(b"\n") {
            if head.len() >= MAX_HEAD_SIZE {
                return Ok(Head::TooLarge);
            }
            continue;
        }

        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Ok(Head::Malformed("incomplete request head".to_string()))
        }
        Err(e) => return Ok(Head::Malformed(e.to_string())),
    }

    let (Some(method), Some(target)) = (request.method, request.path) else {
        return Ok(Head::Malformed("missing request line".to_string()));
    };

    debug!(method, target, "Received request");

    if method == "CONNECT" {
        Ok(Head::Connect {
            target: target.to_string(),
        })
    } else {
        Ok(Head::Other {
            method: method.to_string(),
        })
    }
}

async fn write_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}\n",
        status,
        body.len() + 1,
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}

/// Handle one CONNECT request on `conn`
///
/// Non-CONNECT methods get 405, an unreachable destination gets 400 with
/// the dial error as body. On success the literal [`CONNECT_RESPONSE`] is
/// written and bytes are copied both ways until both directions end. Bytes
/// the client sent right after the request head reach the destination first.
pub async fn handle_connect<S>(conn: S) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(MAX_HEAD_SIZE, conn);

    let target = match read_head(&mut reader).await? {
        Head::Connect { target } => target,
        Head::Other { method } => {
            debug!(method, "Rejecting non-CONNECT request");
            write_error(
                reader.get_mut(),
                "405 Method Not Allowed",
                "this proxy only supports CONNECT passthrough",
            )
            .await?;
            return Ok(());
        }
        Head::Malformed(reason) => {
            debug!("Malformed request: {}", reason);
            write_error(reader.get_mut(), "400 Bad Request", "malformed request").await?;
            return Ok(());
        }
        Head::TooLarge => {
            write_error(
                reader.get_mut(),
                "431 Request Header Fields Too Large",
                "request head too large",
            )
            .await?;
            return Ok(());
        }
        Head::Eof => {
            debug!("Connection closed before a request arrived");
            return Ok(());
        }
    };

    let dst = match TcpStream::connect(&target).await {
        Ok(dst) => dst,
        Err(e) => {
            write_error(reader.get_mut(), "400 Bad Request", &e.to_string()).await?;
            return Err(ClientError::DialFailed {
                address: target,
                source: e,
            });
        }
    };

    // Detach the raw connection along with anything read past the head
    let prefix = reader.buffer().to_vec();
    let mut src = reader.into_inner();
    src.write_all(CONNECT_RESPONSE).await?;

    debug!(target, buffered = prefix.len(), "Tunnel established");

    let (mut src_read, mut src_write) = tokio::io::split(src);
    let (mut dst_read, mut dst_write) = dst.into_split();

    let to_dst = async {
        if !prefix.is_empty() {
            dst_write.write_all(&prefix).await?;
        }
        let copied = tokio::io::copy(&mut src_read, &mut dst_write).await?;
        dst_write.shutdown().await?;
        Ok::<u64, std::io::Error>(copied + prefix.len() as u64)
    };

    let to_src = async {
        let copied = tokio::io::copy(&mut dst_read, &mut src_write).await?;
        src_write.shutdown().await?;
        Ok::<u64, std::io::Error>(copied)
    };

    let (to_dst, to_src) = tokio::join!(to_dst, to_src);

    match &to_dst {
        Ok(bytes) => debug!(target, bytes, "Source to destination finished"),
        Err(e) => warn!(target, "Cannot copy from source to destination: {}", e),
    }
    match &to_src {
        Ok(bytes) => debug!(target, bytes, "Destination to source finished"),
        Err(e) => warn!(target, "Cannot copy from destination to source: {}", e),
    }

    Ok(())
}
