//! Server dispatch tests over the in-memory transport

use revtun_server::TunnelServer;
use revtun_transport::memory::{self, MemoryConnection, MemoryConnector};
use revtun_transport::{TransportConnection, TransportConnector, TransportListener};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

struct Harness {
    connector: MemoryConnector,
    tcp_addr: SocketAddr,
    registry: revtun_server::ConnectionRegistry<MemoryConnection>,
}

async fn start_server() -> Harness {
    let (listener, connector) = memory::endpoint();
    let server = TunnelServer::bind(listener, "127.0.0.1:0".parse().unwrap())
        .await
        .expect("Failed to bind server");

    let tcp_addr = server.tcp_addr().unwrap();
    let registry = server.registry().clone();
    tokio::spawn(server.run());

    Harness {
        connector,
        tcp_addr,
        registry,
    }
}

impl Harness {
    async fn connect_client(&self) -> MemoryConnection {
        let expected = self.registry.len() + 1;
        let conn = self
            .connector
            .connect("127.0.0.1:9999".parse().unwrap(), "quic-tunnel-server")
            .await
            .expect("Failed to connect");
        self.wait_for_clients(expected).await;
        conn
    }

    async fn wait_for_clients(&self, count: usize) {
        timeout(Duration::from_secs(2), async {
            while self.registry.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Registry never reached expected size");
    }
}

/// Answer every stream the server opens on `conn` by echoing it back
fn spawn_echo_client(conn: MemoryConnection) {
    tokio::spawn(async move {
        while let Ok(Some(mut stream)) = conn.accept_stream().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn test_inbound_bytes_reach_tunnel_client() {
    let harness = start_server().await;
    let client = harness.connect_client().await;
    spawn_echo_client(client);

    let mut inbound = TcpStream::connect(harness.tcp_addr).await.unwrap();
    inbound.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), inbound.read_exact(&mut buf))
        .await
        .expect("Echo timeout")
        .unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_no_clients_closes_inbound() {
    let harness = start_server().await;

    let mut inbound = TcpStream::connect(harness.tcp_addr).await.unwrap();

    let mut buf = Vec::new();
    let result = timeout(Duration::from_secs(2), inbound.read_to_end(&mut buf))
        .await
        .expect("Inbound connection was not closed");
    // Either a clean EOF or a reset; never data
    if let Ok(n) = result {
        assert_eq!(n, 0);
    }
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_inbound_connections_rotate_across_clients() {
    let harness = start_server().await;
    let first = harness.connect_client().await;
    let second = harness.connect_client().await;

    let mut inbound = Vec::new();
    for _ in 0..4 {
        inbound.push(TcpStream::connect(harness.tcp_addr).await.unwrap());
    }

    let mut counts = [0usize; 2];
    for (i, conn) in [&first, &second].into_iter().enumerate() {
        for _ in 0..2 {
            timeout(Duration::from_secs(2), conn.accept_stream())
                .await
                .expect("Stream was not dispatched to this client")
                .unwrap()
                .expect("Connection closed");
            counts[i] += 1;
        }
    }

    assert_eq!(counts, [2, 2]);
}

#[tokio::test]
async fn test_dead_client_is_evicted() {
    let harness = start_server().await;
    let doomed = harness.connect_client().await;
    let survivor = harness.connect_client().await;
    spawn_echo_client(survivor);

    doomed.close(100, "die").await;
    harness.wait_for_clients(1).await;

    // Every inbound connection now lands on the survivor
    for _ in 0..3 {
        let mut inbound = TcpStream::connect(harness.tcp_addr).await.unwrap();
        inbound.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        timeout(Duration::from_secs(2), inbound.read_exact(&mut buf))
            .await
            .expect("Echo timeout")
            .unwrap();
        assert_eq!(&buf, b"hi");
    }
}

#[tokio::test]
async fn test_inbound_close_ends_tunnel_stream() {
    let harness = start_server().await;
    let client = harness.connect_client().await;

    let inbound = TcpStream::connect(harness.tcp_addr).await.unwrap();
    let mut stream = timeout(Duration::from_secs(2), client.accept_stream())
        .await
        .expect("Stream timeout")
        .unwrap()
        .unwrap();

    drop(inbound);

    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
        .await
        .expect("Tunnel stream was not closed")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_tunnel_loop_stops_when_listener_closed() {
    let (listener, _connector) = memory::endpoint();
    listener.close().await;

    let server = TunnelServer::bind(listener, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let tcp_addr = server.tcp_addr().unwrap();
    tokio::spawn(server.run());

    // Inbound loop still serves (and drops) connections
    let mut inbound = TcpStream::connect(tcp_addr).await.unwrap();
    let mut buf = Vec::new();
    let _ = timeout(Duration::from_secs(2), inbound.read_to_end(&mut buf))
        .await
        .expect("Inbound connection was not closed");
    assert!(buf.is_empty());
}
