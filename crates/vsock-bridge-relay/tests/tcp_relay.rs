//! Relay over real loopback TCP sockets on both sides

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use vsock_bridge_relay::{Relay, RelayConfig, RelayError, RelayStats, Side};
use vsock_bridge_transport::{BridgeListener, Endpoint, EndpointConnector};

/// Target that answers each read with the same bytes upper-cased
async fn start_upper_server() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let reply = buf[..n].to_ascii_uppercase();
                            if socket.write_all(&reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    Endpoint::from(addr)
}

type RelayHandle = JoinHandle<Result<RelayStats, RelayError>>;

/// Accept one client on a fresh listener and start a relay for it
async fn accept_one(target: Endpoint) -> (TcpStream, RelayHandle) {
    let mut listener = BridgeListener::bind(&Endpoint::tcp("127.0.0.1", 0))
        .await
        .unwrap();
    let port = match listener.local_endpoint().unwrap() {
        Endpoint::Tcp { port, .. } => port,
        other => panic!("unexpected endpoint {}", other),
    };

    let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (inbound, _peer) = listener.accept().await.unwrap();

    let relay = Relay::new(RelayConfig::default(), EndpointConnector::new(target));
    let handle = tokio::spawn(async move { relay.run(1, inbound).await });
    (client, handle)
}

#[tokio::test]
async fn test_request_response_over_tcp() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();

    let target = start_upper_server().await;
    let (mut client, handle) = accept_one(target).await;

    for request in [&b"ping"[..], b"status", b"bye"] {
        client.write_all(request).await.unwrap();
        let mut reply = vec![0u8; request.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, request.to_ascii_uppercase());
    }

    client.shutdown().await.unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.turns, 3);
    assert_eq!(stats.bytes_inbound_to_outbound, 13);
    assert_eq!(stats.bytes_outbound_to_inbound, 13);
    assert_eq!(stats.closed_by, Side::Inbound);

    // Relay closed the inbound connection
    let mut rest = Vec::new();
    assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
}

#[tokio::test]
async fn test_refused_target_closes_client() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = Endpoint::from(unused.local_addr().unwrap());
    drop(unused);

    let (mut client, handle) = accept_one(target).await;

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(RelayError::Dial(_))));

    let mut rest = Vec::new();
    let n = client.read_to_end(&mut rest).await.unwrap_or(0);
    assert_eq!(n, 0);
}
