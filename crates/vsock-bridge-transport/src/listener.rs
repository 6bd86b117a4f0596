//! Listening sockets in either domain

use tokio::net::TcpListener;
use tracing::debug;

use crate::vsock;
use crate::{BridgeStream, Endpoint, PeerAddr, TransportError, TransportResult};

/// A bound listening socket.
///
/// Lives as long as the service that owns it; it is never closed while the
/// service is accepting.
pub enum BridgeListener {
    Tcp(TcpListener),
    Vsock(vsock::Listener),
}

impl BridgeListener {
    /// Bind a listener on `endpoint`. There is no retry and no fallback port.
    pub async fn bind(endpoint: &Endpoint) -> TransportResult<Self> {
        let listener = match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(|source| TransportError::BindError {
                        endpoint: endpoint.clone(),
                        source,
                    })?;
                BridgeListener::Tcp(listener)
            }
            Endpoint::Vsock { cid, port } => BridgeListener::Vsock(vsock::bind(*cid, *port)?),
        };

        debug!("Bound listener on {}", endpoint);
        Ok(listener)
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&mut self) -> TransportResult<(BridgeStream, PeerAddr)> {
        match self {
            BridgeListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                // Relay turns are small request/response exchanges
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), PeerAddr::Tcp(addr)))
            }
            BridgeListener::Vsock(listener) => vsock::accept(listener).await,
        }
    }

    /// The endpoint actually bound, with any wildcard port resolved.
    pub fn local_endpoint(&self) -> TransportResult<Endpoint> {
        match self {
            BridgeListener::Tcp(listener) => Ok(Endpoint::from(listener.local_addr()?)),
            BridgeListener::Vsock(listener) => vsock::local_endpoint(listener),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_reports_resolved_port() {
        let listener = BridgeListener::bind(&Endpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();

        match listener.local_endpoint().unwrap() {
            Endpoint::Tcp { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_ne!(port, 0);
            }
            other => panic!("unexpected endpoint {}", other),
        }
    }

    #[tokio::test]
    async fn test_accept_yields_peer_and_stream() {
        let mut listener = BridgeListener::bind(&Endpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let port = match listener.local_endpoint().unwrap() {
            Endpoint::Tcp { port, .. } => port,
            other => panic!("unexpected endpoint {}", other),
        };

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            stream.local_addr().unwrap()
        });

        let (mut stream, peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let client_addr = client.await.unwrap();
        assert_eq!(peer, PeerAddr::Tcp(client_addr));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let first = BridgeListener::bind(&Endpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let taken = first.local_endpoint().unwrap();

        let err = BridgeListener::bind(&taken).await.err().unwrap();
        assert!(matches!(err, TransportError::BindError { .. }));
        assert!(err.to_string().contains(&taken.to_string()));
    }
}
