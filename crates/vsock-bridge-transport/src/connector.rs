//! Outbound connections

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::vsock;
use crate::{BridgeStream, Endpoint, TransportError, TransportResult};

/// Opens the outbound half of a connection pair.
///
/// Each call must return a fresh connection; connections are never pooled
/// or reused across relays.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the target. No timeout, no retry.
    async fn connect(&self) -> TransportResult<BridgeStream>;

    /// The endpoint this connector dials
    fn target(&self) -> &Endpoint;
}

/// Dials a fixed endpoint in either domain
#[derive(Debug, Clone)]
pub struct EndpointConnector {
    target: Endpoint,
}

impl EndpointConnector {
    pub fn new(target: Endpoint) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Connector for EndpointConnector {
    async fn connect(&self) -> TransportResult<BridgeStream> {
        dial(&self.target).await
    }

    fn target(&self) -> &Endpoint {
        &self.target
    }
}

/// Open a new connection to `endpoint`.
pub async fn dial(endpoint: &Endpoint) -> TransportResult<BridgeStream> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|source| TransportError::ConnectionFailed {
                    endpoint: endpoint.clone(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
        Endpoint::Vsock { cid, port } => vsock::connect(*cid, *port).await,
    }
}
