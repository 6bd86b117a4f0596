//! Bridge Server Implementation
//!
//! Accepts connections on the listen endpoint and hands each one to its own
//! relay task. The accept loop never waits on relay work; the only
//! backpressure is the optional connection cap.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use vsock_bridge_relay::{Relay, RelayConfig, RelayError};
use vsock_bridge_transport::{
    BridgeListener, BridgeStream, Connector, Endpoint, EndpointConnector, PeerAddr,
    TransportError,
};

/// Default time shutdown waits for in-flight relays
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not
/// spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration for service '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct BridgeServerConfig {
    /// Service label used in log records
    pub name: String,
    pub listen: Endpoint,
    pub target: Endpoint,
    pub relay: RelayConfig,
    /// Cap on concurrently running relays. `None` means unbounded.
    pub max_connections: Option<usize>,
    pub drain_timeout: Duration,
}

impl BridgeServerConfig {
    pub fn new(name: impl Into<String>, listen: Endpoint, target: Endpoint) -> Self {
        Self {
            name: name.into(),
            listen,
            target,
            relay: RelayConfig::default(),
            max_connections: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let invalid = |reason: String| ServerError::InvalidConfig {
            name: self.name.clone(),
            reason,
        };

        self.relay.validate().map_err(invalid)?;
        if self.max_connections == Some(0) {
            return Err(invalid(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection ID generator for log correlation
#[derive(Clone)]
pub struct ConnectionIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound bridge service
pub struct BridgeServer<C = EndpointConnector> {
    config: BridgeServerConfig,
    listener: BridgeListener,
    relay: Arc<Relay<C>>,
    connection_ids: ConnectionIdGenerator,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

impl BridgeServer<EndpointConnector> {
    /// Bind the listen endpoint. Failing to bind is fatal for the service.
    pub async fn bind(config: BridgeServerConfig) -> Result<Self, ServerError> {
        let connector = EndpointConnector::new(config.target.clone());
        Self::bind_with_connector(config, connector).await
    }
}

impl<C: Connector + 'static> BridgeServer<C> {
    /// Bind the listen endpoint and dial targets through `connector`.
    pub async fn bind_with_connector(
        config: BridgeServerConfig,
        connector: C,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = BridgeListener::bind(&config.listen).await?;
        let limiter = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));
        let relay = Arc::new(Relay::new(config.relay.clone(), connector));

        Ok(Self {
            config,
            listener,
            relay,
            connection_ids: ConnectionIdGenerator::new(),
            limiter,
            tracker: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &BridgeServerConfig {
        &self.config
    }

    /// The endpoint actually bound
    pub fn local_endpoint(&self) -> Result<Endpoint, ServerError> {
        Ok(self.listener.local_endpoint()?)
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then wait up to the
    /// drain timeout for running relays.
    pub async fn serve_with_shutdown<F>(mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            "{} listening on {} and forwarding to {} ({} mode)",
            self.config.name,
            self.local_endpoint()?,
            self.config.target,
            self.config.relay.mode
        );

        loop {
            let permit = match &self.limiter {
                Some(limiter) => {
                    let limiter = limiter.clone();
                    tokio::select! {
                        permit = limiter.acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                        _ = &mut shutdown => break,
                    }
                }
                None => None,
            };

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = &mut shutdown => break,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_relay(stream, peer, permit),
                Err(e) => {
                    tokio::select! {
                        _ = accept_backoff(&self.config.name, &e) => {}
                        _ = &mut shutdown => break,
                    }
                }
            }
        }

        info!("{} stopped accepting connections", self.config.name);
        self.drain().await;
        Ok(())
    }

    fn spawn_relay(
        &self,
        stream: BridgeStream,
        peer: PeerAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let connection_id = self.connection_ids.generate();
        info!(
            service = %self.config.name,
            connection_id = connection_id,
            peer = %peer,
            "Accepted connection"
        );

        let relay = self.relay.clone();
        let service = self.config.name.clone();
        self.tracker.spawn(async move {
            // Held until the relay finishes
            let _permit = permit;

            match relay.run(connection_id, stream).await {
                Ok(stats) => {
                    info!(
                        service = %service,
                        connection_id = connection_id,
                        peer = %peer,
                        bytes_to_target = stats.bytes_inbound_to_outbound,
                        bytes_to_client = stats.bytes_outbound_to_inbound,
                        turns = stats.turns,
                        closed_by = %stats.closed_by,
                        duration_ms = stats.duration.as_millis() as u64,
                        "Relay completed"
                    );
                }
                Err(RelayError::Dial(e)) => {
                    warn!(
                        service = %service,
                        connection_id = connection_id,
                        peer = %peer,
                        "Dropping connection, target unreachable: {}",
                        e
                    );
                }
                Err(e) => {
                    error!(
                        service = %service,
                        connection_id = connection_id,
                        peer = %peer,
                        "Relay failed: {}",
                        e
                    );
                }
            }
        });
    }

    async fn drain(&self) {
        self.tracker.close();

        let active = self.tracker.len();
        if active == 0 {
            return;
        }

        debug!(
            "{}: waiting up to {:?} for {} active relay(s)",
            self.config.name, self.config.drain_timeout, active
        );
        if tokio::time::timeout(self.config.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{}: {} relay(s) still active after drain timeout",
                self.config.name,
                self.tracker.len()
            );
        }
    }
}

async fn accept_backoff(service: &str, error: &TransportError) {
    error!("{}: failed to accept connection: {}", service, error);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_server_config() {
        let config = BridgeServerConfig::new(
            "tcp-to-vsock",
            "0.0.0.0:80".parse().unwrap(),
            "vsock:16:5005".parse().unwrap(),
        );
        assert_eq!(config.name, "tcp-to-vsock");
        assert_eq!(config.relay.chunk_size, 512);
        assert!(config.max_connections.is_none());
        assert_eq!(config.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = BridgeServerConfig::new(
            "bad",
            Endpoint::tcp("127.0.0.1", 0),
            Endpoint::vsock(3, 1),
        );
        config.max_connections = Some(0);
        assert!(config.validate().is_err());

        config.max_connections = Some(4);
        config.relay.chunk_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'bad'"));
    }

    #[test]
    fn test_connection_id_generator() {
        let gen = ConnectionIdGenerator::new();
        assert_eq!(gen.generate(), 1);

        let shared = gen.clone();
        assert_eq!(shared.generate(), 2);
        assert_eq!(gen.generate(), 3);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = BridgeServer::bind(BridgeServerConfig::new(
            "first",
            Endpoint::tcp("127.0.0.1", 0),
            Endpoint::tcp("127.0.0.1", 1),
        ))
        .await
        .unwrap();
        let taken = first.local_endpoint().unwrap();

        let result = BridgeServer::bind(BridgeServerConfig::new(
            "second",
            taken,
            Endpoint::tcp("127.0.0.1", 1),
        ))
        .await;
        assert!(matches!(
            result,
            Err(ServerError::Transport(TransportError::BindError { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_backs_off() {
        let error = TransportError::IoError(std::io::ErrorKind::Other.into());

        let start = tokio::time::Instant::now();
        accept_backoff("test", &error).await;
        assert!(start.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }
}
