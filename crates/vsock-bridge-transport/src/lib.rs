//! Transport layer for the vsock bridge
//!
//! This crate hides the difference between the two socket domains the bridge
//! moves bytes between: ordinary TCP sockets and hypervisor virtual sockets
//! (`AF_VSOCK`). Everything above it works with [`Endpoint`] descriptors,
//! [`BridgeListener`]s and type-erased [`BridgeStream`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          vsock-bridge-server / vsock-bridge-relay     │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!                          │ Endpoint, BridgeListener, Connector
//!                          ↓
//! ┌──────────────────────────────────────────────────────┐
//! │           vsock-bridge-transport (this crate)         │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!             ┌────────────┴────────────┐
//!             ↓                         ↓
//!      tokio::net (TCP)         tokio-vsock (Linux only)
//! ```

mod connector;
mod endpoint;
mod listener;
mod vsock;

pub use connector::{dial, Connector, EndpointConnector};
pub use endpoint::{
    parse_cid, Domain, Endpoint, PeerAddr, VSOCK_CID_ANY, VSOCK_CID_HOST, VSOCK_CID_LOCAL,
};
pub use listener::BridgeListener;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint '{input}': {reason}")]
    InvalidEndpoint { input: String, reason: String },

    #[error("Failed to bind to {endpoint}: {source}")]
    BindError {
        endpoint: Endpoint,
        source: std::io::Error,
    },

    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectionFailed {
        endpoint: Endpoint,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{domain} sockets are not supported on this platform")]
    Unsupported { domain: Domain },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Any full-duplex byte stream the bridge can carry.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected stream in either domain.
pub type BridgeStream = Box<dyn AsyncStream>;
