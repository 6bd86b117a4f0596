//! Connection-pair relay
//!
//! A [`Relay`] owns one accepted (inbound) connection and one freshly dialed
//! (outbound) connection and shuttles bytes between them until either side
//! closes or fails, then closes both.

mod config;
mod relay;

pub use config::{ForwardingMode, RelayConfig, DEFAULT_CHUNK_SIZE};
pub use relay::{Operation, Relay, RelayError, RelayStats, Side};
