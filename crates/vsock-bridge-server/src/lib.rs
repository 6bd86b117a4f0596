//! Bridge server
//!
//! Binds a listener in one socket domain and, for every accepted connection,
//! spawns an independent relay to a fixed target in the other domain.

mod server;

pub use server::{
    BridgeServer, BridgeServerConfig, ConnectionIdGenerator, ServerError, DEFAULT_DRAIN_TIMEOUT,
};
