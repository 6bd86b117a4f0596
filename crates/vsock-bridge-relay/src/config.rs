//! Relay configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest read per forwarding step
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// How bytes move between the two halves of a connection pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardingMode {
    /// Half-duplex: read a chunk from inbound, write it to outbound, read a
    /// chunk from outbound, write it to inbound, repeat. Only correct for
    /// strict request/response protocols.
    #[default]
    TurnTaking,

    /// Independent copying in both directions at once
    Duplex,
}

impl fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingMode::TurnTaking => write!(f, "turn-taking"),
            ForwardingMode::Duplex => write!(f, "duplex"),
        }
    }
}

impl FromStr for ForwardingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "turn-taking" | "turn_taking" | "half-duplex" => Ok(ForwardingMode::TurnTaking),
            "duplex" | "full-duplex" => Ok(ForwardingMode::Duplex),
            other => Err(format!(
                "unknown forwarding mode '{}' (expected turn-taking or duplex)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Upper bound on a single read from either side
    pub chunk_size: usize,
    pub mode: ForwardingMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            mode: ForwardingMode::TurnTaking,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk size must be greater than zero".to_string());
        }
        Ok(())
    }
}
