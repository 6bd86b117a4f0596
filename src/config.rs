//! Service configuration
//!
//! Services come either from a subcommand's flags or from a YAML file:
//!
//! ```yaml
//! services:
//!   - name: tcp-to-vsock
//!     listen: "tcp:0.0.0.0:80"
//!     target: "vsock:16:5005"
//!   - name: vsock-to-tcp
//!     listen: "vsock:any:5005"
//!     target: "tcp:127.0.0.1:3000"
//!     mode: duplex
//!     max_connections: 64
//! ```
//!
//! Command-line flags override the per-service file values, which override
//! the built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use vsock_bridge_relay::{ForwardingMode, RelayConfig, DEFAULT_CHUNK_SIZE};
use vsock_bridge_server::{BridgeServerConfig, DEFAULT_DRAIN_TIMEOUT};
use vsock_bridge_transport::{parse_cid, Domain, Endpoint};

pub const DEFAULT_TCP_LISTEN: &str = "0.0.0.0:80";
pub const DEFAULT_TCP_TARGET: &str = "127.0.0.1:3000";
pub const DEFAULT_VSOCK_CID: u32 = 16;
pub const DEFAULT_VSOCK_PORT: u32 = 5005;

/// Configuration file format
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub services: Vec<ServiceConfig>,
}

/// One listener/target pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub listen: Endpoint,
    pub target: Endpoint,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ForwardingMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, listen: Endpoint, target: Endpoint) -> Self {
        Self {
            name: name.into(),
            listen,
            target,
            mode: None,
            chunk_size: None,
            max_connections: None,
            drain_timeout_secs: None,
        }
    }

    /// Resolve into a server configuration, applying `overrides` first and
    /// built-in defaults last.
    pub fn into_server_config(self, overrides: &ServiceOverrides) -> BridgeServerConfig {
        let relay = RelayConfig {
            chunk_size: overrides
                .chunk_size
                .or(self.chunk_size)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            mode: overrides.mode.or(self.mode).unwrap_or_default(),
        };
        let drain_timeout = overrides
            .drain_timeout_secs
            .or(self.drain_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT);

        let mut config = BridgeServerConfig::new(self.name, self.listen, self.target);
        config.relay = relay;
        config.max_connections = overrides.max_connections.or(self.max_connections);
        config.drain_timeout = drain_timeout;
        config
    }
}

/// Relay settings given on the command line
#[derive(Debug, Clone, Default)]
pub struct ServiceOverrides {
    pub mode: Option<ForwardingMode>,
    pub chunk_size: Option<usize>,
    pub max_connections: Option<usize>,
    pub drain_timeout_secs: Option<u64>,
}

/// Service A: TCP listener relaying to a vsock target
pub fn tcp_to_vsock(listen: Endpoint, cid: u32, port: u32) -> Result<ServiceConfig> {
    require_domain(&listen, Domain::Tcp, "listen")?;
    Ok(ServiceConfig::new("tcp-to-vsock", listen, Endpoint::vsock(cid, port)))
}

/// Service B: vsock listener relaying to a TCP target
pub fn vsock_to_tcp(cid: u32, port: u32, target: Endpoint) -> Result<ServiceConfig> {
    require_domain(&target, Domain::Tcp, "target")?;
    Ok(ServiceConfig::new("vsock-to-tcp", Endpoint::vsock(cid, port), target))
}

fn require_domain(endpoint: &Endpoint, domain: Domain, role: &str) -> Result<()> {
    if endpoint.domain() != domain {
        anyhow::bail!(
            "Invalid {} endpoint '{}': expected a {} endpoint",
            role,
            endpoint,
            domain
        );
    }
    Ok(())
}

/// Parse a context id flag: a number, `any`, `host` or `local`
pub fn parse_cid_arg(value: &str) -> Result<u32, String> {
    parse_cid(value).ok_or_else(|| {
        format!(
            "invalid CID '{}' (expected a number, any, host or local)",
            value
        )
    })
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Validate and resolve a set of services into server configurations
pub fn build_server_configs(
    services: Vec<ServiceConfig>,
    overrides: &ServiceOverrides,
) -> Result<Vec<BridgeServerConfig>> {
    if services.is_empty() {
        anyhow::bail!("No services configured");
    }

    let mut names = HashSet::new();
    for service in &services {
        if service.name.trim().is_empty() {
            anyhow::bail!("Service names cannot be empty");
        }
        if !names.insert(service.name.clone()) {
            anyhow::bail!("Duplicate service name: '{}'", service.name);
        }
    }

    services
        .into_iter()
        .map(|service| {
            let config = service.into_server_config(overrides);
            config
                .validate()
                .with_context(|| format!("Invalid service '{}'", config.name))?;
            Ok(config)
        })
        .collect()
}
