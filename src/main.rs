//! vsock-bridge - relay byte streams between TCP and vsock sockets
//!
//! Lets a process that can only reach one address family (for example an
//! enclave that only speaks vsock) talk to a peer reachable only through the
//! other (for example a TCP service on the host), in either direction.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{ServiceConfig, ServiceOverrides};
use vsock_bridge_relay::ForwardingMode;
use vsock_bridge_server::{BridgeServer, BridgeServerConfig};
use vsock_bridge_transport::Endpoint;

/// vsock-bridge - relay connections between TCP and vsock
#[derive(Parser, Debug)]
#[command(name = "vsock-bridge")]
#[command(about = "Relay connections between TCP and vsock sockets")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "VSOCK_BRIDGE_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen on TCP and relay each connection to a vsock endpoint
    #[command(long_about = r#"
Listen on a TCP endpoint and relay every accepted connection to a fixed
vsock endpoint (context id + port).

EXAMPLES:
  # Expose an enclave service (CID 16, port 5005) on TCP port 80
  vsock-bridge tcp-to-vsock --listen 0.0.0.0:80 --cid 16 --port 5005
"#)]
    TcpToVsock {
        /// TCP endpoint to listen on
        #[arg(long, default_value = config::DEFAULT_TCP_LISTEN, env = "VSOCK_BRIDGE_LISTEN")]
        listen: Endpoint,

        /// Context id of the vsock target
        #[arg(long, default_value_t = config::DEFAULT_VSOCK_CID, value_parser = config::parse_cid_arg, env = "VSOCK_BRIDGE_CID")]
        cid: u32,

        /// Port of the vsock target
        #[arg(long, default_value_t = config::DEFAULT_VSOCK_PORT, env = "VSOCK_BRIDGE_PORT")]
        port: u32,

        #[command(flatten)]
        relay: RelayArgs,
    },

    /// Listen on vsock and relay each connection to a TCP endpoint
    #[command(long_about = r#"
Listen on a vsock port and relay every accepted connection to a fixed TCP
endpoint.

EXAMPLES:
  # Let guests reach a host service on 127.0.0.1:3000 via vsock port 5005
  vsock-bridge vsock-to-tcp --port 5005 --target 127.0.0.1:3000
"#)]
    VsockToTcp {
        /// vsock port to listen on
        #[arg(long, default_value_t = config::DEFAULT_VSOCK_PORT, env = "VSOCK_BRIDGE_PORT")]
        port: u32,

        /// Context id to bind (number, any, host or local)
        #[arg(long, default_value = "any", value_parser = config::parse_cid_arg, env = "VSOCK_BRIDGE_CID")]
        cid: u32,

        /// TCP endpoint to relay to
        #[arg(long, default_value = config::DEFAULT_TCP_TARGET, env = "VSOCK_BRIDGE_TARGET")]
        target: Endpoint,

        #[command(flatten)]
        relay: RelayArgs,
    },

    /// Run one bridge between arbitrary endpoints, or every service in a config file
    #[command(long_about = r#"
Run a single bridge between any two endpoints, or all services listed in a
YAML configuration file.

ENDPOINTS:
  tcp:HOST:PORT or HOST:PORT     TCP (IPv6 hosts in brackets)
  vsock:CID:PORT                 vsock; CID may be a number, any, host or local

EXAMPLES:
  vsock-bridge run --listen vsock:any:5005 --target tcp:127.0.0.1:3000
  vsock-bridge run --config bridge.yaml --mode duplex
"#)]
    Run {
        /// Endpoint to listen on
        #[arg(long, requires = "target", conflicts_with = "config")]
        listen: Option<Endpoint>,

        /// Endpoint to relay to
        #[arg(long, requires = "listen", conflicts_with = "config")]
        target: Option<Endpoint>,

        /// Service name used in logs
        #[arg(long, default_value = "bridge")]
        name: String,

        /// Configuration file (YAML)
        #[arg(long, short = 'c', env = "VSOCK_BRIDGE_CONFIG")]
        config: Option<PathBuf>,

        #[command(flatten)]
        relay: RelayArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct RelayArgs {
    /// Forwarding mode: turn-taking (default) or duplex
    #[arg(long, env = "VSOCK_BRIDGE_MODE")]
    mode: Option<ForwardingMode>,

    /// Maximum bytes read per forwarding step [default: 512]
    #[arg(long, env = "VSOCK_BRIDGE_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Maximum concurrent relays per service (unbounded if not set)
    #[arg(long, env = "VSOCK_BRIDGE_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Seconds to wait for active relays on shutdown [default: 5]
    #[arg(long)]
    drain_timeout: Option<u64>,
}

impl From<RelayArgs> for ServiceOverrides {
    fn from(args: RelayArgs) -> Self {
        ServiceOverrides {
            mode: args.mode,
            chunk_size: args.chunk_size,
            max_connections: args.max_connections,
            drain_timeout_secs: args.drain_timeout,
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Turn the parsed command into the list of services to run
fn services_from_command(command: Commands) -> Result<(Vec<ServiceConfig>, ServiceOverrides)> {
    match command {
        Commands::TcpToVsock {
            listen,
            cid,
            port,
            relay,
        } => Ok((vec![config::tcp_to_vsock(listen, cid, port)?], relay.into())),
        Commands::VsockToTcp {
            port,
            cid,
            target,
            relay,
        } => Ok((vec![config::vsock_to_tcp(cid, port, target)?], relay.into())),
        Commands::Run {
            listen,
            target,
            name,
            config: config_path,
            relay,
        } => {
            let services = match (config_path, listen, target) {
                (Some(path), _, _) => {
                    info!("Loading configuration from: {}", path.display());
                    config::load_config_file(&path)?.services
                }
                (None, Some(listen), Some(target)) => {
                    vec![ServiceConfig::new(name, listen, target)]
                }
                _ => anyhow::bail!("Either --config or both --listen and --target are required"),
            };
            Ok((services, relay.into()))
        }
    }
}

/// Bind every service, then serve them all until Ctrl+C
async fn run_services(configs: Vec<BridgeServerConfig>) -> Result<()> {
    // Bind everything first so a bad endpoint aborts startup
    let mut servers = Vec::with_capacity(configs.len());
    for config in configs {
        let name = config.name.clone();
        let listen = config.listen.clone();
        let server = BridgeServer::bind(config)
            .await
            .with_context(|| format!("Failed to start service '{}' on {}", name, listen))?;
        servers.push(server);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = futures::future::join_all(servers.into_iter().map(|server| {
        let mut shutdown = shutdown_rx.clone();
        server.serve_with_shutdown(async move {
            let _ = shutdown.changed().await;
        })
    }));
    tokio::pin!(serving);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
        results = &mut serving => {
            return collect_results(results);
        }
    }

    let _ = shutdown_tx.send(true);
    collect_results(serving.await)
}

fn collect_results(results: Vec<Result<(), vsock_bridge_server::ServerError>>) -> Result<()> {
    let mut first_error = None;
    for result in results {
        if let Err(e) = result {
            error!("Service error: {}", e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging first
    setup_logging(&cli.log_level, cli.verbose)?;

    let (services, overrides) = services_from_command(cli.command)?;
    let configs = config::build_server_configs(services, &overrides)
        .context("Failed to build service configuration")?;

    for config in &configs {
        info!(
            "Service {}: {} -> {} ({} mode, chunk size {})",
            config.name, config.listen, config.target, config.relay.mode, config.relay.chunk_size
        );
    }

    run_services(configs).await?;

    info!("vsock-bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_tcp_to_vsock_defaults() {
        let cli = Cli::try_parse_from(["vsock-bridge", "tcp-to-vsock"]).unwrap();
        let (services, overrides) = services_from_command(cli.command).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].listen, Endpoint::tcp("0.0.0.0", 80));
        assert_eq!(services[0].target, Endpoint::vsock(16, 5005));
        assert!(overrides.mode.is_none());
    }

    #[test]
    fn test_vsock_to_tcp_with_relay_flags() {
        let cli = Cli::try_parse_from([
            "vsock-bridge",
            "vsock-to-tcp",
            "--port",
            "7000",
            "--target",
            "127.0.0.1:8080",
            "--mode",
            "duplex",
            "--max-connections",
            "32",
        ])
        .unwrap();
        let (services, overrides) = services_from_command(cli.command).unwrap();
        assert_eq!(
            services[0].listen,
            Endpoint::vsock(vsock_bridge_transport::VSOCK_CID_ANY, 7000)
        );
        assert_eq!(services[0].target, Endpoint::tcp("127.0.0.1", 8080));
        assert_eq!(overrides.mode, Some(ForwardingMode::Duplex));
        assert_eq!(overrides.max_connections, Some(32));
    }

    #[test]
    fn test_run_requires_endpoints_or_config() {
        assert!(Cli::try_parse_from(["vsock-bridge", "run", "--listen", "vsock:any:1"]).is_err());

        let cli = Cli::try_parse_from(["vsock-bridge", "run"]).unwrap();
        assert!(services_from_command(cli.command).is_err());

        let cli = Cli::try_parse_from([
            "vsock-bridge",
            "run",
            "--listen",
            "vsock:any:5005",
            "--target",
            "tcp:127.0.0.1:3000",
            "--name",
            "guest-api",
        ])
        .unwrap();
        let (services, _) = services_from_command(cli.command).unwrap();
        assert_eq!(services[0].name, "guest-api");
    }

    #[test]
    fn test_invalid_endpoint_flag_rejected() {
        let bad_listen = ["vsock-bridge", "tcp-to-vsock", "--listen", "nowhere"];
        assert!(Cli::try_parse_from(bad_listen).is_err());

        let bad_cid = ["vsock-bridge", "vsock-to-tcp", "--cid", "guest"];
        assert!(Cli::try_parse_from(bad_cid).is_err());
    }
}
