//! Dial, forward, teardown

use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use vsock_bridge_transport::{BridgeStream, Connector, TransportError};

use crate::{ForwardingMode, RelayConfig};

/// One half of a connection pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Inbound,
    Outbound,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Inbound => write!(f, "inbound"),
            Side::Outbound => write!(f, "outbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
        }
    }
}

/// Errors that end a single relay
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Dial failed: {0}")]
    Dial(#[from] TransportError),

    #[error("{side} {operation} failed: {source}")]
    Io {
        side: Side,
        operation: Operation,
        source: std::io::Error,
    },
}

impl RelayError {
    fn io(side: Side, operation: Operation) -> impl FnOnce(std::io::Error) -> Self {
        move |source| RelayError::Io {
            side,
            operation,
            source,
        }
    }
}

/// Summary of a finished relay
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub connection_id: u64,
    pub bytes_inbound_to_outbound: u64,
    pub bytes_outbound_to_inbound: u64,
    /// Completed request/response exchanges (turn-taking mode only)
    pub turns: u64,
    /// The side whose orderly close ended the loop
    pub closed_by: Side,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Transfer {
    to_outbound: u64,
    to_inbound: u64,
    turns: u64,
}

/// Forwards one connection pair.
///
/// The relay holds no per-connection state itself, so a single instance can
/// be shared by every connection a listener accepts.
pub struct Relay<C> {
    config: RelayConfig,
    connector: C,
}

impl<C: Connector> Relay<C> {
    pub fn new(config: RelayConfig, connector: C) -> Self {
        Self { config, connector }
    }

    /// Run the relay for an accepted connection.
    ///
    /// Dials the target, forwards until either side closes or an I/O error
    /// occurs, then shuts down both connections. The inbound connection is
    /// closed on every path, including a failed dial.
    pub async fn run(
        &self,
        connection_id: u64,
        mut inbound: BridgeStream,
    ) -> Result<RelayStats, RelayError> {
        let started_at = chrono::Utc::now();
        let start = Instant::now();

        let mut outbound = match self.connector.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = inbound.shutdown().await;
                return Err(RelayError::Dial(e));
            }
        };

        debug!(
            connection_id = connection_id,
            target = %self.connector.target(),
            mode = %self.config.mode,
            "Connected to target"
        );

        let mut transfer = Transfer::default();
        let result = match self.config.mode {
            ForwardingMode::TurnTaking => {
                forward_turns(
                    connection_id,
                    &mut inbound,
                    &mut outbound,
                    self.config.chunk_size,
                    &mut transfer,
                )
                .await
            }
            ForwardingMode::Duplex => {
                forward_duplex(
                    &mut inbound,
                    &mut outbound,
                    self.config.chunk_size,
                    &mut transfer,
                )
                .await
            }
        };

        debug!(connection_id = connection_id, "Loop finished, closing both sockets");
        close_both(inbound, outbound).await;

        let closed_by = result?;
        Ok(RelayStats {
            connection_id,
            bytes_inbound_to_outbound: transfer.to_outbound,
            bytes_outbound_to_inbound: transfer.to_inbound,
            turns: transfer.turns,
            closed_by,
            started_at,
            duration: start.elapsed(),
        })
    }
}

/// Strict turn order: inbound read, outbound write, outbound read, inbound
/// write. Returns the side that closed.
async fn forward_turns(
    connection_id: u64,
    inbound: &mut BridgeStream,
    outbound: &mut BridgeStream,
    chunk_size: usize,
    transfer: &mut Transfer,
) -> Result<Side, RelayError> {
    let mut buffer = vec![0u8; chunk_size];

    loop {
        trace!(connection_id = connection_id, "Waiting for data from inbound");
        let n = inbound
            .read(&mut buffer)
            .await
            .map_err(RelayError::io(Side::Inbound, Operation::Read))?;
        if n == 0 {
            debug!(connection_id = connection_id, "Inbound closed");
            return Ok(Side::Inbound);
        }

        trace!(connection_id = connection_id, "Got {} bytes from inbound", n);
        outbound
            .write_all(&buffer[..n])
            .await
            .map_err(RelayError::io(Side::Outbound, Operation::Write))?;
        outbound
            .flush()
            .await
            .map_err(RelayError::io(Side::Outbound, Operation::Write))?;
        transfer.to_outbound += n as u64;

        trace!(connection_id = connection_id, "Waiting for data from outbound");
        let n = outbound
            .read(&mut buffer)
            .await
            .map_err(RelayError::io(Side::Outbound, Operation::Read))?;
        if n == 0 {
            debug!(connection_id = connection_id, "Outbound closed");
            return Ok(Side::Outbound);
        }

        trace!(connection_id = connection_id, "Got {} bytes from outbound", n);
        inbound
            .write_all(&buffer[..n])
            .await
            .map_err(RelayError::io(Side::Inbound, Operation::Write))?;
        inbound
            .flush()
            .await
            .map_err(RelayError::io(Side::Inbound, Operation::Write))?;
        transfer.to_inbound += n as u64;
        transfer.turns += 1;
    }
}

/// Both directions at once, each in `chunk_size` reads. An orderly close on
/// one side is passed on as a write shutdown to the other, and forwarding
/// ends once both directions have closed. Returns the side that closed first.
async fn forward_duplex(
    inbound: &mut BridgeStream,
    outbound: &mut BridgeStream,
    chunk_size: usize,
    transfer: &mut Transfer,
) -> Result<Side, RelayError> {
    let (mut inbound_read, mut inbound_write) = tokio::io::split(inbound);
    let (mut outbound_read, mut outbound_write) = tokio::io::split(outbound);

    let ((to_outbound, inbound_closed_at), (to_inbound, outbound_closed_at)) = tokio::try_join!(
        pump(&mut inbound_read, &mut outbound_write, Side::Inbound, chunk_size),
        pump(&mut outbound_read, &mut inbound_write, Side::Outbound, chunk_size),
    )?;

    transfer.to_outbound = to_outbound;
    transfer.to_inbound = to_inbound;
    if outbound_closed_at < inbound_closed_at {
        Ok(Side::Outbound)
    } else {
        Ok(Side::Inbound)
    }
}

/// Copy from the `from` side to the opposite side until `from` closes.
/// Returns the bytes copied and when the close was seen.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: Side,
    chunk_size: usize,
) -> Result<(u64, Instant), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let to = match from {
        Side::Inbound => Side::Outbound,
        Side::Outbound => Side::Inbound,
    };
    let mut buffer = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(RelayError::io(from, Operation::Read))?;
        if n == 0 {
            let closed_at = Instant::now();
            trace!("{} closed, shutting down {} writes", from, to);
            // The peer may already be gone
            let _ = writer.shutdown().await;
            return Ok((total, closed_at));
        }

        writer
            .write_all(&buffer[..n])
            .await
            .map_err(RelayError::io(to, Operation::Write))?;
        writer
            .flush()
            .await
            .map_err(RelayError::io(to, Operation::Write))?;
        total += n as u64;
    }
}

/// Best-effort: shutdown errors are ignored and both streams are dropped.
async fn close_both(mut inbound: BridgeStream, mut outbound: BridgeStream) {
    let _ = inbound.shutdown().await;
    let _ = outbound.shutdown().await;
}
