//! AF_VSOCK sockets via tokio-vsock
//!
//! Virtual sockets only exist on Linux hosts and guests. On other platforms
//! every operation reports [`TransportError::Unsupported`].

#[cfg(target_os = "linux")]
pub(crate) use linux::*;

#[cfg(not(target_os = "linux"))]
pub(crate) use unsupported::*;

#[cfg(target_os = "linux")]
mod linux {
    use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

    use crate::{BridgeStream, Endpoint, PeerAddr, TransportError, TransportResult};

    pub(crate) type Listener = VsockListener;

    pub(crate) fn bind(cid: u32, port: u32) -> TransportResult<Listener> {
        VsockListener::bind(VsockAddr::new(cid, port)).map_err(|source| {
            TransportError::BindError {
                endpoint: Endpoint::vsock(cid, port),
                source,
            }
        })
    }

    pub(crate) async fn accept(
        listener: &mut Listener,
    ) -> TransportResult<(BridgeStream, PeerAddr)> {
        let (stream, addr) = listener.accept().await?;
        let peer = PeerAddr::Vsock {
            cid: addr.cid(),
            port: addr.port(),
        };
        Ok((Box::new(stream), peer))
    }

    pub(crate) fn local_endpoint(listener: &Listener) -> TransportResult<Endpoint> {
        let addr = listener.local_addr()?;
        Ok(Endpoint::vsock(addr.cid(), addr.port()))
    }

    pub(crate) async fn connect(cid: u32, port: u32) -> TransportResult<BridgeStream> {
        let stream = VsockStream::connect(VsockAddr::new(cid, port))
            .await
            .map_err(|source| TransportError::ConnectionFailed {
                endpoint: Endpoint::vsock(cid, port),
                source,
            })?;
        Ok(Box::new(stream))
    }
}

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use crate::{BridgeStream, Domain, Endpoint, PeerAddr, TransportError, TransportResult};

    /// Uninhabited: a vsock listener can never be bound here.
    pub(crate) enum Listener {}

    pub(crate) fn bind(_cid: u32, _port: u32) -> TransportResult<Listener> {
        Err(TransportError::Unsupported {
            domain: Domain::Vsock,
        })
    }

    pub(crate) async fn accept(
        listener: &mut Listener,
    ) -> TransportResult<(BridgeStream, PeerAddr)> {
        match *listener {}
    }

    pub(crate) fn local_endpoint(listener: &Listener) -> TransportResult<Endpoint> {
        match *listener {}
    }

    pub(crate) async fn connect(_cid: u32, _port: u32) -> TransportResult<BridgeStream> {
        Err(TransportError::Unsupported {
            domain: Domain::Vsock,
        })
    }
}
