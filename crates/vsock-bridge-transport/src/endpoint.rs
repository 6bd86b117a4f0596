//! Endpoint descriptors for both socket domains

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::TransportError;

/// Wildcard context id: accept connections addressed to any CID
pub const VSOCK_CID_ANY: u32 = u32::MAX;

/// Context id of the host
pub const VSOCK_CID_HOST: u32 = 2;

/// Loopback context id
pub const VSOCK_CID_LOCAL: u32 = 1;

/// Socket address family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Tcp,
    Vsock,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Tcp => write!(f, "TCP"),
            Domain::Vsock => write!(f, "VSOCK"),
        }
    }
}

/// A bind or dial target in one of the two domains.
///
/// Textual forms:
/// - `tcp:HOST:PORT` or plain `HOST:PORT` (IPv6 hosts in brackets)
/// - `vsock:CID:PORT` where `CID` is a number, `any`, `host` or `local`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Vsock { cid: u32, port: u32 },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn vsock(cid: u32, port: u32) -> Self {
        Endpoint::Vsock { cid, port }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Endpoint::Tcp { .. } => Domain::Tcp,
            Endpoint::Vsock { .. } => Domain::Vsock,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp:[{}]:{}", host, port)
            }
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Endpoint::Vsock { cid, port } => match *cid {
                VSOCK_CID_ANY => write!(f, "vsock:any:{}", port),
                cid => write!(f, "vsock:{}:{}", cid, port),
            },
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if let Some(rest) = trimmed.strip_prefix("vsock:") {
            let (cid, port) = rest
                .split_once(':')
                .ok_or_else(|| invalid("expected vsock:CID:PORT"))?;
            let cid = parse_cid(cid)
                .ok_or_else(|| invalid("CID must be a number, 'any', 'host' or 'local'"))?;
            let port = port
                .parse::<u32>()
                .map_err(|_| invalid("vsock port must be a 32-bit unsigned integer"))?;
            return Ok(Endpoint::Vsock { cid, port });
        }

        let rest = trimmed.strip_prefix("tcp:").unwrap_or(trimmed);
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected HOST:PORT"))?;

        let (host, bracketed) = match host.strip_prefix('[') {
            Some(inner) => (
                inner
                    .strip_suffix(']')
                    .ok_or_else(|| invalid("unbalanced '[' in host"))?,
                true,
            ),
            None => (host, false),
        };
        if host.is_empty() {
            return Err(invalid("host cannot be empty"));
        }
        if host.contains(['[', ']']) {
            return Err(invalid("unbalanced brackets in host"));
        }
        if host.contains(':') && !bracketed {
            return Err(invalid("IPv6 hosts must be written in brackets"));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("TCP port must be between 0 and 65535"))?;

        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Parse a context id: a number, `any`, `host` or `local`
pub fn parse_cid(cid: &str) -> Option<u32> {
    match cid {
        "any" => Some(VSOCK_CID_ANY),
        "host" => Some(VSOCK_CID_HOST),
        "local" => Some(VSOCK_CID_LOCAL),
        other => other.parse().ok(),
    }
}

/// Address of an accepted peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_endpoints() {
        assert_eq!(
            "tcp:0.0.0.0:80".parse::<Endpoint>().unwrap(),
            Endpoint::tcp("0.0.0.0", 80)
        );
        assert_eq!(
            "127.0.0.1:3000".parse::<Endpoint>().unwrap(),
            Endpoint::tcp("127.0.0.1", 3000)
        );
        assert_eq!(
            "localhost:8080".parse::<Endpoint>().unwrap(),
            Endpoint::tcp("localhost", 8080)
        );
        assert_eq!(
            "tcp:[::1]:9000".parse::<Endpoint>().unwrap(),
            Endpoint::tcp("::1", 9000)
        );
    }

    #[test]
    fn test_parse_vsock_endpoints() {
        assert_eq!(
            "vsock:16:5005".parse::<Endpoint>().unwrap(),
            Endpoint::vsock(16, 5005)
        );
        assert_eq!(
            "vsock:any:5005".parse::<Endpoint>().unwrap(),
            Endpoint::vsock(VSOCK_CID_ANY, 5005)
        );
        assert_eq!(
            "vsock:host:7601".parse::<Endpoint>().unwrap(),
            Endpoint::vsock(VSOCK_CID_HOST, 7601)
        );
    }

    #[test]
    fn test_parse_invalid_endpoints() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!("localhost:".parse::<Endpoint>().is_err());
        assert!(":8080".parse::<Endpoint>().is_err());
        assert!("tcp:localhost:99999".parse::<Endpoint>().is_err());
        assert!("tcp:::1:80".parse::<Endpoint>().is_err());
        assert!("tcp:[::1:80".parse::<Endpoint>().is_err());
        assert!("::1]:80".parse::<Endpoint>().is_err());
        assert!("[[::1]]:80".parse::<Endpoint>().is_err());
        assert!("vsock:16".parse::<Endpoint>().is_err());
        assert!("vsock:guest:5005".parse::<Endpoint>().is_err());
        assert!("vsock:16:port".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display_is_parseable() {
        for text in [
            "tcp:127.0.0.1:80",
            "tcp:[::1]:443",
            "vsock:16:5005",
            "vsock:any:5005",
        ] {
            let endpoint: Endpoint = text.parse().unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn test_endpoint_serde_uses_text_form() {
        let endpoint: Endpoint = serde_yaml::from_str("\"vsock:any:5005\"").unwrap();
        assert_eq!(endpoint, Endpoint::vsock(VSOCK_CID_ANY, 5005));

        let yaml = serde_yaml::to_string(&Endpoint::tcp("127.0.0.1", 3000)).unwrap();
        assert!(yaml.contains("tcp:127.0.0.1:3000"));

        assert!(serde_yaml::from_str::<Endpoint>("\"vsock:nope\"").is_err());
    }

    #[test]
    fn test_domain() {
        assert_eq!(Endpoint::tcp("localhost", 1).domain(), Domain::Tcp);
        assert_eq!(Endpoint::vsock(3, 1).domain(), Domain::Vsock);
        assert_eq!(Domain::Vsock.to_string(), "VSOCK");
    }

    #[test]
    fn test_peer_addr_display() {
        let peer = PeerAddr::Tcp("10.0.0.1:5555".parse().unwrap());
        assert_eq!(peer.to_string(), "10.0.0.1:5555");
        assert_eq!(
            PeerAddr::Vsock { cid: 3, port: 1024 }.to_string(),
            "vsock:3:1024"
        );
    }
}
