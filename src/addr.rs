//! # Node Addresses
//!
//! A [`NodeAddr`] names one endpoint of the mesh: the address a node listens
//! on, a configured peer it dials, or the remote side of an accepted
//! connection. It derives two strings:
//!
//! | Derived | Format | Used for |
//! |---------|--------|----------|
//! | `identifier()` | `host_port` | Connection table key |
//! | `uri()` | `ws://host:port` | Dialing the endpoint |

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Error returned when a [`NodeAddr`] cannot be built from its parts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("host {0:?} contains characters that cannot appear in a URI authority")]
    InvalidHost(String),
}

/// An immutable `(host, port)` endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawNodeAddr", into = "RawNodeAddr")]
pub struct NodeAddr {
    host: String,
    port: u16,
}

#[derive(Serialize, Deserialize)]
struct RawNodeAddr {
    host: String,
    port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddrError> {
        let host = host.into();
        if host.is_empty() {
            return Err(AddrError::EmptyHost);
        }
        if host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(AddrError::InvalidHost(host));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stable key for the connection table: `host_port`.
    pub fn identifier(&self) -> String {
        format!("{}_{}", self.host, self.port)
    }

    /// WebSocket URI used to dial this endpoint.
    ///
    /// IPv6 literals are bracketed so the authority stays parseable.
    pub fn uri(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("ws://[{}]:{}", self.host, self.port)
        } else {
            format!("ws://{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for NodeAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl TryFrom<RawNodeAddr> for NodeAddr {
    type Error = AddrError;

    fn try_from(raw: RawNodeAddr) -> Result<Self, Self::Error> {
        Self::new(raw.host, raw.port)
    }
}

impl From<NodeAddr> for RawNodeAddr {
    fn from(addr: NodeAddr) -> Self {
        Self {
            host: addr.host,
            port: addr.port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_and_uri() {
        let addr = NodeAddr::new("example.org", 9001).unwrap();
        assert_eq!(addr.identifier(), "example.org_9001");
        assert_eq!(addr.uri(), "ws://example.org:9001");
        assert_eq!(addr.to_string(), "example.org:9001");
    }

    #[test]
    fn rejects_empty_and_malformed_hosts() {
        assert_eq!(NodeAddr::new("", 1), Err(AddrError::EmptyHost));
        assert!(matches!(NodeAddr::new("a b", 1), Err(AddrError::InvalidHost(_))));
        assert!(matches!(NodeAddr::new("host/path", 1), Err(AddrError::InvalidHost(_))));
    }

    #[test]
    fn from_socket_addr_brackets_ipv6_in_uri() {
        let v4: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(NodeAddr::from(v4).identifier(), "127.0.0.1_4000");

        let v6: SocketAddr = "[::1]:4000".parse().unwrap();
        let addr = NodeAddr::from(v6);
        assert_eq!(addr.identifier(), "::1_4000");
        assert_eq!(addr.uri(), "ws://[::1]:4000");
    }

    #[test]
    fn deserialization_validates_host() {
        let ok: NodeAddr = serde_yaml::from_str("{host: localhost, port: 9002}").unwrap();
        assert_eq!(ok.identifier(), "localhost_9002");

        let bad: Result<NodeAddr, _> = serde_yaml::from_str("{host: '', port: 9002}");
        assert!(bad.is_err());
    }
}
