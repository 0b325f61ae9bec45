//! Server endpoints and address resolution.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use remq_core::{RemqError, Result};

/// Host and port of a server node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host name or IP literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let rest = s.strip_prefix("redis://").unwrap_or(s);
        let rest = rest.trim_end_matches('/');

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| "expected host:port".to_string())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port '{}': {}", port, e))?;

        Ok(Endpoint::new(host, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(address: SocketAddr) -> Self {
        Endpoint::new(address.ip().to_string(), address.port())
    }
}

/// Trait for turning an endpoint into socket addresses to dial.
#[async_trait]
pub trait EndpointResolver: Send + Sync + fmt::Debug {
    /// Resolves the endpoint, returning candidate addresses in preference order.
    async fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<SocketAddr>>;
}

/// Resolution through the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl EndpointResolver for DnsResolver {
    async fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<SocketAddr>> {
        let addresses: Vec<SocketAddr> =
            tokio::net::lookup_host((endpoint.host(), endpoint.port()))
                .await
                .map_err(|e| {
                    RemqError::Connection(format!("failed to resolve {}: {}", endpoint, e))
                })?
                .collect();

        if addresses.is_empty() {
            return Err(RemqError::Connection(format!(
                "no addresses found for {}",
                endpoint
            )));
        }
        Ok(addresses)
    }
}

/// Resolution to a fixed list of addresses, ignoring the endpoint's host.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    addresses: Vec<SocketAddr>,
}

impl StaticResolver {
    /// Creates a static resolver with the given addresses.
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    /// Returns the configured addresses.
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<SocketAddr>> {
        if self.addresses.is_empty() {
            return Err(RemqError::Connection(format!(
                "no static addresses configured for {}",
                endpoint
            )));
        }
        Ok(self.addresses.clone())
    }
}
