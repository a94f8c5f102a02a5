//! Endpoint addresses.
//!
//! # Data Flow
//! ```text
//! "tcp://host:port" / "udp://host:port"
//!     → parse_address (closed set of kinds)
//!     → EndpointAddress capability trait
//!         open_for_incoming_connections → Acceptor (accept loops)
//!         create_remote_connection      → Connection (destination side)
//!         create_local_connection       → Connection (static input side)
//! ```
//!
//! # Design Decisions
//! - Kinds are a closed enum; behaviour is one trait per kind, no hierarchy
//! - Read and write sides of a rule endpoint may point at different addresses
//! - Factory methods return `'static` futures so callers can hand them to any task

pub mod tcp;
pub mod udp;

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::{Error, Result};
use crate::net::acceptor::Acceptor;
use crate::net::connection::{Connection, ConnectionSettings};
use crate::rule::RuleEndpoint;

pub use tcp::TcpEndpointAddress;
pub use udp::UdpEndpointAddress;

/// Protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Tcp,
    Udp,
}

impl EndpointKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            EndpointKind::Tcp => "tcp",
            EndpointKind::Udp => "udp",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Some(EndpointKind::Tcp),
            "udp" => Some(EndpointKind::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// What an endpoint address can do.
pub trait EndpointAddress: Send + Sync + fmt::Debug {
    fn kind(&self) -> EndpointKind;

    /// Canonical `scheme://address` form.
    fn resource_identifier(&self) -> String;

    /// Multi-client endpoints can listen and accept many connections.
    fn is_has_multi_clients_type(&self) -> bool;

    fn open_for_incoming_connections(
        self: Arc<Self>,
        endpoint: Arc<RuleEndpoint>,
        settings: ConnectionSettings,
    ) -> BoxFuture<'static, Result<Arc<dyn Acceptor>>>;

    /// Dial a destination.
    fn create_remote_connection(
        self: Arc<Self>,
        endpoint: Arc<RuleEndpoint>,
        settings: ConnectionSettings,
    ) -> BoxFuture<'static, Result<Arc<Connection>>>;

    /// Open the input side of a static (push) tunnel.
    fn create_local_connection(
        self: Arc<Self>,
        endpoint: Arc<RuleEndpoint>,
        settings: ConnectionSettings,
    ) -> BoxFuture<'static, Result<Arc<Connection>>>;

    fn is_ready_to_recreate_local_connection(&self) -> bool;

    fn is_ready_to_recreate_remote_connection(&self) -> bool;
}

/// Parse a resource identifier into an endpoint address.
pub fn parse_address(resource: &str) -> Result<Arc<dyn EndpointAddress>> {
    let (scheme, rest) = resource
        .split_once("://")
        .ok_or_else(|| Error::Endpoint(format!("\"{resource}\" has no protocol part")))?;
    let kind = EndpointKind::from_scheme(scheme)
        .ok_or_else(|| Error::Endpoint(format!("unknown endpoint protocol \"{scheme}\"")))?;
    if rest.is_empty() {
        return Err(Error::Endpoint(format!("\"{resource}\" has no address part")));
    }
    Ok(match kind {
        EndpointKind::Tcp => Arc::new(TcpEndpointAddress::new(rest)),
        EndpointKind::Udp => Arc::new(UdpEndpointAddress::new(rest)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_schemes() {
        let tcp = parse_address("tcp://127.0.0.1:80").unwrap();
        assert_eq!(tcp.kind(), EndpointKind::Tcp);
        assert_eq!(tcp.resource_identifier(), "tcp://127.0.0.1:80");
        let udp = parse_address("UDP://localhost:53").unwrap();
        assert_eq!(udp.kind(), EndpointKind::Udp);
        assert!(udp.is_has_multi_clients_type());
    }

    #[test]
    fn rejects_unknown_or_malformed() {
        assert!(matches!(parse_address("pipe://x"), Err(Error::Endpoint(_))));
        assert!(matches!(parse_address("127.0.0.1:80"), Err(Error::Endpoint(_))));
        assert!(matches!(parse_address("tcp://"), Err(Error::Endpoint(_))));
    }
}
