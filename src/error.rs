//! Error taxonomy shared by the engine.
//!
//! ```text
//! Connection
//!     └─ SourceConnectionOpening / DestinationConnectionOpening
//! Logical
//! System
//!     └─ InsufficientMemory
//! LicenseExceeded
//! Endpoint
//! ```

use thiserror::Error;

/// Which side of a tunnel a connection-opening failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSide {
    Source,
    Destination,
}

impl std::fmt::Display for ConnectionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionSide::Source => write!(f, "incoming"),
            ConnectionSide::Destination => write!(f, "outcoming"),
        }
    }
}

/// Errors produced by connections, tunnels and the server worker.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O level failure on an established connection.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A connection could not be opened or set up.
    #[error("opening new {side} connection for tunnel {tunnel} to the {address} is failed with the error \"{message}\"")]
    ConnectionOpening {
        side: ConnectionSide,
        tunnel: String,
        address: String,
        message: String,
    },

    /// Contract violation inside the engine (double open, wrong mode).
    #[error("logical error: {0}")]
    Logical(String),

    /// Operating system level failure.
    #[error("system error: {message}")]
    System {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Buffer pool exhausted even after growing it once.
    #[error("insufficient memory: {0}")]
    InsufficientMemory(String),

    /// The licensing gate refused to activate more objects.
    #[error("license exceeded: {0}")]
    LicenseExceeded(String),

    /// Endpoint description can not be used the requested way.
    #[error("endpoint error: {0}")]
    Endpoint(String),
}

impl Error {
    pub fn connection(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Connection {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn system(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::System {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn source_opening(
        tunnel: impl std::fmt::Display,
        address: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::ConnectionOpening {
            side: ConnectionSide::Source,
            tunnel: tunnel.to_string(),
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn destination_opening(
        tunnel: impl std::fmt::Display,
        address: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::ConnectionOpening {
            side: ConnectionSide::Destination,
            tunnel: tunnel.to_string(),
            address: address.into(),
            message: message.into(),
        }
    }

    /// True for destination-side opening failures, which are reported with the
    /// rule's configured severity.
    pub fn is_destination_opening(&self) -> bool {
        matches!(
            self,
            Error::ConnectionOpening {
                side: ConnectionSide::Destination,
                ..
            }
        )
    }

    pub fn is_license(&self) -> bool {
        matches!(self, Error::LicenseExceeded(_))
    }

    /// Memory exhaustion is a kind of system error.
    pub fn is_system(&self) -> bool {
        matches!(self, Error::System { .. } | Error::InsufficientMemory(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
