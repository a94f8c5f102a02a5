//! TunnelEx: rule-driven TCP/UDP relay server library

pub mod buffer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod license;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod rule;
pub mod server;
pub mod service;
pub mod tunnel;

pub use config::schema::ServerConfig;
pub use error::{Error, Result};
pub use lifecycle::Shutdown;
pub use rule::{Rule, ServiceRule, TunnelRule};
pub use server::{ServerWorker, WorkerOptions};
