//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Thread pools and background loops.
    pub worker: WorkerConfig,

    /// Message block pools.
    pub buffer: BufferConfig,

    /// Capacity gate.
    pub license: LicenseConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Relay rules.
    pub tunnel_rules: Vec<TunnelRuleConfig>,

    /// Rules that only run services.
    pub service_rules: Vec<ServiceRuleConfig>,
}

/// Worker threads and background loop periods.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Proactor (I/O) threads. Values below 8 are raised to 8.
    pub proactor_threads: usize,

    /// Lower bound of the tunnel-opening pool.
    pub opening_threads_min: usize,

    /// Upper bound of the tunnel-opening pool.
    pub opening_threads_max: usize,

    /// Idle time after which a surplus opening thread exits.
    pub opening_thread_idle_secs: u64,

    /// Period of the retry loop for rules that did not fully open.
    pub rules_check_interval_secs: u64,

    /// Period of the services loop.
    pub services_interval_secs: u64,

    /// Period of the latency statistics dump. Zero disables it.
    pub stats_dump_interval_secs: u64,

    /// Time a closing connection may spend flushing queued writes.
    pub close_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            proactor_threads: 8,
            opening_threads_min: 4,
            opening_threads_max: 600,
            opening_thread_idle_secs: 30,
            rules_check_interval_secs: 30,
            services_interval_secs: 5,
            stats_dump_interval_secs: 60,
            close_timeout_secs: 5,
        }
    }
}

/// Message block pool sizing.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of one data block in bytes.
    pub block_size: usize,

    /// Pool byte budget per connection.
    pub connection_buffer_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            block_size: crate::buffer::DEFAULT_DATA_BLOCK_SIZE,
            connection_buffer_size: crate::buffer::DEFAULT_CONNECTION_BUFFER_SIZE,
        }
    }
}

/// Capacity limits. Zero means unlimited.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct LicenseConfig {
    pub max_rules: usize,
    pub max_tunnels: usize,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Severity used to report a rule's tunnel errors.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorsTreatment {
    Info,
    #[default]
    Warn,
    Error,
}

/// A `{name, param}` data listener reference.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListenerRefConfig {
    pub name: String,
    #[serde(default)]
    pub param: String,
}

/// One input or destination of a tunnel rule.
///
/// Either `address` (combined) or both `read_address` and `write_address`
/// (split) must be set.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    pub uuid: Option<Uuid>,
    pub address: Option<String>,
    pub read_address: Option<String>,
    pub write_address: Option<String>,

    /// Accepting input (listens) vs. static input (dials out). Ignored for
    /// destinations.
    pub acceptor: bool,

    pub open_timeout_secs: u64,

    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u64,

    pub pre_listeners: Vec<ListenerRefConfig>,
    pub post_listeners: Vec<ListenerRefConfig>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            address: None,
            read_address: None,
            write_address: None,
            acceptor: true,
            open_timeout_secs: 10,
            idle_timeout_secs: 0,
            pre_listeners: Vec::new(),
            post_listeners: Vec::new(),
        }
    }
}

/// Tunnel rule definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TunnelRuleConfig {
    /// Derived from the name when omitted.
    #[serde(default)]
    pub uuid: Option<Uuid>,

    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub errors_treatment: ErrorsTreatment,

    pub inputs: Vec<EndpointConfig>,

    pub destinations: Vec<EndpointConfig>,

    #[serde(default)]
    pub filters: Vec<String>,

    /// Zero means unlimited.
    #[serde(default)]
    pub accepted_connections_limit: u64,
}

/// Service descriptor inside a service rule.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub param: String,
}

/// Service rule definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceRuleConfig {
    #[serde(default)]
    pub uuid: Option<Uuid>,

    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub errors_treatment: ErrorsTreatment,

    pub services: Vec<ServiceConfig>,
}

fn default_enabled() -> bool {
    true
}
