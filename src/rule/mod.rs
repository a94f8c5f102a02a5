//! Rules: what to accept, where to relay and what to run.
//!
//! # Data Flow
//! ```text
//! TunnelRuleConfig / ServiceRuleConfig (TOML)
//!     → TunnelRule / ServiceRule (parsed addresses, stable UUIDs)
//!     → Rule (shared, immutable, replaced wholesale on update)
//! ```
//!
//! # Design Decisions
//! - Rules are immutable once built; an update swaps in a new `Arc`
//! - UUIDs left out of the config are derived from names, so a reloaded file
//!   maps onto the same rules
//! - Endpoint addresses are parsed once, when the rule is built

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::schema::{
    EndpointConfig, ListenerRefConfig, ServiceConfig, ServiceRuleConfig, TunnelRuleConfig,
};
use crate::endpoint::{parse_address, EndpointAddress};
use crate::error::{Error, Result};
use crate::net::connection::ConnectionSettings;

pub use crate::config::schema::ErrorsTreatment;

impl ErrorsTreatment {
    /// Log `message` for `rule` with this severity.
    pub fn report(&self, rule: &str, message: &str) {
        match self {
            ErrorsTreatment::Info => tracing::info!(rule, "{message}"),
            ErrorsTreatment::Warn => tracing::warn!(rule, "{message}"),
            ErrorsTreatment::Error => tracing::error!(rule, "{message}"),
        }
    }
}

/// Data listener reference: factory name plus free-form parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub name: String,
    pub param: String,
}

impl From<&ListenerRefConfig> for ListenerInfo {
    fn from(config: &ListenerRefConfig) -> Self {
        Self {
            name: config.name.clone(),
            param: config.param.clone(),
        }
    }
}

/// Read and write addresses of a rule endpoint.
#[derive(Debug, Clone)]
pub enum EndpointAddresses {
    Combined(Arc<dyn EndpointAddress>),
    Split {
        read: Arc<dyn EndpointAddress>,
        write: Arc<dyn EndpointAddress>,
    },
}

impl EndpointAddresses {
    pub fn read(&self) -> &Arc<dyn EndpointAddress> {
        match self {
            EndpointAddresses::Combined(address) => address,
            EndpointAddresses::Split { read, .. } => read,
        }
    }

    pub fn write(&self) -> &Arc<dyn EndpointAddress> {
        match self {
            EndpointAddresses::Combined(address) => address,
            EndpointAddresses::Split { write, .. } => write,
        }
    }

    pub fn is_combined(&self) -> bool {
        matches!(self, EndpointAddresses::Combined(_))
    }
}

impl fmt::Display for EndpointAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddresses::Combined(address) => f.write_str(&address.resource_identifier()),
            EndpointAddresses::Split { read, write } => write!(
                f,
                "{} / {}",
                read.resource_identifier(),
                write.resource_identifier()
            ),
        }
    }
}

/// One input or destination of a tunnel rule.
#[derive(Debug, Clone)]
pub struct RuleEndpoint {
    pub uuid: Uuid,
    pub addresses: EndpointAddresses,
    /// Accepting input; false for static inputs that dial out.
    pub is_acceptor: bool,
    pub open_timeout: Duration,
    /// Zero disables the idle timeout.
    pub idle_timeout: Duration,
    pub pre_listeners: Vec<ListenerInfo>,
    pub post_listeners: Vec<ListenerInfo>,
}

impl RuleEndpoint {
    pub fn from_config(config: &EndpointConfig, fallback_uuid: Uuid) -> Result<Self> {
        let addresses = match (&config.address, &config.read_address, &config.write_address) {
            (Some(address), None, None) => EndpointAddresses::Combined(parse_address(address)?),
            (None, Some(read), Some(write)) => EndpointAddresses::Split {
                read: parse_address(read)?,
                write: parse_address(write)?,
            },
            _ => {
                return Err(Error::Endpoint(
                    "endpoint needs either \"address\" or both \"read_address\" and \"write_address\""
                        .to_string(),
                ))
            }
        };
        Ok(Self {
            uuid: config.uuid.unwrap_or(fallback_uuid),
            addresses,
            is_acceptor: config.acceptor,
            open_timeout: Duration::from_secs(config.open_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            pre_listeners: config.pre_listeners.iter().map(ListenerInfo::from).collect(),
            post_listeners: config.post_listeners.iter().map(ListenerInfo::from).collect(),
        })
    }

    /// Worker-wide settings with this endpoint's timeouts applied.
    pub fn connection_settings(&self, base: &ConnectionSettings) -> ConnectionSettings {
        ConnectionSettings {
            open_timeout: self.open_timeout,
            idle_timeout: self.idle_timeout,
            ..*base
        }
    }
}

/// Accept on inputs, relay to the first working destination.
#[derive(Debug, Clone)]
pub struct TunnelRule {
    pub uuid: Uuid,
    pub name: String,
    pub enabled: bool,
    pub errors_treatment: ErrorsTreatment,
    pub inputs: Vec<Arc<RuleEndpoint>>,
    /// Tried in order.
    pub destinations: Vec<Arc<RuleEndpoint>>,
    pub filters: Vec<String>,
    /// Zero means unlimited.
    pub accepted_connections_limit: u64,
}

impl TunnelRule {
    pub fn from_config(config: &TunnelRuleConfig) -> Result<Self> {
        let uuid = config.uuid.unwrap_or_else(|| derive_uuid(&config.name));
        let endpoints = |list: &[EndpointConfig], role: &str, acceptor: Option<bool>| {
            list.iter()
                .enumerate()
                .map(|(index, endpoint)| -> Result<Arc<RuleEndpoint>> {
                    let fallback = derive_uuid(&format!("{uuid}/{role}/{index}"));
                    let mut endpoint = RuleEndpoint::from_config(endpoint, fallback)?;
                    if let Some(acceptor) = acceptor {
                        endpoint.is_acceptor = acceptor;
                    }
                    Ok(Arc::new(endpoint))
                })
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self {
            uuid,
            name: config.name.clone(),
            enabled: config.enabled,
            errors_treatment: config.errors_treatment,
            inputs: endpoints(&config.inputs, "input", None)?,
            destinations: endpoints(&config.destinations, "destination", Some(false))?,
            filters: config.filters.clone(),
            accepted_connections_limit: config.accepted_connections_limit,
        })
    }

    /// Input or destination with `uuid`.
    pub fn find_endpoint(&self, uuid: Uuid) -> Option<&Arc<RuleEndpoint>> {
        self.inputs
            .iter()
            .chain(self.destinations.iter())
            .find(|endpoint| endpoint.uuid == uuid)
    }
}

/// Service descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub name: String,
    pub param: String,
}

/// Rule that only runs services.
#[derive(Debug, Clone)]
pub struct ServiceRule {
    pub uuid: Uuid,
    pub name: String,
    pub enabled: bool,
    pub errors_treatment: ErrorsTreatment,
    pub services: Vec<ServiceInfo>,
}

impl ServiceRule {
    pub fn from_config(config: &ServiceRuleConfig) -> Self {
        let uuid = config.uuid.unwrap_or_else(|| derive_uuid(&config.name));
        let services = config
            .services
            .iter()
            .enumerate()
            .map(|(index, service): (usize, &ServiceConfig)| ServiceInfo {
                uuid: service
                    .uuid
                    .unwrap_or_else(|| derive_uuid(&format!("{uuid}/service/{index}"))),
                name: service.name.clone(),
                param: service.param.clone(),
            })
            .collect();
        Self {
            uuid,
            name: config.name.clone(),
            enabled: config.enabled,
            errors_treatment: config.errors_treatment,
            services,
        }
    }
}

/// Any rule the server worker can run.
#[derive(Debug, Clone)]
pub enum Rule {
    Tunnel(Arc<TunnelRule>),
    Service(Arc<ServiceRule>),
}

impl Rule {
    pub fn uuid(&self) -> Uuid {
        match self {
            Rule::Tunnel(rule) => rule.uuid,
            Rule::Service(rule) => rule.uuid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Rule::Tunnel(rule) => &rule.name,
            Rule::Service(rule) => &rule.name,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Rule::Tunnel(rule) => rule.enabled,
            Rule::Service(rule) => rule.enabled,
        }
    }

    pub fn errors_treatment(&self) -> ErrorsTreatment {
        match self {
            Rule::Tunnel(rule) => rule.errors_treatment,
            Rule::Service(rule) => rule.errors_treatment,
        }
    }
}

impl From<TunnelRule> for Rule {
    fn from(rule: TunnelRule) -> Self {
        Rule::Tunnel(Arc::new(rule))
    }
}

impl From<ServiceRule> for Rule {
    fn from(rule: ServiceRule) -> Self {
        Rule::Service(Arc::new(rule))
    }
}

/// Stable UUID for a name.
pub fn derive_uuid(name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}
