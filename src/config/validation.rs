//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every endpoint address parses
//! - Validate value ranges (pool bounds, intervals, block sizes)
//! - Detect rules sharing a UUID
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use uuid::Uuid;

use crate::config::schema::ServerConfig;
use crate::rule::{derive_uuid, TunnelRule};

/// One semantic problem, located by a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let worker = &config.worker;
    if worker.opening_threads_min == 0 {
        errors.push(ValidationError::new("worker.opening_threads_min", "must be at least 1"));
    }
    if worker.opening_threads_min > worker.opening_threads_max {
        errors.push(ValidationError::new(
            "worker.opening_threads_max",
            format!("must not be below opening_threads_min ({})", worker.opening_threads_min),
        ));
    }
    for (field, value) in [
        ("worker.opening_thread_idle_secs", worker.opening_thread_idle_secs),
        ("worker.rules_check_interval_secs", worker.rules_check_interval_secs),
        ("worker.services_interval_secs", worker.services_interval_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.buffer.block_size == 0 {
        errors.push(ValidationError::new("buffer.block_size", "must be greater than zero"));
    } else if config.buffer.connection_buffer_size < config.buffer.block_size {
        errors.push(ValidationError::new(
            "buffer.connection_buffer_size",
            "must hold at least one block",
        ));
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("\"{}\" is not a socket address", observability.metrics_address),
        ));
    }

    let mut seen: HashMap<Uuid, String> = HashMap::new();
    let mut claim = |uuid: Uuid, field: String, errors: &mut Vec<ValidationError>| {
        if let Some(first) = seen.get(&uuid) {
            errors.push(ValidationError::new(field, format!("UUID {uuid} is already used by {first}")));
        } else {
            seen.insert(uuid, field);
        }
    };

    for (index, rule) in config.tunnel_rules.iter().enumerate() {
        let field = format!("tunnel_rules[{index}]");
        if rule.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
        }
        if rule.inputs.is_empty() {
            errors.push(ValidationError::new(format!("{field}.inputs"), "at least one input is required"));
        }
        if rule.destinations.is_empty() {
            errors.push(ValidationError::new(
                format!("{field}.destinations"),
                "at least one destination is required",
            ));
        }
        if let Err(err) = TunnelRule::from_config(rule) {
            errors.push(ValidationError::new(field.clone(), err.to_string()));
        }
        claim(rule.uuid.unwrap_or_else(|| derive_uuid(&rule.name)), field, &mut errors);
    }

    for (index, rule) in config.service_rules.iter().enumerate() {
        let field = format!("service_rules[{index}]");
        if rule.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
        }
        claim(rule.uuid.unwrap_or_else(|| derive_uuid(&rule.name)), field, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{EndpointConfig, ServiceRuleConfig, TunnelRuleConfig};

    fn tunnel_rule(name: &str, address: &str) -> TunnelRuleConfig {
        TunnelRuleConfig {
            uuid: None,
            name: name.into(),
            enabled: true,
            errors_treatment: Default::default(),
            inputs: vec![EndpointConfig {
                address: Some(address.into()),
                ..EndpointConfig::default()
            }],
            destinations: vec![EndpointConfig {
                address: Some("tcp://127.0.0.1:9".into()),
                ..EndpointConfig::default()
            }],
            filters: vec![],
            accepted_connections_limit: 0,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.worker.opening_threads_min = 10;
        config.worker.opening_threads_max = 2;
        config.worker.rules_check_interval_secs = 0;
        config.tunnel_rules.push(tunnel_rule("bad", "ftp://nowhere"));
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"worker.opening_threads_max"));
        assert!(fields.contains(&"worker.rules_check_interval_secs"));
        assert!(fields.contains(&"tunnel_rules[0]"));
    }

    #[test]
    fn duplicate_rule_names_collide_on_derived_uuid() {
        let mut config = ServerConfig::default();
        config.tunnel_rules.push(tunnel_rule("same", "tcp://127.0.0.1:0"));
        config.service_rules.push(ServiceRuleConfig {
            uuid: None,
            name: "same".into(),
            enabled: true,
            errors_treatment: Default::default(),
            services: vec![],
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "service_rules[0]");
        assert!(errors[0].to_string().contains("tunnel_rules[0]"));
    }
}
