//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[worker]
opening_threads_min = 2
rules_check_interval_secs = 10

[license]
max_tunnels = 100

[[tunnel_rules]]
name = "web"
errors_treatment = "error"
accepted_connections_limit = 3

[[tunnel_rules.inputs]]
address = "tcp://0.0.0.0:8080"

[[tunnel_rules.destinations]]
address = "tcp://10.0.0.1:80"
open_timeout_secs = 2

[[tunnel_rules.destinations]]
read_address = "udp://10.0.0.2:5000"
write_address = "udp://10.0.0.2:5001"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.worker.opening_threads_min, 2);
        assert_eq!(config.worker.opening_threads_max, 600);
        assert_eq!(config.license.max_tunnels, 100);
        assert_eq!(config.license.max_rules, 0);
        let rule = &config.tunnel_rules[0];
        assert!(rule.enabled);
        assert_eq!(rule.accepted_connections_limit, 3);
        assert_eq!(rule.destinations.len(), 2);
        assert_eq!(rule.destinations[0].open_timeout_secs, 2);
        assert!(rule.inputs[0].acceptor);
    }

    #[test]
    fn syntax_and_semantic_errors_are_distinguished() {
        assert!(matches!(parse_config("[worker"), Err(ConfigError::Parse(_))));
        let invalid = "[worker]\nopening_threads_min = 0\n";
        match parse_config(invalid) {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/tunnelex.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
