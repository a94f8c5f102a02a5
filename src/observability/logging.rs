//! Structured logging.
//!
//! # Responsibilities
//! - Install the global tracing subscriber
//! - Honour `RUST_LOG` first, then the configured level
//!
//! # Design Decisions
//! - Uses the tracing crate for structured logging
//! - Plain fmt layer on stdout

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter for `level`, keeping dependencies at `warn`.
pub fn default_filter(level: &str) -> String {
    format!("warn,tunnelex={level}")
}

/// Install the subscriber. Safe to call more than once; later calls are
/// ignored.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_scopes_level_to_crate() {
        assert_eq!(default_filter("debug"), "warn,tunnelex=debug");
        assert!(EnvFilter::try_new(default_filter("trace")).is_ok());
    }

    #[test]
    fn init_twice_does_not_panic() {
        init("info");
        init("debug");
    }
}
