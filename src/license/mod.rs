//! Capacity gates consulted before activating rules and tunnels.

use std::fmt;
use std::sync::Arc;

use crate::config::schema::LicenseConfig;

/// Answers whether `requested` objects may be active at once.
pub trait LicenseGate: Send + Sync + fmt::Debug {
    fn is_feature_available(&self, requested: usize) -> bool;
}

/// Gate that always allows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl LicenseGate for Unlimited {
    fn is_feature_available(&self, _requested: usize) -> bool {
        true
    }
}

/// Gate with a fixed upper bound.
#[derive(Debug, Clone, Copy)]
pub struct Capacity {
    max: usize,
}

impl Capacity {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl LicenseGate for Capacity {
    fn is_feature_available(&self, requested: usize) -> bool {
        requested <= self.max
    }
}

/// Gates used by the server worker.
#[derive(Debug, Clone)]
pub struct Licenses {
    pub rules: Arc<dyn LicenseGate>,
    pub tunnels: Arc<dyn LicenseGate>,
}

impl Licenses {
    pub fn unlimited() -> Self {
        Self {
            rules: Arc::new(Unlimited),
            tunnels: Arc::new(Unlimited),
        }
    }

    /// Zero limits mean unlimited.
    pub fn from_config(config: &LicenseConfig) -> Self {
        let gate = |max: usize| -> Arc<dyn LicenseGate> {
            if max == 0 {
                Arc::new(Unlimited)
            } else {
                Arc::new(Capacity::new(max))
            }
        };
        Self {
            rules: gate(config.max_rules),
            tunnels: gate(config.max_tunnels),
        }
    }
}

impl Default for Licenses {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_means_unlimited() {
        let licenses = Licenses::from_config(&LicenseConfig {
            max_rules: 0,
            max_tunnels: 2,
        });
        assert!(licenses.rules.is_feature_available(10_000));
        assert!(licenses.tunnels.is_feature_available(2));
        assert!(!licenses.tunnels.is_feature_available(3));
    }
}
