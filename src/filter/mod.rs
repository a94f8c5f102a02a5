//! Rule filters: periodic rewrites of a running tunnel rule.
//!
//! A filter gets a snapshot of the rule and may hand back a changed copy;
//! the server worker swaps it in, so only tunnels opened afterwards see it.

pub mod destination_ping;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::{Error, Result};
use crate::rule::TunnelRule;

pub use destination_ping::DestinationPing;

pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Period between passes.
    fn interval(&self) -> Duration;

    /// One pass. `None` leaves the rule as it is.
    fn change_rule(&self, rule: Arc<TunnelRule>) -> BoxFuture<'static, Option<TunnelRule>>;
}

pub type FilterConstructor = Arc<dyn Fn() -> Arc<dyn Filter> + Send + Sync>;

/// Name-keyed filter constructors.
#[derive(Clone, Default)]
pub struct FilterFactory {
    constructors: HashMap<String, FilterConstructor>,
}

impl FilterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register(DestinationPing::NAME, || {
            Arc::new(DestinationPing::default()) as Arc<dyn Filter>
        });
        factory
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn Filter> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Filter>> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| Error::Logical(format!("unknown rule filter \"{name}\"")))
    }
}

impl fmt::Debug for FilterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterFactory")
            .field("names", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}
