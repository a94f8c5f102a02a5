//! Data listeners placed between the two sides of a tunnel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::buffer::MessageBlock;
use crate::error::{Error, Result};
use crate::net::connection::ConnectionId;
use crate::rule::ListenerInfo;
use crate::tunnel::traffic_logger::TrafficLogger;
use crate::tunnel::TunnelId;

/// What to do with a block after a listener saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransferCommand {
    /// Pass it on.
    Send,
    /// Drop it silently.
    Skip,
    /// Drop it and close the tunnel.
    CloseTunnel,
}

/// Observer of the data flowing through a tunnel.
pub trait Listener: Send + Sync {
    fn on_new_message_block(&self, block: &MessageBlock) -> DataTransferCommand;
}

/// Where a listener is being installed.
#[derive(Debug, Clone, Copy)]
pub struct ListenerContext {
    pub rule: Uuid,
    pub endpoint: Uuid,
    pub tunnel: TunnelId,
    /// Connection whose data passes through the listener.
    pub connection: ConnectionId,
}

pub type ListenerConstructor =
    Arc<dyn Fn(&ListenerContext, &str) -> Result<Box<dyn Listener>> + Send + Sync>;

/// Name-keyed listener constructors.
#[derive(Clone, Default)]
pub struct ListenerFactory {
    constructors: HashMap<String, ListenerConstructor>,
}

impl ListenerFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in listeners registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register(TrafficLogger::NAME, |context, param| {
            Ok(Box::new(TrafficLogger::create(context, param)) as Box<dyn Listener>)
        });
        factory
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&ListenerContext, &str) -> Result<Box<dyn Listener>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn create(&self, info: &ListenerInfo, context: &ListenerContext) -> Result<Box<dyn Listener>> {
        let constructor = self
            .constructors
            .get(&info.name)
            .ok_or_else(|| Error::Logical(format!("unknown data listener \"{}\"", info.name)))?;
        constructor(context, &info.param)
    }

    /// Build the chain for a list of listener references.
    pub fn chain<'a>(
        &self,
        infos: impl IntoIterator<Item = &'a ListenerInfo>,
        context: &ListenerContext,
    ) -> Result<ListenerChain> {
        let listeners = infos
            .into_iter()
            .map(|info| self.create(info, context))
            .collect::<Result<Vec<_>>>()?;
        Ok(ListenerChain { listeners })
    }
}

impl fmt::Debug for ListenerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerFactory")
            .field("names", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Ordered listeners of one traffic direction.
#[derive(Default)]
pub struct ListenerChain {
    listeners: Vec<Box<dyn Listener>>,
}

impl ListenerChain {
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Run the listeners in order, stopping at the first that does not say
    /// [`DataTransferCommand::Send`].
    pub fn process(&self, block: &MessageBlock) -> DataTransferCommand {
        for listener in &self.listeners {
            match listener.on_new_message_block(block) {
                DataTransferCommand::Send => continue,
                other => return other,
            }
        }
        DataTransferCommand::Send
    }
}
