//! Configuration file watcher for hot reload.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::loader::load_config;
use crate::config::schema::ServerConfig;
use crate::error::Result;
use crate::rule::{derive_uuid, Rule, ServiceRule, TunnelRule};

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ServerConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for validated configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ServerConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The file is watched for as long as the returned
    /// watcher lives.
    pub fn run(self) -> std::result::Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, reloading...");
                        match load_config(&path) {
                            Ok(new_config) => {
                                let _ = tx.send(new_config);
                            }
                            Err(e) => {
                                tracing::error!("Failed to reload config: {}. Keeping current configuration.", e);
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// What a reload has to do to the running rules.
#[derive(Debug, Default)]
pub struct RuleChanges {
    /// New rules and rules whose definition changed.
    pub updated: Vec<Rule>,
    /// Rules gone from the new configuration.
    pub removed: Vec<Uuid>,
}

impl RuleChanges {
    /// Every rule of `config`, as on first start.
    pub fn initial(config: &ServerConfig) -> Result<Self> {
        Self::between(&ServerConfig::default(), config)
    }

    pub fn between(old: &ServerConfig, new: &ServerConfig) -> Result<Self> {
        let mut changes = Self::default();
        let mut kept = HashSet::new();

        for rule in &new.tunnel_rules {
            let uuid = rule.uuid.unwrap_or_else(|| derive_uuid(&rule.name));
            kept.insert(uuid);
            if !old.tunnel_rules.contains(rule) {
                changes.updated.push(TunnelRule::from_config(rule)?.into());
            }
        }
        for rule in &new.service_rules {
            let uuid = rule.uuid.unwrap_or_else(|| derive_uuid(&rule.name));
            kept.insert(uuid);
            if !old.service_rules.contains(rule) {
                changes.updated.push(ServiceRule::from_config(rule).into());
            }
        }

        let old_uuids = old
            .tunnel_rules
            .iter()
            .map(|rule| rule.uuid.unwrap_or_else(|| derive_uuid(&rule.name)))
            .chain(
                old.service_rules
                    .iter()
                    .map(|rule| rule.uuid.unwrap_or_else(|| derive_uuid(&rule.name))),
            );
        for uuid in old_uuids {
            if !kept.contains(&uuid) && !changes.removed.contains(&uuid) {
                changes.removed.push(uuid);
            }
        }
        Ok(changes)
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}
