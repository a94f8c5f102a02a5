//! TunnelEx relay server
//!
//! Relays TCP and UDP traffic according to rules read from a TOML file.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌───────────────────────────────────────────────────────┐
//!                  │                    SERVER WORKER                      │
//!                  │                                                       │
//!   Client         │  ┌──────────┐    ┌─────────────┐    ┌─────────────┐  │
//!   ───────────────┼─▶│ acceptor │───▶│ opening pool│───▶│   tunnel    │──┼──▶ Destination
//!                  │  │  (input) │    │  (dial, pair)│    │ (relay,     │  │    (first that
//!   ◀──────────────┼──│          │◀───│             │◀───│  failover)  │◀─┼──── opens)
//!                  │  └──────────┘    └─────────────┘    └─────────────┘  │
//!                  │                                                       │
//!                  │  ┌─────────────────────────────────────────────────┐ │
//!                  │  │ updater (rule changes) · rules check · services │ │
//!                  │  └─────────────────────────────────────────────────┘ │
//!                  └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tunnelex::config::{load_config, ConfigWatcher, RuleChanges, ServerConfig};
use tunnelex::lifecycle::signals::{wait_for_stop_signal, StopSignal};
use tunnelex::observability::{logging, metrics};
use tunnelex::{ServerWorker, WorkerOptions};

#[derive(Debug, Parser)]
#[command(name = "tunnelex", version, about = "Rule-driven TCP/UDP relay server")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "tunnelex.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Do not reload the configuration when the file changes.
    #[arg(long)]
    no_watch: bool,
}

enum Event {
    Stop(StopSignal),
    Reload(ServerConfig),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            logging::init("info");
            tracing::error!(path = %cli.config.display(), error = %err, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.observability.log_level);

    if cli.check {
        tracing::info!(
            path = %cli.config.display(),
            tunnel_rules = config.tunnel_rules.len(),
            service_rules = config.service_rules.len(),
            "Configuration is valid"
        );
        return ExitCode::SUCCESS;
    }

    tracing::info!("tunnelex v{} starting", env!("CARGO_PKG_VERSION"));

    let mut worker = match ServerWorker::start(WorkerOptions::from_config(&config)) {
        Ok(worker) => worker,
        Err(err) => {
            tracing::error!(error = %err, "Failed to start server worker");
            return ExitCode::FAILURE;
        }
    };

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                let _runtime = worker.handle().enter();
                metrics::init_metrics(addr);
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    match RuleChanges::initial(&config) {
        Ok(changes) => apply(&worker, changes),
        Err(err) => tracing::error!(error = %err, "Failed to build rules"),
    }

    let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
    let _watcher = if cli.no_watch {
        None
    } else {
        match watcher.run() {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to watch configuration file, reload disabled");
                None
            }
        }
    };

    let mut current = config;
    loop {
        let event = worker.handle().block_on(async {
            tokio::select! {
                signal = wait_for_stop_signal() => Event::Stop(signal),
                Some(config) = updates.recv() => Event::Reload(config),
            }
        });
        match event {
            Event::Stop(signal) => {
                tracing::info!(%signal, "Shutdown signal received");
                break;
            }
            Event::Reload(config) => {
                if config.worker != current.worker || config.buffer != current.buffer || config.license != current.license {
                    tracing::warn!("Worker, buffer and license settings take effect after restart");
                }
                match RuleChanges::between(&current, &config) {
                    Ok(changes) if changes.is_empty() => tracing::debug!("Configuration reloaded, rules unchanged"),
                    Ok(changes) => apply(&worker, changes),
                    Err(err) => tracing::error!(error = %err, "Failed to build reloaded rules"),
                }
                current = config;
            }
        }
    }

    worker.shutdown();
    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}

fn apply(worker: &ServerWorker, changes: RuleChanges) {
    for uuid in changes.removed {
        match worker.delete_rule(uuid) {
            Ok(true) => tracing::info!(rule = %uuid, "Rule deleted"),
            Ok(false) => tracing::debug!(rule = %uuid, "Rule was not active"),
            Err(err) => tracing::error!(rule = %uuid, error = %err, "Failed to delete rule"),
        }
    }
    for rule in changes.updated {
        let (uuid, name) = (rule.uuid(), rule.name().to_string());
        match worker.update(rule) {
            Ok(true) => tracing::info!(rule = %name, uuid = %uuid, "Rule applied"),
            Ok(false) => tracing::warn!(rule = %name, uuid = %uuid, "Rule applied, not every input opened"),
            Err(err) if err.is_license() => tracing::warn!(rule = %name, error = %err, "Rule refused by license"),
            Err(err) => tracing::error!(rule = %name, error = %err, "Failed to apply rule"),
        }
    }
}
