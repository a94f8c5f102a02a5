//! Server worker subsystem.
//!
//! # Data Flow
//! ```text
//! update / delete_rule ──→ updater.rs (one request at a time)
//!                              → worker.rs (open inputs, static tunnels)
//!                              → registry.rs (rules, tunnels, check set)
//!
//! accept loop (proactor) ──→ worker.rs on_incoming
//!                              → opening_pool.rs (dial destinations, pair)
//!                              → registry.rs (tunnel registered)
//!
//! tunnel close ──→ opening_pool.rs (switch destination or tear down,
//!                  reopen static rule via updater.rs)
//!
//! rules_check.rs ──→ updater.rs (retry rules with backoff)
//! services.rs    ──→ services do_work, statistics dump
//! ```
//!
//! # Design Decisions
//! - Nothing blocks the proactor: opening, switching and teardown run on the
//!   elastic opening pool, rule mutations on the updating thread
//! - Registries are copy-then-swap, readers never take a write lock
//! - Background loops hold weak references and stop on the shutdown signal

pub mod opening_pool;
pub mod registry;
mod rules_check;
mod services;
pub mod updater;
mod worker;

pub use worker::{ServerWorker, WorkerOptions};
