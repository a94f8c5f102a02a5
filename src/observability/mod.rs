//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! server worker, tunnels, connections
//!     → logging.rs (tracing events, env-filter controlled)
//!     → metrics.rs (tunnel counters and gauges)
//!
//! Consumers:
//!     → stdout
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Rule and tunnel identifiers travel as structured fields
//! - Metric updates are plain atomic increments; with no recorder installed
//!   they are no-ops

pub mod logging;
pub mod metrics;
