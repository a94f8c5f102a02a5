//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Start server worker → Apply rules → Watch file
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop background loops → Stop accepting
//!         → Close tunnels → Stop pools
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then the worker, then rules
//! - Ordered shutdown: stop accept, close tunnels, stop threads
//! - Shutdown has timeout: the proactor is dropped after the close deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownListener};
