//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming connection
//!     → acceptor.rs (accept loop, try_to_attach, hand-off to the worker)
//!     → connection.rs (open, setup, read / write pumps, close)
//!     → io.rs (stream and datagram block I/O)
//!     → signal.rs (events raised to the owning tunnel)
//!
//! Connection States:
//!     Created → Opened → Setup → Relaying → Closing → Deleted
//! ```
//!
//! # Design Decisions
//! - Bounded per-connection block budget gives backpressure
//! - Connections hold their owner weakly and never call it under their lock
//! - Close is idempotent and works on connections that never opened

pub mod acceptor;
pub mod connection;
pub mod io;
pub mod signal;
