//! Tunnels: one source pair relayed to one destination pair.
//!
//! # Data Flow
//! ```text
//! source-read ─→ source post-listeners ─→ destination pre-listeners ─→ destination-write
//! source-write ←─ source pre-listeners ←─ destination post-listeners ←─ destination-read
//!
//! destination fails during setup
//!     → TunnelHost::close_tunnel → server worker → Tunnel::switch
//!         → recreate in place once, otherwise next destination
//! ```
//!
//! # Design Decisions
//! - Destinations are tried in rule order; all but the last failure are only logged
//! - Connections reach the tunnel through a weak signal, so a dropped tunnel
//!   never gets callbacks
//! - Teardown disconnects the wiring first, then waits on each connection's
//!   closed notification

pub mod listener;
pub mod relay;
pub mod traffic_logger;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use listener::{DataTransferCommand, Listener, ListenerChain, ListenerContext, ListenerFactory};
pub use relay::{open_endpoint_connections, ConnectionPair, Tunnel, TunnelContext, TunnelHost};

static TUNNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(u64);

impl TunnelId {
    pub fn new() -> Self {
        Self(TUNNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
