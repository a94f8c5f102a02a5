//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define relay metrics
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `tunnelex_tunnels_opened_total` (counter): tunnels created
//! - `tunnelex_tunnels_closed_total` (counter): tunnels torn down
//! - `tunnelex_active_tunnels` (gauge): registered tunnels
//! - `tunnelex_bytes_relayed_total` (counter): bytes written to peers
//! - `tunnelex_connection_errors_total` (counter): failed reads and writes
//! - `tunnelex_pool_growths_total` (counter): message pool growths

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const TUNNELS_OPENED: &str = "tunnelex_tunnels_opened_total";
pub const TUNNELS_CLOSED: &str = "tunnelex_tunnels_closed_total";
pub const ACTIVE_TUNNELS: &str = "tunnelex_active_tunnels";
pub const BYTES_RELAYED: &str = "tunnelex_bytes_relayed_total";
pub const CONNECTION_ERRORS: &str = "tunnelex_connection_errors_total";
pub const POOL_GROWTHS: &str = "tunnelex_pool_growths_total";

/// Install the Prometheus recorder and its HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to start metrics endpoint"),
    }
}

pub fn tunnel_opened() {
    metrics::counter!(TUNNELS_OPENED).increment(1);
}

pub fn tunnel_closed() {
    metrics::counter!(TUNNELS_CLOSED).increment(1);
}

pub fn set_active_tunnels(count: usize) {
    metrics::gauge!(ACTIVE_TUNNELS).set(count as f64);
}

pub fn bytes_relayed(bytes: usize) {
    metrics::counter!(BYTES_RELAYED).increment(bytes as u64);
}

pub fn connection_error() {
    metrics::counter!(CONNECTION_ERRORS).increment(1);
}

pub fn pool_grown() {
    metrics::counter!(POOL_GROWTHS).increment(1);
}
