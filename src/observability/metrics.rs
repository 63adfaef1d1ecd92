//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_tunnels_total` (counter): established CONNECT tunnels by route
//! - `proxy_dial_failures_total` (counter): failed upstream dials by route
//! - `proxy_relay_bytes_total` (counter): tunnel bytes relayed per direction (`a_to_b` is client to upstream)
//! - `proxy_forward_requests_total` (counter): plain HTTP requests by status
//! - `proxy_active_connections` (gauge): current client connection count

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::net::dial::Route;
use crate::net::relay::Direction;

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_tunnel(route: Route) {
    ::metrics::counter!("proxy_tunnels_total", "route" => route.as_str()).increment(1);
}

pub fn record_dial_failure(route: Route) {
    ::metrics::counter!("proxy_dial_failures_total", "route" => route.as_str()).increment(1);
}

pub fn record_relay_bytes(direction: Direction, bytes: u64) {
    ::metrics::counter!("proxy_relay_bytes_total", "direction" => direction.as_str())
        .increment(bytes);
}

pub fn record_forward(status: u16) {
    ::metrics::counter!("proxy_forward_requests_total", "status" => status.to_string())
        .increment(1);
}

pub fn set_active_connections(count: u64) {
    ::metrics::gauge!("proxy_active_connections").set(count as f64);
}
