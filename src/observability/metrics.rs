//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_sessions_active` (gauge): open sessions by protocol
//! - `proxy_sessions_total` (counter): sessions opened by protocol
//! - `proxy_tunnels_active` (gauge): established tunnels
//! - `proxy_tunnels_total` (counter): tunnel attempts by outcome
//! - `proxy_tunnel_duration_seconds` (histogram): tunnel lifetime
//! - `proxy_relayed_bytes_total` (counter): piped bytes by pipe and direction
//! - `proxy_forward_responses_total` (counter): forwarded responses by status
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until an
//!   exporter is installed

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::session::Protocol;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_session_opened(protocol: Protocol) {
    metrics::counter!("proxy_sessions_total", "protocol" => protocol.as_str()).increment(1);
    metrics::gauge!("proxy_sessions_active", "protocol" => protocol.as_str()).increment(1.0);
}

pub fn record_session_closed(protocol: Protocol) {
    metrics::gauge!("proxy_sessions_active", "protocol" => protocol.as_str()).decrement(1.0);
}

/// Record the outcome of a tunnel dial (`established`, `not_found`, `failed`).
pub fn record_tunnel_attempt(outcome: &'static str) {
    metrics::counter!("proxy_tunnels_total", "outcome" => outcome).increment(1);
    if outcome == "established" {
        metrics::gauge!("proxy_tunnels_active").increment(1.0);
    }
}

pub fn record_tunnel_closed(duration: Duration) {
    metrics::gauge!("proxy_tunnels_active").decrement(1.0);
    metrics::histogram!("proxy_tunnel_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_relayed_bytes(pipe: &'static str, direction: &'static str, bytes: u64) {
    metrics::counter!("proxy_relayed_bytes_total", "pipe" => pipe, "direction" => direction)
        .increment(bytes);
}

pub fn record_forward_response(status: u16) {
    metrics::counter!("proxy_forward_responses_total", "status" => status.to_string())
        .increment(1);
}
