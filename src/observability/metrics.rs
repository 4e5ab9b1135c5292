//! Metrics collection and exposition.
//!
//! # Metrics
//! - `harbor_connections_active` (gauge): open client connections
//! - `harbor_connections_total` (counter): accepted connections by protocol
//! - `harbor_requests_total` (counter): requests handed to the responder
//! - `harbor_pipeline_errors_total` (counter): connections closed on error, by kind
//! - `harbor_tls_handshake_failures_total` (counter)

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Starts the Prometheus scrape endpoint on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(error) => tracing::error!(address = %addr, error = %error, "Failed to start metrics endpoint"),
    }
}

pub fn connection_opened(protocol: &'static str) {
    ::metrics::gauge!("harbor_connections_active").increment(1.0);
    ::metrics::counter!("harbor_connections_total", "protocol" => protocol).increment(1);
}

pub fn connection_closed() {
    ::metrics::gauge!("harbor_connections_active").decrement(1.0);
}

pub fn record_request(protocol: &'static str) {
    ::metrics::counter!("harbor_requests_total", "protocol" => protocol).increment(1);
}

pub fn record_pipeline_error(kind: &'static str) {
    ::metrics::counter!("harbor_pipeline_errors_total", "kind" => kind).increment(1);
}

pub fn record_tls_handshake_failure() {
    ::metrics::counter!("harbor_tls_handshake_failures_total").increment(1);
}
