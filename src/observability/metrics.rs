//! Metrics collection and exposition.
//!
//! # Metrics
//! - `configmap_restarts_total` (counter): completed rebuilds
//! - `configmap_shutdowns_total` (counter): graceful shutdowns by outcome
//! - `configmap_probes_total` (counter): liveness probes by outcome
//! - `configmap_watch_events_total` (counter): filesystem events by kind
//! - `configmap_server_generation` (gauge): generation currently serving
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_restart() {
    metrics::counter!("configmap_restarts_total").increment(1);
}

/// Set whenever a server starts listening, the first one included.
pub fn record_generation(generation: u64) {
    metrics::gauge!("configmap_server_generation").set(generation as f64);
}

pub fn record_shutdown(outcome: &'static str) {
    metrics::counter!("configmap_shutdowns_total", "outcome" => outcome).increment(1);
}

pub fn record_probe(outcome: &'static str) {
    metrics::counter!("configmap_probes_total", "outcome" => outcome).increment(1);
}

pub fn record_watch_event(kind: &'static str) {
    metrics::counter!("configmap_watch_events_total", "kind" => kind).increment(1);
}
