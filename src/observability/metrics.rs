//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Name every metric the server records
//! - Install the Prometheus exporter
//! - Provide the `metrics`-backed sink used by the metrics middleware
//!
//! # Metrics
//! - `http_requests_total` (counter): requests by path, method, status
//! - `http_request_duration_seconds` (histogram): latency by path, method, status
//! - `http_concurrent_requests` (gauge): requests in flight
//! - `connections_accepted_total` (counter), `connections_active` (gauge)
//! - `ws_connections_total` (counter): completed upgrades
//! - `ws_broadcast_failures_total` (counter): per-client broadcast write failures
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every update is a no-op
//! - Names are constants so call sites cannot drift

use std::net::SocketAddr;

use metrics::Label;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::middleware::metrics::MetricsSink;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const HTTP_CONCURRENT_REQUESTS: &str = "http_concurrent_requests";
pub const CONNECTIONS_ACCEPTED_TOTAL: &str = "connections_accepted_total";
pub const CONNECTIONS_ACTIVE: &str = "connections_active";
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
pub const WS_BROADCAST_FAILURES_TOTAL: &str = "ws_broadcast_failures_total";

/// Install the global Prometheus recorder with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

fn to_labels(labels: &[(&'static str, String)]) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new(*key, value.clone()))
        .collect()
}

/// [`MetricsSink`] recording through the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn increment_counter(&self, name: &'static str, labels: &[(&'static str, String)]) {
        metrics::counter!(name, to_labels(labels)).increment(1);
    }

    fn record_histogram(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]) {
        metrics::histogram!(name, to_labels(labels)).record(value);
    }

    fn adjust_gauge(&self, name: &'static str, delta: f64, labels: &[(&'static str, String)]) {
        let gauge = metrics::gauge!(name, to_labels(labels));
        if delta >= 0.0 {
            gauge.increment(delta);
        } else {
            gauge.decrement(-delta);
        }
    }
}
