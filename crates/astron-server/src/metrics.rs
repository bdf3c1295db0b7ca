//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports to Prometheus
//! format.

use astron_core::{DirectorStats, MessageDirector};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "astron_md_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "astron_md_connections_active";
    pub const DATAGRAMS_TOTAL: &str = "astron_md_datagrams_total";
    pub const DATAGRAMS_BYTES: &str = "astron_md_datagrams_bytes";
    pub const CHANNELS_ACTIVE: &str = "astron_md_channels_active";
    pub const RANGE_INTERVALS: &str = "astron_md_range_intervals";
    pub const QUEUE_DEPTH: &str = "astron_md_queue_depth";
    pub const ERRORS_TOTAL: &str = "astron_md_errors_total";
}

/// Describe every metric.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of participant connections since start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of participant connections"
    );
    metrics::describe_counter!(names::DATAGRAMS_TOTAL, "Datagrams read or written");
    metrics::describe_counter!(names::DATAGRAMS_BYTES, "Datagram bytes read or written");
    metrics::describe_gauge!(
        names::CHANNELS_ACTIVE,
        "Channels with at least one discrete subscriber"
    );
    metrics::describe_gauge!(names::RANGE_INTERVALS, "Stored range subscription intervals");
    metrics::describe_gauge!(names::QUEUE_DEPTH, "Datagrams waiting for dispatch");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Transport and protocol errors");

    info!("Metrics initialized");
}

/// Start the Prometheus exporter.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_datagram(bytes: usize, direction: &'static str) {
    counter!(names::DATAGRAMS_TOTAL, "direction" => direction).increment(1);
    counter!(names::DATAGRAMS_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => kind).increment(1);
}

/// Publish a routing snapshot as gauges.
pub fn record_stats(stats: &DirectorStats) {
    gauge!(names::CHANNELS_ACTIVE).set(stats.channels as f64);
    gauge!(names::RANGE_INTERVALS).set(stats.range_intervals as f64);
    gauge!(names::QUEUE_DEPTH).set(stats.queued as f64);
}

/// Refresh routing gauges every `interval` until the director goes away.
pub fn spawn_stats_reporter(director: &Arc<MessageDirector>, interval: Duration) {
    let director: Weak<MessageDirector> = Arc::downgrade(director);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(director) = director.upgrade() else {
                break;
            };
            record_stats(&director.stats());
        }
    });
}

/// Tracks one live connection; decrements the active gauge on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
