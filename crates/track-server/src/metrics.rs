//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "livetrack_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "livetrack_connections_active";
    pub const PUBLISHES_TOTAL: &str = "livetrack_publishes_total";
    pub const LOCATION_UPDATES_TOTAL: &str = "livetrack_location_updates_total";
    pub const TOPICS_ACTIVE: &str = "livetrack_topics_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "livetrack_subscriptions_total";
    pub const REAPS_TOTAL: &str = "livetrack_reaps_total";
    pub const TOPICS_REAPED_TOTAL: &str = "livetrack_topics_reaped_total";
    pub const ERRORS_TOTAL: &str = "livetrack_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::PUBLISHES_TOTAL, "Total events published to topics");
    metrics::describe_counter!(
        names::LOCATION_UPDATES_TOTAL,
        "Total location updates published"
    );
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of live topics");
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Total topic joins");
    metrics::describe_counter!(names::REAPS_TOTAL, "Total reaper sweeps completed");
    metrics::describe_counter!(
        names::TOPICS_REAPED_TOTAL,
        "Total empty topics removed by the reaper"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a publish.
pub fn record_publish() {
    counter!(names::PUBLISHES_TOTAL).increment(1);
}

/// Record a location update.
pub fn record_location_update() {
    counter!(names::LOCATION_UPDATES_TOTAL).increment(1);
}

/// Record a topic join.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record one reaper sweep and how many topics it removed.
pub fn record_reap(removed: usize) {
    counter!(names::REAPS_TOTAL).increment(1);
    counter!(names::TOPICS_REAPED_TOTAL).increment(removed as u64);
}

/// Update active topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
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
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }

    #[test]
    fn test_record_reap() {
        record_reap(0);
        record_reap(3);
    }
}
