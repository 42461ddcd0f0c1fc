//! Metrics collection and export for Herald.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tenvis_herald_core::dispatcher::{ConnectionError, DispatchError};
use tenvis_herald_core::{ConnectionHandle, ConnectionHook, ManagerError};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "herald_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "herald_messages_total";
    pub const MESSAGES_BYTES: &str = "herald_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "herald_channels_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "herald_subscriptions_active";
    pub const API_EVENTS_TOTAL: &str = "herald_api_events_total";
    pub const LATENCY_SECONDS: &str = "herald_latency_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused during the handshake"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of local channels");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of local channel subscriptions"
    );
    metrics::describe_counter!(names::API_EVENTS_TOTAL, "Events triggered through the REST API");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// Metric descriptions are registered with the exporter after it is installed.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    init_metrics();

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record message latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record events triggered through the REST API.
pub fn record_api_events(count: usize) {
    counter!(names::API_EVENTS_TOTAL).increment(count as u64);
}

/// Update local channel and subscription gauges.
pub fn set_channel_stats(channels: usize, subscriptions: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(channels as f64);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(subscriptions as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Label of a dispatch failure.
fn error_kind(error: &DispatchError) -> &'static str {
    match error {
        DispatchError::Malformed(_) => "malformed",
        DispatchError::InvalidSignature(_) => "signature",
        DispatchError::ClientEventsDisabled | DispatchError::NotSubscribed(_) => "client_event",
        DispatchError::AlreadySignedIn => "signin",
        DispatchError::UnsupportedEvent(_) => "unsupported_event",
        DispatchError::Channel(ManagerError::MaxChannelsReached | ManagerError::MaxSubscriptionsReached) => "limit",
        DispatchError::Channel(_) => "channel",
        DispatchError::Fatal(ConnectionError::PongTimeout) => "pong_timeout",
        DispatchError::Fatal(_) => "fatal",
    }
}

/// Records connection lifecycle metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsHook;

impl ConnectionHook for MetricsHook {
    fn on_open(&self, _connection: &ConnectionHandle) {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
    }

    fn on_rejected(&self, _app_key: &str, error: &ConnectionError) {
        let reason = match error {
            ConnectionError::AppNotFound(_) => "app_not_found",
            ConnectionError::OriginNotAllowed => "origin",
            ConnectionError::UnsupportedProtocol(_) => "protocol",
            ConnectionError::OverCapacity => "capacity",
            ConnectionError::Unauthorized | ConnectionError::PongTimeout => "other",
        };
        counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
    }

    fn on_error(&self, _connection: &ConnectionHandle, error: &DispatchError) {
        record_error(error_kind(error));
    }

    fn on_close(&self, _connection: &ConnectionHandle) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
