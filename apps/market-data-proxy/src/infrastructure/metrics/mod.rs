//! Prometheus Metrics Module
//!
//! Exposes proxy metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Bus**: ticks published and dropped on overflow
//! - **Fan-out**: frames delivered, dropped for full client queues, throttled
//! - **Sessions**: connected clients, active routing keys, rejections
//! - **Upstream**: connections and bound symbols per provider, reconnects,
//!   errors
//! - **Latency**: bus receive to last client enqueue
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::ports::SubscribeRejection;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if a different global recorder is already installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "mdproxy_bus_published_total",
        "Ticks accepted by the message bus"
    );
    describe_counter!(
        "mdproxy_bus_dropped_total",
        "Ticks evicted from the message bus before the event loop read them"
    );
    describe_counter!(
        "mdproxy_ticks_throttled_total",
        "Ticks dropped by the per-key throttle"
    );
    describe_counter!(
        "mdproxy_frames_delivered_total",
        "Market data frames enqueued to clients"
    );
    describe_counter!(
        "mdproxy_frames_dropped_total",
        "Market data frames dropped because a client queue was full"
    );
    describe_counter!(
        "mdproxy_subscription_rejections_total",
        "Subscribe entries refused, by reason"
    );
    describe_counter!(
        "mdproxy_upstream_reconnects_total",
        "Upstream reconnection attempts"
    );
    describe_counter!(
        "mdproxy_upstream_errors_total",
        "Upstream connection and protocol errors"
    );

    describe_gauge!("mdproxy_clients", "Authenticated client sessions");
    describe_gauge!("mdproxy_routing_keys", "Routing keys with at least one subscriber");
    describe_gauge!(
        "mdproxy_upstream_connections",
        "Pooled upstream connections per provider"
    );
    describe_gauge!(
        "mdproxy_upstream_connections_connected",
        "Pooled upstream connections currently connected"
    );
    describe_gauge!(
        "mdproxy_bound_symbols",
        "Provider symbols bound across a provider's pool"
    );

    describe_histogram!(
        "mdproxy_routing_seconds",
        "Time from bus receive to the last client enqueue"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

#[allow(clippy::cast_precision_loss)]
const fn as_gauge(value: usize) -> f64 {
    value as f64
}

/// Record a tick accepted by the bus.
pub fn record_bus_published() {
    counter!("mdproxy_bus_published_total").increment(1);
}

/// Record ticks evicted from the bus.
pub fn record_bus_dropped(count: u64) {
    counter!("mdproxy_bus_dropped_total").increment(count);
}

/// Record a tick suppressed by the throttle.
pub fn record_throttled() {
    counter!("mdproxy_ticks_throttled_total").increment(1);
}

/// Record one routed tick's fan-out.
pub fn record_fan_out(delivered: usize, dropped: usize, elapsed: Duration) {
    counter!("mdproxy_frames_delivered_total").increment(delivered as u64);
    if dropped > 0 {
        counter!("mdproxy_frames_dropped_total").increment(dropped as u64);
    }
    histogram!("mdproxy_routing_seconds").record(elapsed.as_secs_f64());
}

/// Record a refused subscribe entry.
pub fn record_subscription_rejected(reason: SubscribeRejection) {
    counter!(
        "mdproxy_subscription_rejections_total",
        "reason" => reason.code()
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_upstream_reconnect(provider: &str) {
    counter!(
        "mdproxy_upstream_reconnects_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Record an upstream error.
pub fn record_upstream_error(provider: &str, kind: &'static str) {
    counter!(
        "mdproxy_upstream_errors_total",
        "provider" => provider.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Update session gauges.
pub fn set_sessions(clients: usize, routing_keys: usize) {
    gauge!("mdproxy_clients").set(as_gauge(clients));
    gauge!("mdproxy_routing_keys").set(as_gauge(routing_keys));
}

/// Update one provider's pool gauges.
pub fn set_pool(provider: &str, connections: usize, connected: usize, bound_symbols: usize) {
    gauge!("mdproxy_upstream_connections", "provider" => provider.to_string())
        .set(as_gauge(connections));
    gauge!("mdproxy_upstream_connections_connected", "provider" => provider.to_string())
        .set(as_gauge(connected));
    gauge!("mdproxy_bound_symbols", "provider" => provider.to_string())
        .set(as_gauge(bound_symbols));
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_bus_published();
        record_fan_out(3, 1, Duration::from_micros(20));
        record_subscription_rejected(SubscribeRejection::PoolExhausted);
        set_pool("kite", 2, 1, 1500);
    }

    #[test]
    fn handle_available_after_init() {
        let handle = init_metrics();
        record_upstream_reconnect("kite");
        assert!(get_metrics_handle().is_some());
        assert!(handle.render().contains("mdproxy_upstream_reconnects_total"));
    }
}
