//! Prometheus metrics for the event bus.
//!
//! All metrics follow the naming convention: `eventbus_<metric>_<unit>`.
//! Metrics are usable as soon as they are touched; [`register_metrics`] only
//! makes them visible to [`encode_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH SIDE
    // =========================================================================

    /// Events accepted for delivery, by transport and event key
    pub static ref EVENTS_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("eventbus_events_published_total", "Events accepted for delivery"),
        &["transport", "event_key"]
    ).expect("metric creation failed");

    /// Events dropped because no consumer exists for their key
    pub static ref EVENTS_DROPPED: CounterVec = CounterVec::new(
        Opts::new("eventbus_events_dropped_total", "Events dropped without a consumer"),
        &["event_key"]
    ).expect("metric creation failed");

    // =========================================================================
    // DISPATCH SIDE
    // =========================================================================

    /// Events dispatched to at least one handler
    pub static ref EVENTS_DISPATCHED: CounterVec = CounterVec::new(
        Opts::new("eventbus_events_dispatched_total", "Events dispatched to handlers"),
        &["event_key"]
    ).expect("metric creation failed");

    /// Handler invocations that returned an error or panicked
    pub static ref HANDLER_FAILURES: CounterVec = CounterVec::new(
        Opts::new("eventbus_handler_failures_total", "Failed handler invocations"),
        &["event_key", "handler"]
    ).expect("metric creation failed");

    /// Time spent dispatching one event to all of its handlers
    pub static ref DISPATCH_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "eventbus_dispatch_duration_seconds",
            "Time spent dispatching an event to its handlers"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).expect("valid buckets")),
        &["event_key"]
    ).expect("metric creation failed");

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Broker connect attempts (including retries)
    pub static ref CONNECT_ATTEMPTS: Counter = Counter::new(
        "eventbus_connect_attempts_total",
        "Broker connect attempts including retries"
    ).expect("metric creation failed");

    /// Reconnects triggered by broker notifications
    pub static ref RECONNECTS: Counter = Counter::new(
        "eventbus_reconnects_total",
        "Reconnects triggered by shutdown, blocked or callback-exception notifications"
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Calling this more than once is harmless.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EVENTS_PUBLISHED.clone()),
        Box::new(EVENTS_DROPPED.clone()),
        Box::new(EVENTS_DISPATCHED.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        Box::new(DISPATCH_DURATION.clone()),
        Box::new(CONNECT_ATTEMPTS.clone()),
        Box::new(RECONNECTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(())
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
