//! Pipeline counters
//!
//! Thin wrappers over the `metrics` facade so every call site records the
//! same metric names and labels. Without an installed recorder the calls are
//! no-ops.
//!
//! | Metric | Labels |
//! |--------|--------|
//! | `events_published_total` | `topic` |
//! | `events_publish_failed_total` | `topic`, `kind` |
//! | `events_handled_total` | `topic` |
//! | `events_retried_total` | `topic`, `attempt` |
//! | `events_dead_lettered_total` | `topic`, `reason` |
//! | `events_drained_total` | `topic` |

use ::metrics::increment_counter;

/// Records a successful publish.
pub fn record_published(topic: &str) {
    increment_counter!("events_published_total", "topic" => topic.to_string());
}

/// Records a failed publish; `kind` is `transient` or `fatal`.
pub fn record_publish_failed(topic: &str, kind: &'static str) {
    increment_counter!(
        "events_publish_failed_total",
        "topic" => topic.to_string(),
        "kind" => kind
    );
}

/// Records a handler success.
pub fn record_handled(topic: &str) {
    increment_counter!("events_handled_total", "topic" => topic.to_string());
}

/// Records a record scheduled for another attempt.
pub fn record_retried(topic: &str, attempt: u32) {
    increment_counter!(
        "events_retried_total",
        "topic" => topic.to_string(),
        "attempt" => attempt.to_string()
    );
}

/// Records a record routed to the dead-letter topic.
///
/// `reason` is `exhausted` or `deserialization`.
pub fn record_dead_lettered(topic: &str, reason: &'static str) {
    increment_counter!(
        "events_dead_lettered_total",
        "topic" => topic.to_string(),
        "reason" => reason
    );
}

/// Records records returned by a manual drain.
pub fn record_drained(topic: &str, count: usize) {
    ::metrics::counter!(
        "events_drained_total",
        count as u64,
        "topic" => topic.to_string()
    );
}

/// Initializes the metrics exporter for Prometheus
///
/// With the `prometheus` feature enabled this installs the Prometheus
/// exporter on its default listener. Otherwise it does nothing and is still
/// safe to call.
///
/// # Examples
///
/// ```
/// use kafka_events::telemetry::init_metrics_exporter;
///
/// init_metrics_exporter();
/// ```
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        if let Err(e) = PrometheusBuilder::new().install() {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        }
    }
}
