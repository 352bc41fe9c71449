//! Prometheus metrics for the consumer engine.
//!
//! Metrics cover:
//! - Message outcomes per topic (handled, failed, skipped)
//! - Redelivery outcomes per topic
//! - Handler latency
//! - Per-partition in-flight count and committed offset
//! - Consumer-group session restarts
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the
//! "kafkaesque_consumer" prefix to avoid name collisions with other libraries
//! using the default Prometheus registry. Registration errors are handled
//! gracefully: if a metric fails to register, an unregistered fallback is
//! used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

use crate::types::TopicPartition;

/// Custom Prometheus registry for consumer metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("kafkaesque_consumer".to_string()), None)
        .unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Message metrics
// =============================================================================

define_counter_vec!(
    MESSAGES_CONSUMED,
    "messages_consumed_total",
    "Messages dispatched to a handler, by outcome",
    ["topic", "outcome"]
);
define_counter_vec!(
    MESSAGES_SKIPPED,
    "messages_skipped_total",
    "Messages addressed to another consumer group",
    ["topic"]
);
define_histogram_vec!(
    HANDLER_DURATION,
    "handler_duration_seconds",
    "Handler execution time in seconds",
    ["topic"],
    [
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0
    ]
);

// =============================================================================
// Redelivery metrics
// =============================================================================

define_counter_vec!(
    REDELIVERIES,
    "redeliveries_total",
    "Failed messages by redelivery outcome",
    ["topic", "outcome"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry policy attempts by policy and result",
    ["policy", "result"]
);

// =============================================================================
// Partition metrics
// =============================================================================

define_gauge_vec!(
    IN_FLIGHT_MESSAGES,
    "in_flight_messages",
    "Messages admitted but not yet completed",
    ["topic", "partition"]
);
define_gauge_vec!(
    COMMITTED_OFFSET,
    "committed_offset",
    "Last offset marked for commit",
    ["topic", "partition"]
);

// =============================================================================
// Session metrics
// =============================================================================

define_counter_vec!(
    SESSION_RESTARTS,
    "session_restarts_total",
    "Consumer-group session restarts by reason",
    ["topic", "reason"]
);

/// Register an IntGaugeVec safely, returning a fallback on error.
fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning a fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning a fallback on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric.
///
/// Idempotent. Metrics are otherwise registered lazily on first use.
pub fn init_metrics() {
    let _ = &*MESSAGES_CONSUMED;
    let _ = &*MESSAGES_SKIPPED;
    let _ = &*HANDLER_DURATION;
    let _ = &*REDELIVERIES;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*IN_FLIGHT_MESSAGES;
    let _ = &*COMMITTED_OFFSET;
    let _ = &*SESSION_RESTARTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a finished handler invocation.
pub fn record_handled(topic: &str, outcome: &str, duration_secs: f64) {
    MESSAGES_CONSUMED.with_label_values(&[topic, outcome]).inc();
    HANDLER_DURATION
        .with_label_values(&[topic])
        .observe(duration_secs);
}

pub fn record_skipped(topic: &str) {
    MESSAGES_SKIPPED.with_label_values(&[topic]).inc();
}

pub fn record_redelivery(topic: &str, outcome: &str) {
    REDELIVERIES.with_label_values(&[topic, outcome]).inc();
}

pub fn set_in_flight(tp: &TopicPartition, count: usize) {
    let partition = tp.partition.to_string();
    IN_FLIGHT_MESSAGES
        .with_label_values(&[tp.topic.as_ref(), partition.as_str()])
        .set(count as i64);
}

pub fn set_committed_offset(tp: &TopicPartition, offset: i64) {
    let partition = tp.partition.to_string();
    COMMITTED_OFFSET
        .with_label_values(&[tp.topic.as_ref(), partition.as_str()])
        .set(offset);
}

pub fn record_session_restart(topic: &str, reason: &str) {
    SESSION_RESTARTS.with_label_values(&[topic, reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_helpers() {
        // Should not panic
        record_handled("orders", "success", 0.002);
        record_handled("orders", "failure", 0.5);
        record_skipped("orders");
        record_redelivery("orders", "redelivered");
        record_session_restart("orders", "unknown_topic");
    }

    #[test]
    fn test_partition_gauges() {
        let tp = TopicPartition::new("metrics_gauge_topic", 3);
        set_in_flight(&tp, 4);
        set_committed_offset(&tp, 120);
        assert_eq!(
            IN_FLIGHT_MESSAGES
                .with_label_values(&["metrics_gauge_topic", "3"])
                .get(),
            4
        );
        assert_eq!(
            COMMITTED_OFFSET
                .with_label_values(&["metrics_gauge_topic", "3"])
                .get(),
            120
        );
    }

    #[test]
    fn test_encode_metrics_includes_prefix() {
        init_metrics();
        record_skipped("encode_topic");
        let text = encode_metrics().unwrap();
        assert!(text.contains("kafkaesque_consumer_messages_skipped_total"));
    }
}
