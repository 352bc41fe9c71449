//! Centralized wire and tuning constants.
//!
//! Header keys are part of the wire contract shared with every producer and
//! delay service on the same topics; changing them breaks interoperability.
//!
//! # Categories
//!
//! - **Header Constants**: keys carried on every message
//! - **Cluster Constants**: names of the fallback clusters
//! - **Consumption Constants**: concurrency defaults and caps
//! - **Retry Constants**: redelivery and session backoff values

// =============================================================================
// Header Constants
// =============================================================================

/// Consumer-group prefix the message is addressed to.
pub const HEADER_GROUP: &str = "group";

/// Logical origin topic, preserved across delay hops.
pub const HEADER_TOPIC: &str = "topic";

/// Trace id propagated from the producing request.
pub const HEADER_TRACE_ID: &str = "traceId";

/// Decimal redelivery counter. Absent means zero.
pub const HEADER_RETRY_TIMES: &str = "retryTimes";

// =============================================================================
// Cluster Constants
// =============================================================================

/// Cluster used by producers when a topic has no explicit route.
pub const DEFAULT_PRODUCER_CLUSTER: &str = "default_producer";

/// Cluster used by consumers when a topic has no explicit route.
pub const DEFAULT_CONSUMER_CLUSTER: &str = "default_consumer";

/// Group level used when a consumer names an unknown level.
pub const DEFAULT_GROUP_LEVEL: &str = "default";

/// Environment variable naming the TOML settings file.
pub const CONFIG_PATH_ENV: &str = "KAFKA_CONFIG_PATH";

// =============================================================================
// Consumption Constants
// =============================================================================

/// Concurrent handlers per partition when none is configured.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Hard cap on concurrent handlers per partition.
pub const MAX_CONCURRENCY: usize = 100;

/// How long a partition claim waits for in-flight handlers on teardown.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Retry Constants
// =============================================================================

/// Publish attempts for a single redelivery before the message is given up.
pub const REDELIVERY_PUBLISH_ATTEMPTS: usize = 3;

/// Backoff after a generic consumer-group session failure.
pub const SESSION_RETRY_BACKOFF_SECS: u64 = 3;

/// Backoff when the topic or partition is not yet visible on the broker.
///
/// Topics are usually provisioned by a separate pipeline, so this is treated
/// as a race rather than an error.
pub const UNKNOWN_TOPIC_BACKOFF_SECS: u64 = 180;

/// Supported delay-topic buckets in seconds, ascending.
///
/// 30s, 1m, 2m, 3m, 5m, 10m, 15m, 30m, 1h, 2h, 4h, 6h, 12h, 1d.
pub const DELAY_LADDER_SECS: &[u32] = &[
    30, 60, 120, 180, 300, 600, 900, 1_800, 3_600, 7_200, 14_400, 21_600, 43_200, 86_400,
];
