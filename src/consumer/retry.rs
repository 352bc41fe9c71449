//! Retry policies for the consumer.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Attempts | Use Case |
//! |--------|-----------|-----------|----------|----------|
//! | `redelivery_policy` | 50ms | 1s | 3 | Publishing a failed message to its delay topic |
//! | `session_backoff` | 3s | 3min | unbounded | Pause between consumer-group sessions |
//!
//! # Example
//!
//! ```rust,no_run
//! use kafkaesque_consumer::consumer::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), std::io::Error> {
//!     (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::redelivery_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await
//! }
//! ```

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::constants::{
    REDELIVERY_PUBLISH_ATTEMPTS, SESSION_RETRY_BACKOFF_SECS, UNKNOWN_TOPIC_BACKOFF_SECS,
};
use crate::error::ConsumerError;
use crate::metrics;

/// Policy for republishing a failed message.
///
/// Three attempts in total: the first try plus two retries.
pub fn redelivery_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(REDELIVERY_PUBLISH_ATTEMPTS.saturating_sub(1))
        .with_jitter()
}

/// Why a consumer-group session is being restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The topic or partition is not visible on the broker yet.
    UnknownTopic,
    /// Any other session failure.
    SessionError,
    /// The session ended without error (rebalance).
    Rebalance,
}

impl RestartReason {
    pub fn for_error(error: &ConsumerError) -> Self {
        if error.is_unknown_topic_or_partition() {
            RestartReason::UnknownTopic
        } else {
            RestartReason::SessionError
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::UnknownTopic => "unknown_topic",
            RestartReason::SessionError => "session_error",
            RestartReason::Rebalance => "rebalance",
        }
    }

    /// Pause before rejoining.
    pub fn backoff(&self) -> Duration {
        match self {
            RestartReason::UnknownTopic => Duration::from_secs(UNKNOWN_TOPIC_BACKOFF_SECS),
            RestartReason::SessionError | RestartReason::Rebalance => {
                Duration::from_secs(SESSION_RETRY_BACKOFF_SECS)
            }
        }
    }
}

/// Pause before rejoining after a failed session.
///
/// An unknown topic or partition is a provisioning race and waits the long
/// backoff; everything else waits the short one.
pub fn session_backoff(error: &ConsumerError) -> Duration {
    RestartReason::for_error(error).backoff()
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: usize) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all attempts failed).
pub fn record_retry_exhausted(policy_name: &str) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a retry success.
pub fn record_retry_success(policy_name: &str) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use backon::Retryable;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn publish_error() -> BrokerError {
        BrokerError::Publish {
            topic: "delay_30s".into(),
            reason: "timeout".into(),
        }
    }

    #[tokio::test]
    async fn test_redelivery_policy_makes_three_attempts() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), BrokerError> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(publish_error())
        })
        .retry(redelivery_policy())
        .when(BrokerError::is_retriable)
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_redelivery_policy_succeeds_on_last_attempt() {
        let attempts = AtomicU32::new(0);

        let result = (|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(publish_error())
            } else {
                Ok("published")
            }
        })
        .retry(redelivery_policy())
        .when(BrokerError::is_retriable)
        .await;

        assert_eq!(result.unwrap(), "published");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_redelivery_policy_skips_permanent_errors() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), BrokerError> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::NoProducer("orders".into()))
        })
        .retry(redelivery_policy())
        .when(BrokerError::is_retriable)
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_backoff_distinguishes_unknown_topic() {
        let unknown: ConsumerError = BrokerError::UnknownTopicOrPartition("orders".into()).into();
        assert_eq!(session_backoff(&unknown), Duration::from_secs(180));

        let other: ConsumerError = BrokerError::Session("rebalance failed".into()).into();
        assert_eq!(session_backoff(&other), Duration::from_secs(3));
    }

    #[test]
    fn test_restart_reason_labels() {
        assert_eq!(RestartReason::UnknownTopic.as_str(), "unknown_topic");
        assert_eq!(RestartReason::Rebalance.backoff(), Duration::from_secs(3));
    }

    #[test]
    fn test_record_helpers() {
        // Should not panic
        record_retry_attempt("redelivery", 1);
        record_retry_exhausted("redelivery");
        record_retry_success("redelivery");
    }
}
