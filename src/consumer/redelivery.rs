//! Redelivery of failed messages through delay topics.
//!
//! A failed message is republished with its original payload and headers,
//! `retryTimes` incremented, to the delay topic matching the ladder entry
//! for its attempt. Once `retryTimes` reaches the consumer's retry limit the
//! message is logged and dropped. Either way the original offset is then
//! completed, so a failing message never stalls its partition.

use std::sync::Arc;

use backon::Retryable;
use tracing::{error, warn};

use super::retry;
use crate::broker::{OutboundRecord, Producer};
use crate::constants::HEADER_TOPIC;
use crate::delay::{DelayLadder, DelayTopics};
use crate::error::{BrokerError, HandlerFailure};
use crate::message::{Envelope, TraceContext};
use crate::metrics;

const POLICY_NAME: &str = "redelivery";

/// What to do with a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryPlan {
    /// Retry limit reached: drop.
    Exhausted,
    /// Publish `record` after `delay_secs`.
    Publish {
        delay_secs: u32,
        record: OutboundRecord,
    },
}

/// Result of handling a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryOutcome {
    Redelivered { topic: String, delay_secs: u32 },
    Exhausted,
    /// Every publish attempt failed. The message is treated as consumed.
    PublishFailed(BrokerError),
}

impl RedeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedeliveryOutcome::Redelivered { .. } => "redelivered",
            RedeliveryOutcome::Exhausted => "exhausted",
            RedeliveryOutcome::PublishFailed(_) => "publish_failed",
        }
    }
}

/// Republishes failed messages for one consumer.
#[derive(Clone)]
pub struct Redeliverer {
    producer: Arc<dyn Producer>,
    delay_topics: Arc<DelayTopics>,
    retry_limit: u32,
    ladder: DelayLadder,
}

impl Redeliverer {
    pub fn new(
        producer: Arc<dyn Producer>,
        delay_topics: Arc<DelayTopics>,
        retry_limit: u32,
        ladder: DelayLadder,
    ) -> Self {
        Self {
            producer,
            delay_topics,
            retry_limit,
            ladder,
        }
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Decide where a failed message goes next.
    pub fn plan(&self, envelope: &Envelope) -> RedeliveryPlan {
        let retry_times = envelope.retry_times();
        if retry_times >= self.retry_limit {
            return RedeliveryPlan::Exhausted;
        }

        let delay_secs = self.ladder.delay_for_attempt(retry_times).unwrap_or(0);
        let topic = self.delay_topics.resolve(delay_secs, envelope.topic());

        let mut headers = envelope.redelivery_headers();
        if headers.get(HEADER_TOPIC).is_none_or(str::is_empty) {
            headers.set(HEADER_TOPIC, envelope.topic());
        }

        RedeliveryPlan::Publish {
            delay_secs,
            record: OutboundRecord {
                topic: topic.to_string(),
                payload: envelope.payload().clone(),
                headers,
            },
        }
    }

    /// Route a failed message to its delay topic, or drop it.
    pub async fn redeliver(
        &self,
        ctx: &TraceContext,
        envelope: &Envelope,
        failure: &HandlerFailure,
    ) -> RedeliveryOutcome {
        let outcome = match self.plan(envelope) {
            RedeliveryPlan::Exhausted => {
                error!(
                    trace_id = %ctx,
                    topic = envelope.topic(),
                    partition = envelope.partition().value(),
                    offset = envelope.offset().value(),
                    retry_times = envelope.retry_times(),
                    retry_limit = self.retry_limit,
                    payload = %envelope.payload_str(),
                    error = %failure,
                    "Retries exhausted, dropping message"
                );
                RedeliveryOutcome::Exhausted
            }
            RedeliveryPlan::Publish { delay_secs, record } => {
                self.publish(ctx, envelope, failure, delay_secs, record)
                    .await
            }
        };

        metrics::record_redelivery(envelope.topic(), outcome.as_str());
        outcome
    }

    async fn publish(
        &self,
        ctx: &TraceContext,
        envelope: &Envelope,
        failure: &HandlerFailure,
        delay_secs: u32,
        record: OutboundRecord,
    ) -> RedeliveryOutcome {
        let mut attempt = 0usize;
        let result = (|| async { self.producer.publish(&record).await })
            .retry(retry::redelivery_policy())
            .when(BrokerError::is_retriable)
            .notify(|e, dur| {
                attempt += 1;
                retry::record_retry_attempt(POLICY_NAME, attempt);
                warn!(
                    trace_id = %ctx,
                    target_topic = %record.topic,
                    error = %e,
                    backoff_ms = dur.as_millis() as u64,
                    "Redelivery publish failed, retrying"
                );
            })
            .await;

        match result {
            Ok(()) => {
                retry::record_retry_success(POLICY_NAME);
                warn!(
                    trace_id = %ctx,
                    topic = envelope.topic(),
                    partition = envelope.partition().value(),
                    offset = envelope.offset().value(),
                    retry_times = envelope.retry_times() + 1,
                    delay_secs,
                    target_topic = %record.topic,
                    error = %failure,
                    "Message redelivered"
                );
                RedeliveryOutcome::Redelivered {
                    topic: record.topic,
                    delay_secs,
                }
            }
            Err(e) => {
                retry::record_retry_exhausted(POLICY_NAME);
                error!(
                    trace_id = %ctx,
                    topic = envelope.topic(),
                    partition = envelope.partition().value(),
                    offset = envelope.offset().value(),
                    retry_times = envelope.retry_times(),
                    target_topic = %record.topic,
                    payload = %envelope.payload_str(),
                    handler_error = %failure,
                    error = %e,
                    "Redelivery failed, message considered consumed"
                );
                RedeliveryOutcome::PublishFailed(e)
            }
        }
    }
}
