//! Application-facing message publishing.
//!
//! [`MessagePublisher`] stamps the headers the consumer side relies on
//! (`group`, `topic`, `traceId`, `retryTimes`) and routes delayed sends to
//! the matching delay topic. Cluster selection is left to the wrapped
//! [`Producer`], usually a [`RoutedProducer`](crate::routing::RoutedProducer).

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{error, info};

use crate::broker::{OutboundRecord, Producer};
use crate::constants::{HEADER_GROUP, HEADER_RETRY_TIMES, HEADER_TOPIC, HEADER_TRACE_ID};
use crate::delay::DelayTopics;
use crate::error::{ConsumerError, Result};
use crate::message::{Headers, TraceContext};

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Logical destination topic.
    pub topic: String,
    /// Group prefix the message is addressed to. Must not be empty.
    pub group: String,
    /// Requested delay in seconds. Zero sends immediately.
    pub delay_seconds: u32,
    pub body: Bytes,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, group: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            delay_seconds: 0,
            body: body.into(),
        }
    }

    pub fn with_delay(mut self, seconds: u32) -> Self {
        self.delay_seconds = seconds;
        self
    }
}

/// Publishes [`OutgoingMessage`]s.
#[derive(Clone)]
pub struct MessagePublisher {
    producer: Arc<dyn Producer>,
    delay_topics: Arc<DelayTopics>,
}

impl MessagePublisher {
    pub fn new(producer: Arc<dyn Producer>, delay_topics: Arc<DelayTopics>) -> Self {
        Self {
            producer,
            delay_topics,
        }
    }

    /// Build the record that [`send`](Self::send) would publish.
    pub fn record(&self, ctx: &TraceContext, message: &OutgoingMessage) -> Result<OutboundRecord> {
        if message.group.trim().is_empty() {
            return Err(ConsumerError::EmptyGroup);
        }

        let mut headers = Headers::new();
        headers.push(HEADER_GROUP, message.group.as_str());
        headers.push(HEADER_TOPIC, message.topic.as_str());
        headers.push(HEADER_TRACE_ID, ctx.trace_id());
        headers.push(HEADER_RETRY_TIMES, "0");

        let topic = self
            .delay_topics
            .resolve(message.delay_seconds, &message.topic)
            .to_string();

        Ok(OutboundRecord {
            topic,
            payload: message.body.clone(),
            headers,
        })
    }

    pub async fn send(&self, ctx: &TraceContext, message: OutgoingMessage) -> Result<()> {
        let record = self.record(ctx, &message)?;
        let start = Instant::now();

        match self.producer.publish(&record).await {
            Ok(()) => {
                info!(
                    trace_id = %ctx,
                    topic = %message.topic,
                    group = %message.group,
                    delay_secs = message.delay_seconds,
                    target_topic = %record.topic,
                    cost_ms = start.elapsed().as_millis() as u64,
                    "Message sent"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    trace_id = %ctx,
                    topic = %message.topic,
                    target_topic = %record.topic,
                    error = %e,
                    "Message send failed"
                );
                Err(e.into())
            }
        }
    }
}
