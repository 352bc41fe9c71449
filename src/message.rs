//! Message envelope, header list and trace context.
//!
//! Header values arrive as strings on the wire. The routing headers are parsed
//! once when a message is admitted into an [`Envelope`]; the retry path works
//! on the typed fields and only renders strings again when republishing.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::broker::BrokerMessage;
use crate::constants::{HEADER_GROUP, HEADER_RETRY_TIMES, HEADER_TOPIC, HEADER_TRACE_ID};
use crate::types::{Offset, PartitionIndex, TopicPartition};

/// Ordered list of string headers.
///
/// Order is preserved when messages are republished. Lookups return the
/// first header with a matching key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Value of the first header named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first header named `key`, or append it.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    /// Append a header without checking for duplicates.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Request-scoped trace identity, threaded explicitly from admission through
/// the handler, completion and redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: Arc<str>,
}

impl TraceContext {
    /// Use the given trace id, or mint a new one when it is missing or blank.
    pub fn from_trace_id(trace_id: Option<&str>) -> Self {
        match trace_id.map(str::trim) {
            Some(id) if !id.is_empty() => Self {
                trace_id: Arc::from(id),
            },
            _ => Self::new_root(),
        }
    }

    /// Start a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: Arc::from(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.trace_id)
    }
}

/// A claimed message, parsed once at admission.
#[derive(Debug, Clone)]
pub struct Envelope {
    source: TopicPartition,
    offset: Offset,
    payload: Bytes,
    headers: Headers,
    timestamp: Option<DateTime<Utc>>,
    retry_times: u32,
    trace: TraceContext,
}

impl Envelope {
    /// Build an envelope for a message delivered on `source`.
    ///
    /// A missing or non-numeric `retryTimes` header counts as zero.
    pub fn new(source: TopicPartition, message: BrokerMessage) -> Self {
        let retry_times = message
            .headers
            .get(HEADER_RETRY_TIMES)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0);
        let trace = TraceContext::from_trace_id(message.headers.get(HEADER_TRACE_ID));

        Self {
            source,
            offset: message.offset,
            payload: message.payload,
            headers: message.headers,
            timestamp: message.timestamp,
            retry_times,
            trace,
        }
    }

    pub fn source(&self) -> &TopicPartition {
        &self.source
    }

    /// Physical topic the message was consumed from.
    pub fn topic(&self) -> &str {
        &self.source.topic
    }

    pub fn partition(&self) -> PartitionIndex {
        self.source.partition
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// How many times this message has already been redelivered.
    pub fn retry_times(&self) -> u32 {
        self.retry_times
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// The `group` header, if present and non-empty.
    pub fn group(&self) -> Option<&str> {
        self.headers.get(HEADER_GROUP).filter(|g| !g.is_empty())
    }

    /// Logical origin topic: the `topic` header, else the physical topic.
    pub fn origin_topic(&self) -> &str {
        self.headers
            .get(HEADER_TOPIC)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.topic())
    }

    /// Whether a consumer running `group_id` should handle this message.
    ///
    /// Untagged messages are for everyone. Tagged messages match when the
    /// consumer's group id starts with the tag.
    pub fn is_addressed_to(&self, group_id: &str) -> bool {
        match self.group() {
            Some(group) => group_id.starts_with(group),
            None => true,
        }
    }

    /// Headers for the next redelivery: the originals with `retryTimes`
    /// incremented and the trace id of this delivery.
    pub fn redelivery_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        headers.set(HEADER_RETRY_TIMES, (self.retry_times + 1).to_string());
        headers.set(HEADER_TRACE_ID, self.trace.trace_id());
        headers
    }

    /// Milliseconds since the broker timestamp, if the broker provided one.
    pub fn latency_ms(&self) -> Option<i64> {
        self.timestamp
            .map(|ts| (Utc::now() - ts).num_milliseconds().max(0))
    }
}
