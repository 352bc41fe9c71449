//! Broker collaborator traits.
//!
//! The consumer never talks to Kafka directly. It consumes three narrow
//! seams, so the wire client can be swapped (or replaced by an in-memory
//! broker in tests):
//!
//! - [`GroupConnector`]: build a client for a cluster and join a consumer group
//! - [`GroupSession`]: hand out partition [`Claim`]s and an [`OffsetCommitter`]
//! - [`Producer`]: publish a record with headers
//!
//! # Available Implementations
//!
//! - [`memory::MemoryBroker`]: in-memory broker for tests (`test-utilities` feature)
//! - [`kafka::KafkaConnector`] / [`kafka::KafkaProducer`]: `rdkafka` backend (`rdkafka` feature)

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::BrokerResult;
use crate::message::Headers;
use crate::routing::ClusterSpec;
use crate::types::{Offset, PartitionIndex};

#[cfg(feature = "rdkafka")]
pub mod kafka;
#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

/// A message as delivered by the broker on a claimed partition.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub offset: Offset,
    pub payload: Bytes,
    pub headers: Headers,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub payload: Bytes,
    pub headers: Headers,
}

/// One partition assigned to this member for the current session.
///
/// The stream ends when the partition is revoked or the session ends.
#[derive(Debug)]
pub struct Claim {
    pub topic: Arc<str>,
    pub partition: PartitionIndex,
    pub messages: mpsc::Receiver<BrokerMessage>,
}

/// Store-only offset commits.
///
/// `mark_offset` records `offset` as the next offset to consume. It does not
/// force a flush; the client commits stored offsets on its own schedule.
pub trait OffsetCommitter: Send + Sync {
    fn mark_offset(&self, topic: &str, partition: PartitionIndex, offset: Offset);
}

/// Membership in a consumer group for one generation.
#[async_trait]
pub trait GroupSession: Send {
    /// Consumer group id this session belongs to.
    fn group_id(&self) -> &str;

    /// Committer shared by every in-flight message of this session.
    fn committer(&self) -> Arc<dyn OffsetCommitter>;

    /// Wait for the next claimed partition.
    ///
    /// Returns `Ok(None)` when the session ends normally (rebalance or
    /// shutdown) and `Err` when it fails. In both cases every claim stream
    /// handed out by this session has been closed.
    async fn next_claim(&mut self) -> BrokerResult<Option<Claim>>;
}

/// Builds broker clients and joins consumer groups.
#[async_trait]
pub trait GroupConnector: Send + Sync {
    async fn join_group(
        &self,
        cluster: &ClusterSpec,
        group_id: &str,
        topics: &[String],
    ) -> BrokerResult<Box<dyn GroupSession>>;
}

/// Publishes records.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, record: &OutboundRecord) -> BrokerResult<()>;
}
