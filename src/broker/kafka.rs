//! `rdkafka` backend for the broker traits.
//!
//! # Sessions
//!
//! [`KafkaConnector::join_group`] creates one `StreamConsumer` per session
//! and subscribes it to the requested topics. A background task pulls
//! messages off the consumer and fans them out to one [`Claim`] per
//! partition, opened the first time the partition delivers a message.
//!
//! Each claim is fed by its own task. When a claim's buffer is full that
//! task pauses fetching for its partition and resumes it once the buffer
//! has room, so a slow partition never holds back the others.
//!
//! The session ends when the consumer reports an error. Every claim stream
//! is closed first, then [`GroupSession::next_claim`] returns the error.
//! Dropping the session stops the task and the consumer.
//!
//! # Commits
//!
//! Auto commit stays on, automatic offset store is off. The committer only
//! stores offsets; librdkafka flushes them on its commit interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message as _, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    BrokerMessage, Claim, GroupConnector, GroupSession, OffsetCommitter, OutboundRecord, Producer,
};
use crate::error::{BrokerError, BrokerResult};
use crate::message::Headers;
use crate::routing::{ClusterRouting, ClusterSpec, RoutedProducer};
use crate::types::{Offset, PartitionIndex};

const CLAIM_CAPACITY: usize = 1024;
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Base client settings for `cluster`, with SASL/PLAIN when credentials are set.
fn client_config(cluster: &ClusterSpec) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", cluster.bootstrap_servers());

    if let (Some(username), Some(password)) = (&cluster.username, &cluster.password) {
        config
            .set("security.protocol", "SASL_PLAINTEXT")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    config
}

fn map_error(e: KafkaError, context: &str) -> BrokerError {
    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            BrokerError::UnknownTopicOrPartition(context.to_string())
        }
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Resolve,
        ) => BrokerError::Connection(e.to_string()),
        _ => BrokerError::Session(e.to_string()),
    }
}

fn to_broker_message(message: &BorrowedMessage<'_>) -> BrokerMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    let value = h
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    (h.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    BrokerMessage {
        offset: Offset(message.offset()),
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

/// Joins consumer groups with `rdkafka`.
#[derive(Debug, Clone, Default)]
pub struct KafkaConnector;

impl KafkaConnector {
    pub fn new() -> Self {
        Self
    }

    async fn ensure_topics(consumer: Arc<StreamConsumer>, topics: Vec<String>) -> BrokerResult<()> {
        tokio::task::spawn_blocking(move || {
            for topic in &topics {
                let metadata = consumer
                    .fetch_metadata(Some(topic), METADATA_TIMEOUT)
                    .map_err(|e| map_error(e, topic))?;
                let known = metadata
                    .topics()
                    .iter()
                    .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty());
                if !known {
                    return Err(BrokerError::UnknownTopicOrPartition(topic.clone()));
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::Session(format!("metadata task failed: {e}")))?
    }
}

#[async_trait]
impl GroupConnector for KafkaConnector {
    async fn join_group(
        &self,
        cluster: &ClusterSpec,
        group_id: &str,
        topics: &[String],
    ) -> BrokerResult<Box<dyn GroupSession>> {
        let consumer: StreamConsumer = client_config(cluster)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let consumer = Arc::new(consumer);

        Self::ensure_topics(consumer.clone(), topics.to_vec()).await?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| map_error(e, &topics.join(",")))?;

        info!(
            group_id,
            brokers = %cluster.bootstrap_servers(),
            topics = ?topics,
            "Joined consumer group"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(demux(consumer.clone(), group_id.to_string(), events_tx));

        Ok(Box::new(KafkaSession {
            group_id: group_id.to_string(),
            consumer,
            events: events_rx,
            task,
        }))
    }
}

enum SessionEvent {
    Claim(Claim),
    Failed(BrokerError),
}

/// Fan messages out to per-partition claims until the consumer fails.
async fn demux(
    consumer: Arc<StreamConsumer>,
    group_id: String,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut feeds: HashMap<(Arc<str>, i32), mpsc::UnboundedSender<BrokerMessage>> = HashMap::new();

    loop {
        let (key, message) = match consumer.recv().await {
            Ok(message) => {
                let topic: Arc<str> = Arc::from(message.topic());
                ((topic, message.partition()), to_broker_message(&message))
            }
            Err(e) => {
                error!(group_id = %group_id, error = %e, "Consumer error, ending session");
                feeds.clear();
                let _ = events.send(SessionEvent::Failed(map_error(e, &group_id)));
                return;
            }
        };

        if !feeds.contains_key(&key) {
            let (tx, rx) = mpsc::channel(CLAIM_CAPACITY);
            let claim = Claim {
                topic: key.0.clone(),
                partition: PartitionIndex(key.1),
                messages: rx,
            };
            if events.send(SessionEvent::Claim(claim)).is_err() {
                debug!(group_id = %group_id, "Session dropped, stopping");
                return;
            }
            debug!(group_id = %group_id, topic = %key.0, partition = key.1, "Partition claimed");

            let (feed_tx, feed_rx) = mpsc::unbounded_channel();
            let flow = PartitionFlow {
                consumer: consumer.clone(),
                topic: key.0.clone(),
                partition: key.1,
            };
            tokio::spawn(feed_claim(feed_rx, tx, flow));
            feeds.insert(key.clone(), feed_tx);
        }

        let Some(feed) = feeds.get(&key) else {
            continue;
        };
        if feed.send(message).is_err() {
            warn!(
                group_id = %group_id,
                topic = %key.0,
                partition = key.1,
                "Claim closed, dropping partition"
            );
            feeds.remove(&key);
        }
    }
}

/// Fetch control for a single partition.
trait FlowControl: Send + 'static {
    fn pause(&self);
    fn resume(&self);
}

struct PartitionFlow {
    consumer: Arc<StreamConsumer>,
    topic: Arc<str>,
    partition: i32,
}

impl PartitionFlow {
    fn list(&self) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        list.add_partition(&self.topic, self.partition);
        list
    }
}

impl FlowControl for PartitionFlow {
    fn pause(&self) {
        match self.consumer.pause(&self.list()) {
            Ok(()) => debug!(topic = %self.topic, partition = self.partition, "Claim full, partition paused"),
            Err(e) => warn!(topic = %self.topic, partition = self.partition, error = %e, "Failed to pause partition"),
        }
    }

    fn resume(&self) {
        if let Err(e) = self.consumer.resume(&self.list()) {
            warn!(topic = %self.topic, partition = self.partition, error = %e, "Failed to resume partition");
        }
    }
}

/// Move messages into a claim, pausing the partition while the claim is full.
///
/// Ends when either side closes.
async fn feed_claim<F: FlowControl>(
    mut incoming: mpsc::UnboundedReceiver<BrokerMessage>,
    claim: mpsc::Sender<BrokerMessage>,
    flow: F,
) {
    while let Some(message) = incoming.recv().await {
        let message = match claim.try_send(message) {
            Ok(()) => continue,
            Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(message)) => message,
        };

        flow.pause();
        let sent = claim.send(message).await.is_ok();
        flow.resume();
        if !sent {
            return;
        }
    }
}

struct KafkaSession {
    group_id: String,
    consumer: Arc<StreamConsumer>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

#[async_trait]
impl GroupSession for KafkaSession {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn committer(&self) -> Arc<dyn OffsetCommitter> {
        Arc::new(KafkaCommitter {
            consumer: self.consumer.clone(),
        })
    }

    async fn next_claim(&mut self) -> BrokerResult<Option<Claim>> {
        match self.events.recv().await {
            Some(SessionEvent::Claim(claim)) => Ok(Some(claim)),
            Some(SessionEvent::Failed(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Drop for KafkaSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct KafkaCommitter {
    consumer: Arc<StreamConsumer>,
}

impl OffsetCommitter for KafkaCommitter {
    fn mark_offset(&self, topic: &str, partition: PartitionIndex, offset: Offset) {
        if let Err(e) = self
            .consumer
            .store_offset(topic, partition.value(), offset.value())
        {
            warn!(
                topic,
                partition = partition.value(),
                offset = offset.value(),
                error = %e,
                "Failed to store offset"
            );
        }
    }
}

/// Publishes records with `rdkafka`.
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn connect(cluster: &ClusterSpec) -> BrokerResult<Self> {
        let producer: FutureProducer = client_config(cluster)
            .set("message.timeout.ms", "30000")
            .set("acks", "all")
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { producer })
    }

    /// One producer per routed cluster plus the default cluster.
    pub fn routed(routing: &ClusterRouting) -> BrokerResult<RoutedProducer> {
        let default: Arc<dyn Producer> = Arc::new(Self::connect(routing.default_cluster())?);
        let mut routed = RoutedProducer::new(Some(default));
        for (name, cluster) in routing.clusters() {
            routed = routed.with_cluster(name, Arc::new(Self::connect(cluster)?));
        }
        for (topic, cluster) in routing.routes() {
            routed = routed.with_route(topic, cluster);
        }
        Ok(routed)
    }
}

fn to_owned_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value),
            })
        })
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn publish(&self, record: &OutboundRecord) -> BrokerResult<()> {
        let future_record = FutureRecord::<(), [u8]>::to(&record.topic)
            .payload(record.payload.as_ref())
            .headers(to_owned_headers(&record.headers));

        self.producer
            .send(future_record, PUBLISH_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Publish {
                topic: record.topic.clone(),
                reason: e.to_string(),
            })
    }
}
