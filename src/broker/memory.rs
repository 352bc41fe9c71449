//! In-memory broker for testing.
//!
//! Implements every broker collaborator trait without a network:
//! topics are vectors of messages, consumer groups get one claim per
//! partition, commits and publishes are recorded for assertions, and
//! failures can be injected.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! kafkaesque-consumer = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Notify, mpsc};
use tracing::warn;

use super::{
    BrokerMessage, Claim, GroupConnector, GroupSession, OffsetCommitter, OutboundRecord, Producer,
};
use crate::error::{BrokerError, BrokerResult};
use crate::message::Headers;
use crate::routing::ClusterSpec;
use crate::types::{Offset, PartitionIndex};

/// Buffered messages per claim before delivery is dropped.
const CLAIM_CAPACITY: usize = 4096;

/// Key: (group_id, topic, partition)
type CommitKey = (String, String, PartitionIndex);

/// A recorded offset commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group_id: String,
    pub topic: String,
    pub partition: PartitionIndex,
    pub offset: Offset,
}

/// A recorded join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRecord {
    pub group_id: String,
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
}

enum SessionEvent {
    Ended,
    Failed(BrokerError),
}

struct ActiveSession {
    senders: HashMap<(String, PartitionIndex), mpsc::Sender<BrokerMessage>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct State {
    /// topic -> partition logs
    topics: HashMap<String, Vec<Vec<BrokerMessage>>>,
    /// group_id -> live session
    sessions: HashMap<String, ActiveSession>,
    committed: HashMap<CommitKey, Offset>,
    commit_log: Vec<CommitRecord>,
    published: Vec<OutboundRecord>,
    joins: Vec<JoinRecord>,
    join_failures: VecDeque<BrokerError>,
    publish_failures: usize,
}

impl State {
    /// Append to a partition log and forward to every live claim on it.
    fn append(
        &mut self,
        topic: &str,
        partition: PartitionIndex,
        payload: Bytes,
        headers: Headers,
    ) -> BrokerResult<Offset> {
        let log = self
            .topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition.value() as usize))
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition(format!("{topic}/{partition}")))?;

        let offset = Offset(log.len() as i64);
        let message = BrokerMessage {
            offset,
            payload,
            headers,
            timestamp: Some(Utc::now()),
        };
        log.push(message.clone());

        let key = (topic.to_string(), partition);
        for (group_id, session) in &self.sessions {
            if let Some(tx) = session.senders.get(&key)
                && tx.try_send(message.clone()).is_err()
            {
                warn!(group_id = %group_id, topic, partition = partition.value(), "Claim buffer full or closed, message not forwarded");
            }
        }
        Ok(offset)
    }
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker implementing [`GroupConnector`] and [`Producer`].
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Create (or reset) a topic with `partitions` empty partitions.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.shared
            .lock()
            .topics
            .insert(topic.to_string(), vec![Vec::new(); partitions]);
    }

    /// Append a message and forward it to live claims. Returns its offset.
    pub fn deliver(
        &self,
        topic: &str,
        partition: i32,
        payload: impl Into<Bytes>,
        headers: Headers,
    ) -> BrokerResult<Offset> {
        self.shared
            .lock()
            .append(topic, PartitionIndex(partition), payload.into(), headers)
    }

    /// End the group's session normally, as a rebalance would.
    pub fn end_session(&self, group_id: &str) {
        if let Some(session) = self.shared.lock().sessions.remove(group_id) {
            let _ = session.events.send(SessionEvent::Ended);
        }
    }

    /// Fail the group's session with `error`.
    pub fn fail_session(&self, group_id: &str, error: BrokerError) {
        if let Some(session) = self.shared.lock().sessions.remove(group_id) {
            let _ = session.events.send(SessionEvent::Failed(error));
        }
    }

    /// Make the next join attempt fail with `error`.
    pub fn fail_next_join(&self, error: BrokerError) {
        self.shared.lock().join_failures.push_back(error);
    }

    /// Make the next `count` publish attempts fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.lock().publish_failures = count;
    }

    pub fn has_session(&self, group_id: &str) -> bool {
        self.shared.lock().sessions.contains_key(group_id)
    }

    pub fn joins(&self) -> Vec<JoinRecord> {
        self.shared.lock().joins.clone()
    }

    pub fn join_attempts(&self, group_id: &str) -> usize {
        self.shared
            .lock()
            .joins
            .iter()
            .filter(|j| j.group_id == group_id)
            .count()
    }

    pub fn published(&self) -> Vec<OutboundRecord> {
        self.shared.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<OutboundRecord> {
        self.shared
            .lock()
            .published
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// Latest committed offset for the group on a partition.
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<Offset> {
        self.shared
            .lock()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), PartitionIndex(partition)))
            .copied()
    }

    /// Every commit for the group on a partition, in order.
    pub fn commit_history(&self, group_id: &str, topic: &str, partition: i32) -> Vec<Offset> {
        self.shared
            .lock()
            .commit_log
            .iter()
            .filter(|c| {
                c.group_id == group_id && c.topic == topic && c.partition == PartitionIndex(partition)
            })
            .map(|c| c.offset)
            .collect()
    }

    /// Wait until the committed offset reaches `offset`.
    pub async fn wait_for_commit(&self, group_id: &str, topic: &str, partition: i32, offset: Offset) {
        self.wait_until(|| {
            self.committed(group_id, topic, partition)
                .is_some_and(|c| c >= offset)
        })
        .await
    }

    /// Wait until at least `count` records have been published.
    pub async fn wait_for_published(&self, count: usize) {
        self.wait_until(|| self.shared.lock().published.len() >= count)
            .await
    }

    async fn wait_until(&self, mut condition: impl FnMut() -> bool) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if condition() {
                return;
            }
            notified.await;
        }
    }
}

struct MemoryCommitter {
    group_id: String,
    shared: Arc<Shared>,
}

impl OffsetCommitter for MemoryCommitter {
    fn mark_offset(&self, topic: &str, partition: PartitionIndex, offset: Offset) {
        {
            let mut state = self.shared.lock();
            state.committed.insert(
                (self.group_id.clone(), topic.to_string(), partition),
                offset,
            );
            state.commit_log.push(CommitRecord {
                group_id: self.group_id.clone(),
                topic: topic.to_string(),
                partition,
                offset,
            });
        }
        self.shared.changed.notify_waiters();
    }
}

struct MemorySession {
    group_id: String,
    pending: VecDeque<Claim>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    committer: Arc<MemoryCommitter>,
}

#[async_trait]
impl GroupSession for MemorySession {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn committer(&self) -> Arc<dyn OffsetCommitter> {
        self.committer.clone()
    }

    async fn next_claim(&mut self) -> BrokerResult<Option<Claim>> {
        if let Some(claim) = self.pending.pop_front() {
            return Ok(Some(claim));
        }
        match self.events.recv().await {
            Some(SessionEvent::Failed(e)) => Err(e),
            Some(SessionEvent::Ended) | None => Ok(None),
        }
    }
}

#[async_trait]
impl GroupConnector for MemoryBroker {
    async fn join_group(
        &self,
        cluster: &ClusterSpec,
        group_id: &str,
        topics: &[String],
    ) -> BrokerResult<Box<dyn GroupSession>> {
        let mut state = self.shared.lock();
        state.joins.push(JoinRecord {
            group_id: group_id.to_string(),
            brokers: cluster.brokers.clone(),
            topics: topics.to_vec(),
        });
        if let Some(error) = state.join_failures.pop_front() {
            return Err(error);
        }
        if let Some(missing) = topics.iter().find(|t| !state.topics.contains_key(t.as_str())) {
            return Err(BrokerError::UnknownTopicOrPartition(missing.clone()));
        }

        // A rejoin replaces the previous generation.
        if let Some(previous) = state.sessions.remove(group_id) {
            let _ = previous.events.send(SessionEvent::Ended);
        }

        let mut pending = VecDeque::new();
        let mut senders = HashMap::new();
        for topic in topics {
            let partitions = state.topics.get(topic).map(Vec::as_slice).unwrap_or_default();
            for (index, log) in partitions.iter().enumerate() {
                let partition = PartitionIndex(index as i32);
                let start = state
                    .committed
                    .get(&(group_id.to_string(), topic.clone(), partition))
                    .copied()
                    .unwrap_or_default();

                let (tx, rx) = mpsc::channel(CLAIM_CAPACITY);
                for message in log.iter().filter(|m| m.offset >= start) {
                    let _ = tx.try_send(message.clone());
                }
                senders.insert((topic.clone(), partition), tx);
                pending.push_back(Claim {
                    topic: Arc::from(topic.as_str()),
                    partition,
                    messages: rx,
                });
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            group_id.to_string(),
            ActiveSession {
                senders,
                events: events_tx,
            },
        );

        Ok(Box::new(MemorySession {
            group_id: group_id.to_string(),
            pending,
            events: events_rx,
            committer: Arc::new(MemoryCommitter {
                group_id: group_id.to_string(),
                shared: self.shared.clone(),
            }),
        }))
    }
}

#[async_trait]
impl Producer for MemoryBroker {
    async fn publish(&self, record: &OutboundRecord) -> BrokerResult<()> {
        {
            let mut state = self.shared.lock();
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(BrokerError::Publish {
                    topic: record.topic.clone(),
                    reason: "injected failure".to_string(),
                });
            }
            state.published.push(record.clone());
            if state.topics.contains_key(&record.topic) {
                state.append(
                    &record.topic,
                    PartitionIndex(0),
                    record.payload.clone(),
                    record.headers.clone(),
                )?;
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterSpec {
        ClusterSpec::new(["memory:9092"])
    }

    #[tokio::test]
    async fn test_join_unknown_topic_fails() {
        let broker = MemoryBroker::new();
        let result = broker
            .join_group(&cluster(), "g", &["missing".to_string()])
            .await;
        assert!(matches!(
            result,
            Err(BrokerError::UnknownTopicOrPartition(ref t)) if t == "missing"
        ));
        assert_eq!(broker.join_attempts("g"), 1);
    }

    #[tokio::test]
    async fn test_claims_replay_from_committed_offset() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 1);
        for i in 0..3 {
            broker
                .deliver("orders", 0, format!("m{i}"), Headers::new())
                .unwrap();
        }

        let mut session = broker
            .join_group(&cluster(), "g", &["orders".to_string()])
            .await
            .unwrap();
        session
            .committer()
            .mark_offset("orders", PartitionIndex(0), Offset(2));
        broker.end_session("g");

        let mut session = broker
            .join_group(&cluster(), "g", &["orders".to_string()])
            .await
            .unwrap();
        let mut claim = session.next_claim().await.unwrap().unwrap();
        let first = claim.messages.recv().await.unwrap();
        assert_eq!(first.offset, Offset(2));
        assert_eq!(broker.commit_history("g", "orders", 0), vec![Offset(2)]);
    }

    #[tokio::test]
    async fn test_end_session_closes_claims() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 2);
        let mut session = broker
            .join_group(&cluster(), "g", &["orders".to_string()])
            .await
            .unwrap();
        let mut a = session.next_claim().await.unwrap().unwrap();
        let mut b = session.next_claim().await.unwrap().unwrap();
        assert_ne!(a.partition, b.partition);

        broker.end_session("g");
        assert!(session.next_claim().await.unwrap().is_none());
        assert!(a.messages.recv().await.is_none());
        assert!(b.messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_session_reports_error() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 1);
        let mut session = broker
            .join_group(&cluster(), "g", &["orders".to_string()])
            .await
            .unwrap();
        let _claim = session.next_claim().await.unwrap();
        broker.fail_session("g", BrokerError::Session("coordinator moved".into()));
        assert_eq!(
            session.next_claim().await.unwrap_err(),
            BrokerError::Session("coordinator moved".into())
        );
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        let record = OutboundRecord {
            topic: "t".into(),
            payload: Bytes::from_static(b"x"),
            headers: Headers::new(),
        };
        assert!(broker.publish(&record).await.is_err());
        assert!(broker.publish(&record).await.is_ok());
        assert_eq!(broker.published().len(), 1);
    }
}
