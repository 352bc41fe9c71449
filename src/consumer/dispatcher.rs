//! Claim fan-out and per-message dispatch.
//!
//! [`GroupConsumer::consume`] runs one consumer-group session: every claimed
//! partition gets a [`PartitionDispatcher`] task with its own tracker and
//! token pool. The dispatcher admits each message, runs the handler on its
//! own task and, whatever the handler did, completes the offset and returns
//! the token.
//!
//! # Per-message lifecycle
//!
//! ```text
//! claim loop:  group check -> acquire token -> admit -> spawn ─┐
//!                                                              │
//! task:        handler (panics caught) -> redeliver on failure │
//!              -> complete + commit (under partition lock)     │
//!              -> release token  <─────────────────────────────┘
//! ```
//!
//! Completion and commit happen under the same lock, so commits for a
//! partition are issued in increasing order even when tasks race.
//!
//! When the session ends every claim loop is cancelled, including one parked
//! on a full token pool, and then drains for at most the drain timeout.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::handler::MessageHandler;
use super::limiter::{ConcurrencyLimiter, ConcurrencyToken};
use super::redelivery::Redeliverer;
use super::tracker::PartitionOffsetState;
use crate::broker::{BrokerMessage, GroupSession, OffsetCommitter, Producer};
use crate::config::ConsumerConfig;
use crate::delay::DelayTopics;
use crate::error::{HandlerFailure, Result};
use crate::message::{Envelope, TraceContext};
use crate::metrics;
use crate::types::{Offset, TopicPartition};

/// One consumer (topic + group id) bound to its handler.
#[derive(Clone)]
pub struct GroupConsumer {
    config: Arc<ConsumerConfig>,
    handler: Arc<dyn MessageHandler>,
    redeliverer: Arc<Redeliverer>,
}

impl GroupConsumer {
    pub fn new(
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        producer: Arc<dyn Producer>,
        delay_topics: Arc<DelayTopics>,
    ) -> Self {
        let redeliverer = Redeliverer::new(
            producer,
            delay_topics,
            config.retry_limit(),
            config.delay_ladder().clone(),
        );
        Self {
            config: Arc::new(config),
            handler,
            redeliverer: Arc::new(redeliverer),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume one session until it ends.
    ///
    /// Returns `Ok(())` when the session ends normally (rebalance) and the
    /// session error otherwise. Either way every partition claim loop has
    /// finished, including its bounded drain, before this returns. Dropping
    /// the future aborts the claim loops.
    pub async fn consume(&self, session: &mut dyn GroupSession) -> Result<()> {
        let committer = session.committer();
        let cancel = CancellationToken::new();
        let mut claims = JoinSet::new();

        let result = loop {
            match session.next_claim().await {
                Ok(Some(claim)) => {
                    let dispatcher = PartitionDispatcher::new(
                        TopicPartition::new(claim.topic, claim.partition),
                        self,
                        committer.clone(),
                    );
                    claims.spawn(dispatcher.run(claim.messages, cancel.child_token()));
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        cancel.cancel();

        while let Some(joined) = claims.join_next().await {
            if let Err(e) = joined {
                error!(
                    group_id = self.config.group_id(),
                    topic = self.config.topic(),
                    error = %e,
                    "Partition claim loop aborted"
                );
            }
        }
        result
    }
}

/// State shared between a claim loop and its handler tasks.
struct PartitionContext {
    source: TopicPartition,
    handler: Arc<dyn MessageHandler>,
    redeliverer: Arc<Redeliverer>,
    committer: Arc<dyn OffsetCommitter>,
    state: Mutex<PartitionOffsetState>,
}

impl PartitionContext {
    fn lock(&self) -> MutexGuard<'_, PartitionOffsetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark(&self, offset: Offset) {
        self.committer
            .mark_offset(&self.source.topic, self.source.partition, offset);
        metrics::set_committed_offset(&self.source, offset.value());
    }

    /// Run the handler, redeliver on failure, then complete the offset.
    async fn process(self: Arc<Self>, envelope: Arc<Envelope>, token: ConcurrencyToken) {
        let trace = envelope.trace().clone();
        info!(
            latency_ms = envelope.latency_ms(),
            retry_times = envelope.retry_times(),
            "Handling message"
        );

        let start = Instant::now();
        let result = AssertUnwindSafe(self.handler.handle(trace.clone(), envelope.clone()))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HandlerFailure::from(e)),
            Err(panic) => Err(HandlerFailure::Panicked(panic_message(panic.as_ref()))),
        };
        let cost = start.elapsed();

        // Everything below must reach `complete`, or the watermark sticks.
        match &outcome {
            Ok(()) => {
                info!(cost_ms = cost.as_millis() as u64, "Message handled");
                metrics::record_handled(&self.source.topic, "success", cost.as_secs_f64());
            }
            Err(failure) => {
                error!(
                    cost_ms = cost.as_millis() as u64,
                    payload = %envelope.payload_str(),
                    error = %failure,
                    "Handler failed"
                );
                let label = if failure.is_panic() { "panic" } else { "failure" };
                metrics::record_handled(&self.source.topic, label, cost.as_secs_f64());
                self.redeliver(&trace, &envelope, failure).await;
            }
        }

        self.complete(envelope.offset());
        drop(token);
    }

    async fn redeliver(&self, trace: &TraceContext, envelope: &Envelope, failure: &HandlerFailure) {
        let result = AssertUnwindSafe(self.redeliverer.redeliver(trace, envelope, failure))
            .catch_unwind()
            .await;
        if let Err(panic) = result {
            error!(
                payload = %envelope.payload_str(),
                error = %panic_message(panic.as_ref()),
                "Redelivery panicked, dropping message"
            );
        }
    }

    fn complete(&self, offset: Offset) {
        let mut state = self.lock();
        let Some(completion) = state.complete(offset) else {
            warn!(offset = offset.value(), "Completed offset was not in flight");
            return;
        };
        metrics::set_in_flight(&self.source, state.in_flight_len());

        if let Some(commit) = completion.commit_offset() {
            self.mark(commit);
            debug!(commit_offset = commit.value(), "Offset marked");
        }
    }
}

/// Claim loop for one partition.
pub struct PartitionDispatcher {
    ctx: Arc<PartitionContext>,
    group_id: Arc<str>,
    limiter: ConcurrencyLimiter,
    drain_timeout: Duration,
}

impl PartitionDispatcher {
    pub fn new(
        source: TopicPartition,
        consumer: &GroupConsumer,
        committer: Arc<dyn OffsetCommitter>,
    ) -> Self {
        Self {
            ctx: Arc::new(PartitionContext {
                source,
                handler: consumer.handler.clone(),
                redeliverer: consumer.redeliverer.clone(),
                committer,
                state: Mutex::new(PartitionOffsetState::new()),
            }),
            group_id: Arc::from(consumer.config.group_id()),
            limiter: ConcurrencyLimiter::new(consumer.config.concurrency()),
            drain_timeout: consumer.config.drain_timeout(),
        }
    }

    pub fn source(&self) -> &TopicPartition {
        &self.ctx.source
    }

    /// Dispatch every message of the claim until it closes or `cancel`
    /// fires, then drain.
    pub async fn run(self, mut messages: mpsc::Receiver<BrokerMessage>, cancel: CancellationToken) {
        let source = self.ctx.source.clone();
        info!(
            group_id = %self.group_id,
            topic = %source.topic,
            partition = source.partition.value(),
            concurrency = self.limiter.capacity(),
            "Partition claimed"
        );

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if !self.dispatch(message, &cancel).await {
                break;
            }
        }

        if !self.limiter.drain(self.drain_timeout).await {
            warn!(
                group_id = %self.group_id,
                topic = %source.topic,
                partition = source.partition.value(),
                in_flight = self.ctx.lock().in_flight_len(),
                drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                "Claim released with handlers still running"
            );
        }
        info!(
            group_id = %self.group_id,
            topic = %source.topic,
            partition = source.partition.value(),
            "Partition released"
        );
    }

    /// Admit one message. Returns `false` once the token pool is closed or
    /// the claim is cancelled while waiting for a token.
    async fn dispatch(&self, message: BrokerMessage, cancel: &CancellationToken) -> bool {
        let envelope = Arc::new(Envelope::new(self.ctx.source.clone(), message));

        if !envelope.is_addressed_to(&self.group_id) {
            self.skip(&envelope);
            return true;
        }

        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            token = self.limiter.acquire() => token,
        };
        let Some(token) = token else {
            debug!(
                offset = envelope.offset().value(),
                "Claim closed before a token was free, message left for the next session"
            );
            return false;
        };
        {
            let mut state = self.ctx.lock();
            state.admit(envelope.clone());
            metrics::set_in_flight(&self.ctx.source, state.in_flight_len());
        }

        let span = info_span!(
            "consume",
            trace_id = %envelope.trace(),
            group_id = %self.group_id,
            topic = %self.ctx.source.topic,
            partition = self.ctx.source.partition.value(),
            offset = envelope.offset().value(),
        );
        debug!(parent: &span, "Message admitted");
        tokio::spawn(self.ctx.clone().process(envelope, token).instrument(span));
        true
    }

    /// Pass over a message addressed to another group.
    fn skip(&self, envelope: &Envelope) {
        metrics::record_skipped(&self.ctx.source.topic);
        let mut state = self.ctx.lock();
        match state.skip(envelope.offset()) {
            Some(commit) => {
                self.ctx.mark(commit);
                debug!(
                    topic = %self.ctx.source.topic,
                    partition = self.ctx.source.partition.value(),
                    offset = envelope.offset().value(),
                    group = envelope.group().unwrap_or_default(),
                    "Skipped message for another group, offset marked"
                );
            }
            None => {
                debug!(
                    topic = %self.ctx.source.topic,
                    partition = self.ctx.source.partition.value(),
                    offset = envelope.offset().value(),
                    group = envelope.group().unwrap_or_default(),
                    "Skipped message for another group while others are in flight"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
