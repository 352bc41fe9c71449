//! Delay ladders and delay-topic resolution.
//!
//! A failed message is redelivered through a delay topic: a topic whose
//! messages are held back for a fixed bucket duration before they reach the
//! consumer again. Only a fixed set of buckets exists, so a requested delay is
//! rounded up to the nearest bucket (or down to the largest one).

use std::collections::BTreeMap;

use crate::constants::DELAY_LADDER_SECS;

/// Smallest bucket `>= requested`, else the largest bucket.
///
/// Returns `None` for an empty ladder. `ladder` must be ascending.
pub fn resolve_bucket(requested_secs: u32, ladder: &[u32]) -> Option<u32> {
    ladder
        .iter()
        .copied()
        .find(|&bucket| bucket >= requested_secs)
        .or_else(|| ladder.last().copied())
}

/// Per-consumer ascending list of redelivery delays in seconds.
///
/// Entry `k` is the delay used after the message has failed `k` times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelayLadder(Vec<u32>);

impl DelayLadder {
    pub fn new(secs: impl Into<Vec<u32>>) -> Self {
        Self(secs.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    /// Strictly ascending, as required for bucket lookups.
    pub fn is_ascending(&self) -> bool {
        self.0.windows(2).all(|w| w[0] < w[1])
    }

    /// Delay for a message that has already been retried `retry_times` times.
    ///
    /// Past the end of the ladder the last (largest) entry is reused.
    pub fn delay_for_attempt(&self, retry_times: u32) -> Option<u32> {
        self.0
            .get(retry_times as usize)
            .or_else(|| self.0.last())
            .copied()
    }
}

/// Mapping from bucket duration to the topic that implements it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelayTopics {
    buckets: BTreeMap<u32, String>,
}

impl DelayTopics {
    /// No delay topics: every delay resolves to the original topic.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(buckets: impl IntoIterator<Item = (u32, String)>) -> Self {
        Self {
            buckets: buckets.into_iter().collect(),
        }
    }

    /// One topic per standard bucket, named `{prefix}{secs}s`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self::new(
            DELAY_LADDER_SECS
                .iter()
                .map(|&secs| (secs, format!("{prefix}{secs}s"))),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Supported buckets, ascending.
    pub fn buckets(&self) -> impl Iterator<Item = u32> + '_ {
        self.buckets.keys().copied()
    }

    /// Topic to publish to for a requested delay.
    ///
    /// A zero delay, or no configured delay topics, returns `topic` unchanged
    /// so the message is redelivered immediately on its own topic.
    pub fn resolve<'a>(&'a self, delay_secs: u32, topic: &'a str) -> &'a str {
        if delay_secs == 0 {
            return topic;
        }
        let ladder: Vec<u32> = self.buckets().collect();
        resolve_bucket(delay_secs, &ladder)
            .and_then(|bucket| self.buckets.get(&bucket))
            .map(String::as_str)
            .unwrap_or(topic)
    }
}
