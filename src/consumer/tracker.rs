//! Per-partition in-flight tracking and the safe commit point.
//!
//! Handlers for one partition run concurrently and finish in any order. The
//! committed offset must never pass a message that is still running, so the
//! tracker keeps the set of in-flight offsets and derives the low watermark
//! (smallest unfinished offset) from it.
//!
//! # Watermarks
//!
//! - `high_watermark`: largest offset ever admitted (`-1` before the first)
//! - `low_watermark`: smallest in-flight offset, or `high_watermark + 1`
//!   when nothing is in flight
//!
//! The low watermark is only recomputed when the message sitting at it
//! completes. A later message finishing first cannot move it, so that case
//! is O(1); the rescan over the in-flight set only happens when the
//! watermark can actually advance.
//!
//! The state is plain data. Callers serialize access (one mutex per
//! partition) and issue the commit while still holding it, so commits for a
//! partition are monotonic.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::Envelope;
use crate::types::Offset;

/// Result of completing a tracked offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The offset that completed.
    pub offset: Offset,
    /// Low watermark after the completion.
    pub low_watermark: Offset,
}

impl Completion {
    /// Offset to mark for commit, if the completion made progress.
    pub fn commit_offset(&self) -> Option<Offset> {
        (self.low_watermark > self.offset).then_some(self.low_watermark)
    }
}

/// In-flight bookkeeping for one claimed partition.
#[derive(Debug)]
pub struct PartitionOffsetState {
    in_flight: HashMap<Offset, Arc<Envelope>>,
    low_watermark: Offset,
    high_watermark: Offset,
}

impl Default for PartitionOffsetState {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionOffsetState {
    pub fn new() -> Self {
        Self {
            in_flight: HashMap::new(),
            low_watermark: Offset(0),
            high_watermark: Offset(-1),
        }
    }

    pub fn low_watermark(&self) -> Offset {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> Offset {
        self.high_watermark
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn contains(&self, offset: Offset) -> bool {
        self.in_flight.contains_key(&offset)
    }

    pub fn get(&self, offset: Offset) -> Option<&Arc<Envelope>> {
        self.in_flight.get(&offset)
    }

    /// Record a message as in flight.
    ///
    /// The first message admitted into an idle partition resets the low
    /// watermark to its offset. A message below the current watermark (the
    /// broker rewound) pulls the watermark down with it.
    pub fn admit(&mut self, message: Arc<Envelope>) {
        let offset = message.offset();
        if self.in_flight.is_empty() || offset < self.low_watermark {
            self.low_watermark = offset;
        }
        self.high_watermark = self.high_watermark.max(offset);
        self.in_flight.insert(offset, message);
    }

    /// Remove a completed offset and recompute the low watermark if needed.
    ///
    /// Returns `None` when `offset` was not in flight. Each admitted offset
    /// completes exactly once; a second completion is ignored.
    pub fn complete(&mut self, offset: Offset) -> Option<Completion> {
        self.in_flight.remove(&offset)?;

        if offset <= self.low_watermark {
            self.low_watermark = self
                .in_flight
                .keys()
                .copied()
                .min()
                .unwrap_or(self.high_watermark.next());
        }

        Some(Completion {
            offset,
            low_watermark: self.low_watermark,
        })
    }

    /// Pass over a message this consumer does not handle.
    ///
    /// Only possible while idle: the offset is folded into the watermarks
    /// and the offset to commit is returned. With messages in flight the
    /// skip is left to later completions and `None` is returned.
    pub fn skip(&mut self, offset: Offset) -> Option<Offset> {
        if !self.in_flight.is_empty() {
            return None;
        }
        self.high_watermark = self.high_watermark.max(offset);
        self.low_watermark = self.high_watermark.next();
        Some(self.low_watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerMessage;
    use crate::message::Headers;
    use crate::types::TopicPartition;
    use bytes::Bytes;

    fn message(offset: i64) -> Arc<Envelope> {
        Arc::new(Envelope::new(
            TopicPartition::new("orders", 0),
            BrokerMessage {
                offset: Offset(offset),
                payload: Bytes::from_static(b"m"),
                headers: Headers::new(),
                timestamp: None,
            },
        ))
    }

    fn state_with(offsets: &[i64]) -> PartitionOffsetState {
        let mut state = PartitionOffsetState::new();
        for &o in offsets {
            state.admit(message(o));
        }
        state
    }

    #[test]
    fn test_first_admission_sets_low_watermark() {
        let state = state_with(&[100]);
        assert_eq!(state.low_watermark(), Offset(100));
        assert_eq!(state.high_watermark(), Offset(100));
        assert_eq!(state.in_flight_len(), 1);
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut state = state_with(&[100, 101, 102]);

        // 101 first: watermark untouched, nothing to commit
        let c = state.complete(Offset(101)).unwrap();
        assert_eq!(c.low_watermark, Offset(100));
        assert_eq!(c.commit_offset(), None);

        // 100: rescan over {102}
        let c = state.complete(Offset(100)).unwrap();
        assert_eq!(c.low_watermark, Offset(102));
        assert_eq!(c.commit_offset(), Some(Offset(102)));

        // 102: set empty, watermark is high + 1
        let c = state.complete(Offset(102)).unwrap();
        assert_eq!(c.low_watermark, Offset(103));
        assert_eq!(c.commit_offset(), Some(Offset(103)));
        assert!(state.is_idle());
    }

    #[test]
    fn test_in_order_completion_commits_each_step() {
        let mut state = state_with(&[5, 6]);
        assert_eq!(
            state.complete(Offset(5)).unwrap().commit_offset(),
            Some(Offset(6))
        );
        assert_eq!(
            state.complete(Offset(6)).unwrap().commit_offset(),
            Some(Offset(7))
        );
    }

    #[test]
    fn test_complete_untracked_offset() {
        let mut state = state_with(&[1]);
        assert_eq!(state.complete(Offset(9)), None);
        assert!(state.complete(Offset(1)).is_some());
        assert_eq!(state.complete(Offset(1)), None);
    }

    #[test]
    fn test_readmission_after_idle_resets_low() {
        let mut state = state_with(&[10]);
        state.complete(Offset(10));
        assert_eq!(state.low_watermark(), Offset(11));

        state.admit(message(15));
        assert_eq!(state.low_watermark(), Offset(15));
        assert_eq!(state.high_watermark(), Offset(15));
    }

    #[test]
    fn test_admission_below_watermark_pulls_it_down() {
        let mut state = state_with(&[20, 21]);
        state.admit(message(18));
        assert_eq!(state.low_watermark(), Offset(18));
        assert_eq!(state.high_watermark(), Offset(21));
    }

    #[test]
    fn test_skip_only_when_idle() {
        let mut state = PartitionOffsetState::new();
        assert_eq!(state.skip(Offset(4)), Some(Offset(5)));
        assert_eq!(state.low_watermark(), Offset(5));

        state.admit(message(5));
        assert_eq!(state.skip(Offset(6)), None);
        assert_eq!(state.high_watermark(), Offset(5));

        // 6 was never admitted, so the commit stops in front of it.
        let c = state.complete(Offset(5)).unwrap();
        assert_eq!(c.low_watermark, Offset(6));
    }

    #[test]
    fn test_watermark_never_passes_unfinished_offset() {
        // Fixed seed so failures reproduce.
        let mut rng = fastrand::Rng::with_seed(0x5eed_cafe);

        for _round in 0..200 {
            let mut state = PartitionOffsetState::new();
            let mut next = rng.i64(0..1_000);
            let mut pending: Vec<Offset> = Vec::new();
            let mut committed: Option<Offset> = None;

            for _step in 0..64 {
                let admit = pending.is_empty() || (pending.len() < 16 && rng.bool());
                if admit {
                    state.admit(message(next));
                    pending.push(Offset(next));
                    next += 1;
                } else {
                    let idx = rng.usize(..pending.len());
                    let done = pending.swap_remove(idx);
                    let completion = state.complete(done).unwrap();
                    if let Some(offset) = completion.commit_offset() {
                        if let Some(prev) = committed {
                            assert!(offset > prev, "commit went backwards");
                        }
                        committed = Some(offset);
                    }
                }

                if let (Some(c), Some(min)) = (committed, pending.iter().min()) {
                    assert!(c <= *min, "committed {c} past unfinished {min}");
                }
                if let Some(min) = pending.iter().min() {
                    assert_eq!(state.low_watermark(), *min);
                }
                assert!(state.low_watermark() <= state.high_watermark().next());
            }

            // Convergence
            for done in pending.drain(..) {
                state.complete(done);
            }
            assert!(state.is_idle());
            assert_eq!(state.low_watermark(), state.high_watermark().next());
        }
    }
}
