//! Partitioned, concurrent message consumption.
//!
//! # Architecture
//!
//! ```text
//! register_consumers ─► ConsumerRegistry
//!                          │  one reconnect loop per (topic, group_id)
//!                          ▼
//!                     GroupConsumer::consume(session)
//!                          │  one task per claimed partition
//!                          ▼
//!                     PartitionDispatcher
//!                       ├─ ConcurrencyLimiter   (token pool, backpressure)
//!                       ├─ PartitionOffsetState (low/high watermark)
//!                       └─ per-message task ─► MessageHandler
//!                                          └─► Redeliverer on failure
//! ```
//!
//! # Modules
//!
//! - [`tracker`]: in-flight set and safe commit point per partition
//! - [`limiter`]: per-partition admission control
//! - [`handler`]: handler trait and topic registry
//! - [`redelivery`]: retry ladder and delay-topic publishing
//! - [`retry`]: backoff policies
//! - [`dispatcher`]: claim fan-out and per-message lifecycle
//! - [`registration`]: reconnect loop and consumer lifecycle

pub mod dispatcher;
pub mod handler;
pub mod limiter;
pub mod redelivery;
pub mod registration;
pub mod retry;
pub mod tracker;

pub use dispatcher::{GroupConsumer, PartitionDispatcher};
pub use handler::{FnHandler, HandlerRegistry, MessageHandler, handler_fn};
pub use limiter::{ConcurrencyLimiter, ConcurrencyToken};
pub use redelivery::{RedeliveryOutcome, RedeliveryPlan, Redeliverer};
pub use registration::{
    ConsumerRegistry, LoopStatus, register_all, register_consumers, run_consumer_loop,
};
pub use tracker::{Completion, PartitionOffsetState};
