//! # Kafkaesque Consumer
//! Partitioned, concurrent Kafka consumption with out-of-order-safe offset
//! commits and delayed redelivery.
//!
//! Each claimed partition runs up to N handlers at once. Handlers finish in
//! any order, but the committed offset only ever advances past messages that
//! are done, so a crash never skips an unprocessed message. Failed messages
//! are republished to delay topics with a retry counter instead of blocking
//! the partition.
//!
//! # Goals
//! - Never commit past an in-flight message
//! - Bounded per-partition parallelism with natural backpressure
//! - A failing or panicking handler never stalls its partition
//! - Consumers that keep reconnecting until shut down
//!
//! ## Getting started
//! ```toml
//! kafkaesque-consumer = { version = "0.1", features = ["rdkafka"] }
//! ```
//!
//! ### Running consumers
//! Bind a [`MessageHandler`](consumer::MessageHandler) to each topic, load the
//! settings file and register. Registration fails fast on configuration that
//! can never work; everything after that is retried forever.
//!
//! ```rust,no_run
//! # #[cfg(feature = "rdkafka")]
//! # async fn run() -> kafkaesque_consumer::error::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use kafkaesque_consumer::broker::kafka::{KafkaConnector, KafkaProducer};
//! use kafkaesque_consumer::prelude::*;
//!
//! let settings = Settings::from_env()?;
//! let producer = KafkaProducer::routed(&settings.producer_routing())?;
//!
//! let handlers = HandlerRegistry::new().with(
//!     "orders",
//!     handler_fn(|ctx, message| async move {
//!         tracing::info!(trace_id = %ctx, body = %message.payload_str(), "order");
//!         Ok(())
//!     }),
//! );
//!
//! let mut registry = register_consumers(
//!     &settings,
//!     &handlers,
//!     Arc::new(KafkaConnector::new()),
//!     Arc::new(producer),
//! )?;
//!
//! tokio::signal::ctrl_c().await.ok();
//! registry.shutdown(Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Publishing
//! [`MessagePublisher`](producer::MessagePublisher) stamps the routing
//! headers consumers filter on and sends delayed messages to the matching
//! delay topic.
//!
//! ## Feature flags
//! - `rdkafka`: the [`broker::kafka`] backend
//! - `test-utilities`: the in-memory [`broker::memory`] backend
//! - `loom`: concurrency model tests

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod delay;
pub mod error;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod routing;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for wiring consumers and publishers.
    pub use crate::broker::{GroupConnector, GroupSession, OffsetCommitter, Producer};
    pub use crate::config::{ConsumerConfig, Settings};
    pub use crate::consumer::{
        ConsumerRegistry, GroupConsumer, HandlerRegistry, MessageHandler, handler_fn,
        register_all, register_consumers,
    };
    pub use crate::delay::{DelayLadder, DelayTopics};
    pub use crate::error::{BoxError, BrokerError, ConfigError, ConsumerError, Result};
    pub use crate::message::{Envelope, Headers, TraceContext};
    pub use crate::producer::{MessagePublisher, OutgoingMessage};
    pub use crate::routing::{ClusterRouting, ClusterSpec, RoutedProducer};
    pub use crate::types::{Offset, PartitionIndex, TopicPartition};

    pub use bytes;
}
