//! Crate level errors.
//!
//! # Error Hierarchy
//!
//! - [`BrokerError`]: failures reported by the broker collaborators (session,
//!   connection, publish). Recoverable at the session or publish level.
//! - [`ConfigError`]: configuration that can never succeed. Fatal at startup.
//! - [`HandlerFailure`]: a user handler returned an error or panicked. Routed
//!   to the redelivery path, never propagated out of the claim loop.
//! - [`ConsumerError`]: aggregates the above for public entry points.

use std::io;
use std::result;

use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, ConsumerError>;

/// Result type for broker collaborator operations.
pub type BrokerResult<T> = result::Result<T, BrokerError>;

/// Boxed error returned by message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by the broker client, session or producer.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum BrokerError {
    /// The topic or partition is not (yet) visible on the broker.
    #[error("Unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),

    /// Could not reach the cluster.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The consumer-group session failed (rebalance error, disconnect).
    #[error("Session error: {0}")]
    Session(String),

    /// A produce request failed.
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// No producer is configured for the topic's cluster or the default one.
    #[error("No producer available for topic {0}")]
    NoProducer(String),
}

impl BrokerError {
    /// True when the broker does not know the topic/partition yet.
    pub fn is_unknown_topic_or_partition(&self) -> bool {
        matches!(self, BrokerError::UnknownTopicOrPartition(_))
    }

    /// True for failures worth another attempt against the same broker.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::Publish { .. } | BrokerError::Connection(_) | BrokerError::Session(_)
        )
    }
}

/// Configuration errors. None of these are retried.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ConfigError {
    /// A non-zero retry limit needs somewhere to redeliver to.
    #[error("Topic {topic}: retry limit {retry_limit} configured without a delay ladder")]
    MissingDelayLadder { topic: String, retry_limit: u32 },

    /// Delay ladders must be strictly ascending.
    #[error("Topic {topic}: delay ladder must be strictly ascending")]
    UnorderedDelayLadder { topic: String },

    /// Only TOML settings files are understood.
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// The settings file could not be read.
    #[error("Failed to read config {path}: {kind:?}")]
    Read { path: String, kind: io::ErrorKind },

    /// The settings file is not valid TOML for [`Settings`](crate::config::Settings).
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A required environment variable is missing.
    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// One or more validation rules failed.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Why a handler invocation did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum HandlerFailure {
    /// The handler returned an error.
    #[error("Handler error: {0}")]
    Reported(String),

    /// The handler panicked; the panic was caught at the task boundary.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerFailure {
    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerFailure::Panicked(_))
    }
}

impl From<BoxError> for HandlerFailure {
    fn from(e: BoxError) -> Self {
        HandlerFailure::Reported(e.to_string())
    }
}

/// Top-level error for the consumer crate.
#[derive(Debug, ThisError)]
pub enum ConsumerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Handler(#[from] HandlerFailure),

    /// Outgoing messages must name the group they are addressed to.
    #[error("Message group must not be empty")]
    EmptyGroup,
}

impl ConsumerError {
    /// True when the underlying broker error is an unknown topic/partition.
    pub fn is_unknown_topic_or_partition(&self) -> bool {
        matches!(self, ConsumerError::Broker(e) if e.is_unknown_topic_or_partition())
    }
}
