//! Message handlers and the topic-to-handler registry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;
use crate::message::{Envelope, TraceContext};

/// Processes one message.
///
/// Returning `Err` (or panicking) routes the message to redelivery. The
/// trace context is passed explicitly; it is the same one carried by the
/// `consume` span the handler runs in.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: TraceContext, message: Arc<Envelope>) -> Result<(), BoxError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(TraceContext, Arc<Envelope>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, ctx: TraceContext, message: Arc<Envelope>) -> Result<(), BoxError> {
        (self.f)(ctx, message).await
    }
}

/// Wrap an async closure as a shared handler.
///
/// ```rust
/// use kafkaesque_consumer::consumer::handler_fn;
///
/// let handler = handler_fn(|_ctx, msg| async move {
///     tracing::info!(payload = %msg.payload_str(), "got message");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(TraceContext, Arc<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handlers keyed by topic.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, replacing any previous one.
    pub fn register(&mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(topic.into(), handler);
    }

    pub fn with(mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(topic, handler);
        self
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(topic).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
