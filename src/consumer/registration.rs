//! Consumer registration and the session reconnect loop.
//!
//! Each `(topic, group_id)` consumer runs an independent loop:
//!
//! ```text
//! connecting -> consuming -> (session ends) -> backoff -> connecting
//! ```
//!
//! The loop never gives up on its own. An unknown topic or partition is a
//! provisioning race and waits 3 minutes; any other failure, or a normal end
//! of session, waits 3 seconds. Configuration that can never work (a retry
//! limit without a delay ladder) is rejected before any loop is spawned.
//!
//! Loops are owned by a [`ConsumerRegistry`], which stops them all through a
//! broadcast shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::GroupConsumer;
use super::handler::HandlerRegistry;
use super::retry::RestartReason;
use crate::broker::{GroupConnector, Producer};
use crate::config::{ConsumerConfig, Settings};
use crate::delay::DelayTopics;
use crate::error::{ConfigError, ConsumerError, Result};
use crate::metrics;
use crate::routing::ClusterRouting;

/// Status of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Running,
    /// The loop exited (shutdown or panic).
    Stopped,
}

struct ConsumerTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Owns every running consumer loop.
pub struct ConsumerRegistry {
    tasks: Vec<ConsumerTask>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Vec::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Start the reconnect loop for one consumer.
    pub fn spawn(
        &mut self,
        consumer: GroupConsumer,
        connector: Arc<dyn GroupConnector>,
        routing: Arc<ClusterRouting>,
    ) {
        let name = format!(
            "{}/{}",
            consumer.config().topic(),
            consumer.config().group_id()
        );
        if self.shutting_down {
            warn!(consumer = %name, "Ignoring spawn during shutdown");
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = run_consumer_loop(consumer, connector, routing) => {}
                _ = shutdown_rx.recv() => {
                    debug!(consumer = %task_name, "Consumer received shutdown signal");
                }
            }
        });

        info!(consumer = %name, "Registered kafka consumer");
        self.tasks.push(ConsumerTask { name, handle });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// `topic/group_id` of every registered consumer.
    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Status of every loop as `(topic/group_id, status)`.
    pub fn health_check(&self) -> Vec<(&str, LoopStatus)> {
        self.tasks
            .iter()
            .map(|t| {
                let status = if t.handle.is_finished() {
                    LoopStatus::Stopped
                } else {
                    LoopStatus::Running
                };
                (t.name.as_str(), status)
            })
            .collect()
    }

    /// Signal every loop to stop and wait for them, up to `timeout`.
    ///
    /// Loops still running at the deadline are aborted.
    pub async fn shutdown(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(consumer_count = self.tasks.len(), "Stopping consumers");

        let _ = self.shutdown_tx.send(());
        let deadline = tokio::time::Instant::now() + timeout;

        for task in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = task.handle.abort_handle();
            match tokio::time::timeout(remaining, task.handle).await {
                Ok(Ok(())) => debug!(consumer = %task.name, "Consumer stopped"),
                Ok(Err(e)) => warn!(consumer = %task.name, error = %e, "Consumer loop panicked"),
                Err(_) => {
                    warn!(consumer = %task.name, "Consumer did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
}

impl Drop for ConsumerRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for task in self.tasks.drain(..) {
                task.handle.abort();
            }
        }
    }
}

/// Join, consume, back off; forever.
pub async fn run_consumer_loop(
    consumer: GroupConsumer,
    connector: Arc<dyn GroupConnector>,
    routing: Arc<ClusterRouting>,
) {
    let config = consumer.config();
    let topics = vec![config.topic().to_string()];
    let cluster = routing.resolve(config.topic());

    loop {
        let result = match connector
            .join_group(cluster, config.group_id(), &topics)
            .await
        {
            Ok(mut session) => {
                debug!(
                    topic = config.topic(),
                    group_id = config.group_id(),
                    "Joined consumer group"
                );
                consumer.consume(session.as_mut()).await
            }
            Err(e) => Err(ConsumerError::from(e)),
        };

        let reason = match &result {
            Ok(()) => {
                info!(
                    topic = config.topic(),
                    group_id = config.group_id(),
                    "Consumer session ended, rejoining"
                );
                RestartReason::Rebalance
            }
            Err(e) => {
                error!(
                    topic = config.topic(),
                    group_id = config.group_id(),
                    brokers = %cluster.bootstrap_servers(),
                    error = %e,
                    "Kafka consumer session failed"
                );
                RestartReason::for_error(e)
            }
        };
        metrics::record_session_restart(config.topic(), reason.as_str());
        tokio::time::sleep(reason.backoff()).await;
    }
}

/// Build and start every configured consumer.
///
/// Every consumer config is validated before anything is spawned, so a
/// fatal configuration error aborts startup with no loop running.
/// Consumers whose topic has no registered handler are skipped with a
/// warning.
pub fn register_consumers(
    settings: &Settings,
    handlers: &HandlerRegistry,
    connector: Arc<dyn GroupConnector>,
    producer: Arc<dyn Producer>,
) -> Result<ConsumerRegistry> {
    if let Err(errors) = settings.validate() {
        return Err(ConfigError::Invalid(errors).into());
    }
    let configs = settings.consumer_configs()?;
    let routing = Arc::new(settings.consumer_routing());
    let delay_topics = Arc::new(settings.delay_topics());

    register_all(configs, handlers, connector, producer, routing, delay_topics)
}

/// Start consumers from already-built configs.
pub fn register_all(
    configs: Vec<ConsumerConfig>,
    handlers: &HandlerRegistry,
    connector: Arc<dyn GroupConnector>,
    producer: Arc<dyn Producer>,
    routing: Arc<ClusterRouting>,
    delay_topics: Arc<DelayTopics>,
) -> Result<ConsumerRegistry> {
    let mut registry = ConsumerRegistry::new();
    for config in configs {
        let Some(handler) = handlers.get(config.topic()) else {
            warn!(
                topic = config.topic(),
                group_id = config.group_id(),
                "No handler registered for topic, consumer skipped"
            );
            continue;
        };
        let consumer = GroupConsumer::new(config, handler, producer.clone(), delay_topics.clone());
        registry.spawn(consumer, connector.clone(), routing.clone());
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::consumer::handler_fn;
    use crate::error::BrokerError;
    use crate::routing::ClusterSpec;

    fn routing() -> Arc<ClusterRouting> {
        Arc::new(ClusterRouting::single(ClusterSpec::new(["memory:9092"])))
    }

    fn consumer(broker: &Arc<MemoryBroker>) -> GroupConsumer {
        GroupConsumer::new(
            ConsumerConfig::builder("svc", "orders").build().unwrap(),
            handler_fn(|_, _| async { Ok(()) }),
            broker.clone(),
            Arc::new(DelayTopics::none()),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_topic_backs_off_three_minutes() {
        let broker = Arc::new(MemoryBroker::new());
        let mut registry = ConsumerRegistry::new();
        registry.spawn(consumer(&broker), broker.clone(), routing());

        settle().await;
        assert_eq!(broker.join_attempts("svc"), 1);

        tokio::time::advance(Duration::from_secs(179)).await;
        settle().await;
        assert_eq!(broker.join_attempts("svc"), 1);

        broker.create_topic("orders", 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(broker.join_attempts("svc"), 2);
        assert!(broker.has_session("svc"));

        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_error_backs_off_three_seconds() {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("orders", 1);
        broker.fail_next_join(BrokerError::Connection("refused".into()));

        let mut registry = ConsumerRegistry::new();
        registry.spawn(consumer(&broker), broker.clone(), routing());

        settle().await;
        assert_eq!(broker.join_attempts("svc"), 1);
        assert!(!broker.has_session("svc"));

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(broker.join_attempts("svc"), 2);
        assert!(broker.has_session("svc"));

        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loops() {
        let broker = Arc::new(MemoryBroker::new());
        let mut registry = ConsumerRegistry::new();
        registry.spawn(consumer(&broker), broker.clone(), routing());
        settle().await;
        assert_eq!(registry.health_check(), vec![("orders/svc", LoopStatus::Running)]);

        registry.shutdown(Duration::from_secs(1)).await;
        assert!(registry.is_shutting_down());
        assert!(registry.is_empty());

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(broker.join_attempts("svc"), 1);
    }

    #[tokio::test]
    async fn test_missing_handler_is_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        let settings = Settings::from_toml_str(
            r#"
[default_cluster]
brokers = ["memory:9092"]

[[consumers]]
topic = "orders"

[[consumers]]
topic = "payments"

[group_levels]
default = ["svc"]
"#,
        )
        .unwrap();
        let handlers = HandlerRegistry::new().with("orders", handler_fn(|_, _| async { Ok(()) }));

        let mut registry =
            register_consumers(&settings, &handlers, broker.clone(), broker.clone()).unwrap();
        assert_eq!(registry.names(), vec!["orders/svc"]);
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_fatal_config_aborts_before_spawning() {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("orders", 1);
        let settings = Settings::from_toml_str(
            r#"
[default_cluster]
brokers = ["memory:9092"]

[[consumers]]
topic = "orders"

[[consumers]]
topic = "payments"
retry_times = 3

[group_levels]
default = ["svc"]
"#,
        )
        .unwrap();
        let handlers = HandlerRegistry::new()
            .with("orders", handler_fn(|_, _| async { Ok(()) }))
            .with("payments", handler_fn(|_, _| async { Ok(()) }));

        let err = register_consumers(&settings, &handlers, broker.clone(), broker.clone())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConsumerError::Config(ConfigError::MissingDelayLadder { .. })
        ));
        settle().await;
        assert!(broker.joins().is_empty());
    }
}
