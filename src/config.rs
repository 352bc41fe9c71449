//! Consumer configuration.
//!
//! Two layers:
//!
//! - [`Settings`]: the TOML settings file (clusters, topic routes, consumers,
//!   group levels, delay topics). Loaded once at startup.
//! - [`ConsumerConfig`]: one validated, immutable consumer for one
//!   `(topic, group_id)` pair, built from a settings entry or directly.
//!
//! # Example
//!
//! ```toml
//! delay_topic_prefix = "delay_"
//!
//! [default_cluster]
//! brokers = ["localhost:9092"]
//!
//! [[consumer_clusters]]
//! name = "default_consumer"
//! brokers = ["kafka-a:9092", "kafka-b:9092"]
//!
//! [[consumer_topics]]
//! topic = "clicks"
//! cluster_name = "analytics"
//!
//! [[consumers]]
//! topic = "orders"
//! group_level = "default"
//! delay_time = [30, 60, 300]
//! retry_times = 3
//! concurrent_nums = 16
//!
//! [group_levels]
//! default = ["orders-svc"]
//! yoga = ["orders-svc-yoga"]
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    CONFIG_PATH_ENV, DEFAULT_CONCURRENCY, DEFAULT_CONSUMER_CLUSTER, DEFAULT_DRAIN_TIMEOUT_SECS,
    DEFAULT_GROUP_LEVEL, DEFAULT_PRODUCER_CLUSTER, MAX_CONCURRENCY,
};
use crate::delay::{DelayLadder, DelayTopics};
use crate::error::ConfigError;
use crate::routing::{ClusterRouting, ClusterSpec};

/// A cluster with a name routes can refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    #[serde(flatten)]
    pub cluster: ClusterSpec,
}

/// Route from a topic to a named cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TopicRoute {
    pub topic: String,
    pub cluster_name: String,
}

/// One configured consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConsumerEntry {
    pub topic: String,
    /// Selects which concrete group ids to join. Matched case-insensitively.
    #[serde(default)]
    pub group_level: String,
    /// Redelivery delay per attempt, ascending seconds.
    #[serde(default)]
    pub delay_time: Vec<u32>,
    /// Maximum redeliveries.
    #[serde(default)]
    pub retry_times: u32,
    /// Concurrent handlers per partition. `0` means the default.
    #[serde(default)]
    pub concurrent_nums: u32,
    /// Teardown wait for in-flight handlers, seconds.
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

/// Explicit delay bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DelayTopicEntry {
    pub seconds: u32,
    pub topic: String,
}

/// Contents of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Used when no `default_producer` / `default_consumer` cluster is named.
    pub default_cluster: ClusterSpec,
    pub producer_clusters: Vec<NamedCluster>,
    pub consumer_clusters: Vec<NamedCluster>,
    pub producer_topics: Vec<TopicRoute>,
    pub consumer_topics: Vec<TopicRoute>,
    pub consumers: Vec<ConsumerEntry>,
    /// Level name -> concrete consumer group ids.
    pub group_levels: HashMap<String, Vec<String>>,
    /// Explicit delay buckets. Takes precedence over the prefix.
    pub delay_topics: Vec<DelayTopicEntry>,
    /// Derive one delay topic per standard bucket: `{prefix}{secs}s`.
    pub delay_topic_prefix: Option<String>,
}

impl Settings {
    /// Load a `.toml` settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {}
            other => return Err(ConfigError::UnsupportedFormat(other.unwrap_or("").to_string())),
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            kind: e.kind(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load the file named by `KAFKA_CONFIG_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).map_err(|_| ConfigError::MissingEnv(CONFIG_PATH_ENV))?;
        Self::load(path)
    }

    /// Validate the settings.
    ///
    /// Returns a list of every problem found. Per-consumer retry/ladder rules
    /// are enforced by [`ConsumerConfig`] and abort registration on their own.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.consumers.is_empty() && self.consumer_routing().default_cluster().brokers.is_empty()
        {
            errors.push("no brokers configured for the default consumer cluster".to_string());
        }

        for (kind, clusters) in [
            ("producer", &self.producer_clusters),
            ("consumer", &self.consumer_clusters),
        ] {
            let mut seen = HashSet::new();
            for c in clusters {
                if c.name.trim().is_empty() {
                    errors.push(format!("{kind} cluster with empty name"));
                } else if !seen.insert(c.name.as_str()) {
                    errors.push(format!("duplicate {kind} cluster '{}'", c.name));
                }
                if c.cluster.brokers.is_empty() {
                    errors.push(format!("{kind} cluster '{}' has no brokers", c.name));
                }
            }
        }

        for (i, consumer) in self.consumers.iter().enumerate() {
            if consumer.topic.trim().is_empty() {
                errors.push(format!("consumers[{i}] has an empty topic"));
                continue;
            }
            if self.group_ids(&consumer.group_level).is_empty() {
                errors.push(format!(
                    "consumer for topic '{}' resolves to no group id (level '{}')",
                    consumer.topic, consumer.group_level
                ));
            }
        }

        let mut buckets = HashSet::new();
        for entry in &self.delay_topics {
            if entry.seconds == 0 {
                errors.push(format!("delay topic '{}' has a zero delay", entry.topic));
            }
            if entry.topic.trim().is_empty() {
                errors.push(format!("delay bucket {}s has an empty topic", entry.seconds));
            }
            if !buckets.insert(entry.seconds) {
                errors.push(format!("duplicate delay bucket {}s", entry.seconds));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Routing table used to pick the cluster a consumer joins.
    pub fn consumer_routing(&self) -> ClusterRouting {
        Self::routing(
            &self.default_cluster,
            &self.consumer_clusters,
            &self.consumer_topics,
            DEFAULT_CONSUMER_CLUSTER,
        )
    }

    /// Routing table used to pick the cluster a producer publishes to.
    pub fn producer_routing(&self) -> ClusterRouting {
        Self::routing(
            &self.default_cluster,
            &self.producer_clusters,
            &self.producer_topics,
            DEFAULT_PRODUCER_CLUSTER,
        )
    }

    fn routing(
        fallback: &ClusterSpec,
        clusters: &[NamedCluster],
        routes: &[TopicRoute],
        default_name: &str,
    ) -> ClusterRouting {
        let clusters: HashMap<String, ClusterSpec> = clusters
            .iter()
            .map(|c| (c.name.clone(), c.cluster.clone()))
            .collect();
        let default = clusters
            .get(default_name)
            .cloned()
            .unwrap_or_else(|| fallback.clone());
        let routes = routes
            .iter()
            .map(|r| (r.topic.clone(), r.cluster_name.clone()))
            .collect();
        ClusterRouting::new(default, clusters, routes)
    }

    /// Bucket to topic mapping for redeliveries and delayed sends.
    pub fn delay_topics(&self) -> DelayTopics {
        if !self.delay_topics.is_empty() {
            DelayTopics::new(
                self.delay_topics
                    .iter()
                    .map(|e| (e.seconds, e.topic.clone())),
            )
        } else if let Some(prefix) = &self.delay_topic_prefix {
            DelayTopics::with_prefix(prefix)
        } else {
            DelayTopics::none()
        }
    }

    /// Concrete group ids for a group level.
    ///
    /// The level is trimmed and matched case-insensitively. Unknown levels
    /// fall back to the `default` level.
    pub fn group_ids(&self, level: &str) -> Vec<String> {
        let wanted = level.trim().to_lowercase();
        let lookup = |name: &str| {
            self.group_levels
                .iter()
                .find(|(k, _)| k.trim().to_lowercase() == name)
                .map(|(_, ids)| ids.clone())
        };
        lookup(&wanted)
            .or_else(|| lookup(DEFAULT_GROUP_LEVEL))
            .unwrap_or_default()
    }

    /// One [`ConsumerConfig`] per configured consumer and group id.
    ///
    /// Fails on the first consumer that can never run.
    pub fn consumer_configs(&self) -> Result<Vec<ConsumerConfig>, ConfigError> {
        let mut configs = Vec::new();
        for entry in &self.consumers {
            for group_id in self.group_ids(&entry.group_level) {
                let mut builder = ConsumerConfig::builder(group_id, entry.topic.clone())
                    .concurrency(entry.concurrent_nums as usize)
                    .retry_limit(entry.retry_times)
                    .delay_ladder(entry.delay_time.clone());
                if let Some(secs) = entry.drain_timeout_secs {
                    builder = builder.drain_timeout(Duration::from_secs(secs));
                }
                configs.push(builder.build()?);
            }
        }
        Ok(configs)
    }
}

/// A validated consumer for one topic and group id. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    group_id: String,
    topic: String,
    concurrency: usize,
    retry_limit: u32,
    delay_ladder: DelayLadder,
    drain_timeout: Duration,
}

impl ConsumerConfig {
    pub fn builder(group_id: impl Into<String>, topic: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            group_id: group_id.into(),
            topic: topic.into(),
            concurrency: 0,
            retry_limit: 0,
            delay_ladder: Vec::new(),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Concurrent handlers per partition, within `1..=100`.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn delay_ladder(&self) -> &DelayLadder {
        &self.delay_ladder
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

/// Builder for [`ConsumerConfig`].
#[derive(Debug, Clone)]
pub struct ConsumerConfigBuilder {
    group_id: String,
    topic: String,
    concurrency: usize,
    retry_limit: u32,
    delay_ladder: Vec<u32>,
    drain_timeout: Duration,
}

impl ConsumerConfigBuilder {
    /// `0` selects the default; values above the cap are clamped.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn delay_ladder(mut self, secs: impl Into<Vec<u32>>) -> Self {
        self.delay_ladder = secs.into();
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Validate and build.
    ///
    /// A non-zero retry limit without a delay ladder can never redeliver and
    /// is rejected, as is a ladder that is not strictly ascending.
    pub fn build(self) -> Result<ConsumerConfig, ConfigError> {
        let ladder = DelayLadder::new(self.delay_ladder);
        if self.retry_limit > 0 && ladder.is_empty() {
            return Err(ConfigError::MissingDelayLadder {
                topic: self.topic,
                retry_limit: self.retry_limit,
            });
        }
        if !ladder.is_ascending() {
            return Err(ConfigError::UnorderedDelayLadder { topic: self.topic });
        }

        let concurrency = match self.concurrency {
            0 => DEFAULT_CONCURRENCY,
            n => n.min(MAX_CONCURRENCY),
        };

        Ok(ConsumerConfig {
            group_id: self.group_id,
            topic: self.topic,
            concurrency,
            retry_limit: self.retry_limit,
            delay_ladder: ladder,
            drain_timeout: self.drain_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
delay_topic_prefix = "delay_"

[default_cluster]
brokers = ["fallback:9092"]

[[consumer_clusters]]
name = "default_consumer"
brokers = ["consumer-a:9092", "consumer-b:9092"]

[[consumer_clusters]]
name = "analytics"
brokers = ["analytics:9092"]
username = "svc"
password = "secret"

[[producer_clusters]]
name = "log"
brokers = ["log:9092"]

[[consumer_topics]]
topic = "clicks"
cluster_name = "analytics"

[[producer_topics]]
topic = "audit"
cluster_name = "log"

[[consumers]]
topic = "orders"
group_level = " YOGA "
delay_time = [30, 60]
retry_times = 2
concurrent_nums = 500

[[consumers]]
topic = "clicks"
group_level = "mystery"

[group_levels]
default = ["svc"]
yoga = ["svc-yoga-a", "svc-yoga-b"]
"#;

    #[test]
    fn test_parse_sample() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.consumers.len(), 2);
        assert_eq!(settings.consumer_clusters[1].cluster.username.as_deref(), Some("svc"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_consumer_routing_prefers_named_default() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let routing = settings.consumer_routing();
        assert_eq!(
            routing.resolve("orders").brokers,
            vec!["consumer-a:9092", "consumer-b:9092"]
        );
        assert_eq!(routing.resolve("clicks").brokers, vec!["analytics:9092"]);
    }

    #[test]
    fn test_producer_routing_falls_back_to_default_cluster() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let routing = settings.producer_routing();
        assert_eq!(routing.resolve("orders").brokers, vec!["fallback:9092"]);
        assert_eq!(routing.resolve("audit").brokers, vec!["log:9092"]);
    }

    #[test]
    fn test_group_level_resolution() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.group_ids(" Yoga"), vec!["svc-yoga-a", "svc-yoga-b"]);
        assert_eq!(settings.group_ids("unknown"), vec!["svc"]);
        assert_eq!(settings.group_ids(""), vec!["svc"]);
    }

    #[test]
    fn test_consumer_configs_fan_out_per_group() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let configs = settings.consumer_configs().unwrap();
        let pairs: Vec<_> = configs
            .iter()
            .map(|c| (c.topic(), c.group_id()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("orders", "svc-yoga-a"),
                ("orders", "svc-yoga-b"),
                ("clicks", "svc")
            ]
        );
        assert_eq!(configs[0].concurrency(), MAX_CONCURRENCY);
        assert_eq!(configs[2].concurrency(), DEFAULT_CONCURRENCY);
        assert_eq!(configs[0].delay_ladder().as_slice(), &[30, 60]);
    }

    #[test]
    fn test_delay_topics_from_prefix_or_list() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.delay_topics().resolve(45, "orders"), "delay_60s");

        let explicit = Settings::from_toml_str(
            r#"
[[delay_topics]]
seconds = 10
topic = "retry_fast"
"#,
        )
        .unwrap();
        assert_eq!(explicit.delay_topics().resolve(3, "orders"), "retry_fast");
        assert!(Settings::default().delay_topics().is_empty());
    }

    #[test]
    fn test_retry_without_ladder_is_fatal() {
        let err = ConsumerConfig::builder("g", "orders")
            .retry_limit(3)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingDelayLadder {
                topic: "orders".into(),
                retry_limit: 3
            }
        );

        assert!(
            ConsumerConfig::builder("g", "orders")
                .retry_limit(0)
                .build()
                .is_ok()
        );
    }

    #[test]
    fn test_unordered_ladder_rejected() {
        let err = ConsumerConfig::builder("g", "orders")
            .retry_limit(1)
            .delay_ladder(vec![60, 30])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnorderedDelayLadder {
                topic: "orders".into()
            }
        );
    }

    #[test]
    fn test_settings_with_fatal_consumer() {
        let settings = Settings::from_toml_str(
            r#"
[default_cluster]
brokers = ["k:9092"]

[[consumers]]
topic = "orders"
retry_times = 2

[group_levels]
default = ["svc"]
"#,
        )
        .unwrap();
        assert!(matches!(
            settings.consumer_configs(),
            Err(ConfigError::MissingDelayLadder { .. })
        ));
    }

    #[test]
    fn test_validate_collects_errors() {
        let settings = Settings::from_toml_str(
            r#"
[[consumers]]
topic = "orders"

[[consumer_clusters]]
name = "a"
brokers = []

[[consumer_clusters]]
name = "a"
brokers = ["x:1"]

[[delay_topics]]
seconds = 0
topic = "now"
"#,
        )
        .unwrap();
        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("default consumer cluster")));
        assert!(errors.iter().any(|e| e.contains("duplicate consumer cluster 'a'")));
        assert!(errors.iter().any(|e| e.contains("has no brokers")));
        assert!(errors.iter().any(|e| e.contains("resolves to no group id")));
        assert!(errors.iter().any(|e| e.contains("zero delay")));
    }

    #[test]
    fn test_load_rejects_non_toml() {
        assert_eq!(
            Settings::load("kafka.yaml").unwrap_err(),
            ConfigError::UnsupportedFormat("yaml".into())
        );
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            Settings::from_toml_str("consumers = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
