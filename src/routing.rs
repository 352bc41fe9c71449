//! Topic to cluster routing.
//!
//! Producers and consumers each keep their own route table. A topic without
//! a route, or routed to a cluster name that does not exist, falls back to the
//! default cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};

use crate::broker::{OutboundRecord, Producer};
use crate::constants::HEADER_TOPIC;
use crate::error::{BrokerError, BrokerResult};

/// Connection parameters for one Kafka cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ClusterSpec {
    pub fn new(brokers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            username: None,
            password: None,
        }
    }

    /// Comma-separated bootstrap list.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// Resolves the cluster a topic lives on.
#[derive(Debug, Clone, Default)]
pub struct ClusterRouting {
    default: ClusterSpec,
    clusters: HashMap<String, ClusterSpec>,
    routes: HashMap<String, String>,
}

impl ClusterRouting {
    pub fn new(
        default: ClusterSpec,
        clusters: HashMap<String, ClusterSpec>,
        routes: HashMap<String, String>,
    ) -> Self {
        Self {
            default,
            clusters,
            routes,
        }
    }

    /// Route every topic to a single cluster.
    pub fn single(cluster: ClusterSpec) -> Self {
        Self::new(cluster, HashMap::new(), HashMap::new())
    }

    /// Name of the cluster `topic` is routed to, if it has a usable route.
    pub fn cluster_name(&self, topic: &str) -> Option<&str> {
        self.routes
            .get(topic)
            .filter(|name| self.clusters.contains_key(name.as_str()))
            .map(String::as_str)
    }

    pub fn resolve(&self, topic: &str) -> &ClusterSpec {
        self.cluster_name(topic)
            .and_then(|name| self.clusters.get(name))
            .unwrap_or(&self.default)
    }

    pub fn default_cluster(&self) -> &ClusterSpec {
        &self.default
    }

    pub fn clusters(&self) -> impl Iterator<Item = (&str, &ClusterSpec)> {
        self.clusters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `(topic, cluster name)` pairs, including routes to unknown clusters.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A [`Producer`] that picks one of several per-cluster producers by topic.
///
/// Topics routed to a cluster without a producer fall back to the default
/// producer. Without either, publishing fails with [`BrokerError::NoProducer`].
pub struct RoutedProducer {
    default: Option<Arc<dyn Producer>>,
    producers: HashMap<String, Arc<dyn Producer>>,
    routes: HashMap<String, String>,
}

impl RoutedProducer {
    pub fn new(default: Option<Arc<dyn Producer>>) -> Self {
        Self {
            default,
            producers: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    /// Register the producer for a named cluster.
    pub fn with_cluster(mut self, name: impl Into<String>, producer: Arc<dyn Producer>) -> Self {
        self.producers.insert(name.into(), producer);
        self
    }

    /// Route `topic` to the named cluster.
    pub fn with_route(mut self, topic: impl Into<String>, cluster: impl Into<String>) -> Self {
        self.routes.insert(topic.into(), cluster.into());
        self
    }

    fn producer_for(&self, topic: &str) -> Option<&Arc<dyn Producer>> {
        self.routes
            .get(topic)
            .and_then(|name| self.producers.get(name))
            .or(self.default.as_ref())
    }
}

#[async_trait]
impl Producer for RoutedProducer {
    async fn publish(&self, record: &OutboundRecord) -> BrokerResult<()> {
        let producer = self
            .producer_for(&record.topic)
            .ok_or_else(|| BrokerError::NoProducer(record.topic.clone()))?;

        let start = Instant::now();
        match producer.publish(record).await {
            Ok(()) => {
                debug!(
                    topic = %record.topic,
                    target_topic = record.headers.get(HEADER_TOPIC).unwrap_or_default(),
                    cost_ms = start.elapsed().as_millis() as u64,
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                error!(topic = %record.topic, error = %e, "Publish failed");
                Err(e)
            }
        }
    }
}
