//! Route resolution for member streams.
//!
//! The router answers which upstream route a topic is bound to, which broker
//! currently leads a partition, and how a topic's cache behaves. Fan-outs
//! compare the leader affinity of every member BEGIN with the router's view.

use std::collections::HashMap;

use parking_lot::RwLock;
use streamgate_cache::{CacheConfig, CleanupPolicy};
use streamgate_core::offset::{DeltaType, OffsetType};

use crate::config::GatewayConfig;

/// Identity of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub routed_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicOptions {
    pub default_offset: OffsetType,
    pub delta_type: DeltaType,
    pub cleanup_policy: CleanupPolicy,
    pub cache: CacheConfig,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            default_offset: OffsetType::Live,
            delta_type: DeltaType::None,
            cleanup_policy: CleanupPolicy::default(),
            cache: CacheConfig::default(),
        }
    }
}

pub trait Router: Send + Sync {
    fn resolve(&self, topic: &str, authorization: i64) -> Option<Route>;

    fn leader(&self, topic: &str, partition: i32) -> Option<i64>;

    fn topic_options(&self, topic: &str) -> TopicOptions;
}

struct StaticTopic {
    route: Route,
    options: TopicOptions,
    leaders: HashMap<i32, i64>,
}

/// Router serving the topic table of a [`GatewayConfig`].
pub struct StaticRouter {
    topics: RwLock<HashMap<String, StaticTopic>>,
}

impl StaticRouter {
    pub fn new(config: &GatewayConfig) -> Self {
        let topics = config
            .topics
            .iter()
            .enumerate()
            .map(|(index, topic)| {
                let options = TopicOptions {
                    default_offset: topic.default_offset,
                    delta_type: topic.delta_type,
                    cleanup_policy: topic.cache.cleanup_policy,
                    cache: topic.cache.clone(),
                };
                let leaders = topic.partitions.iter().map(|p| (p.id, p.leader)).collect();
                let route = Route {
                    routed_id: index as u64 + 1,
                };
                (topic.name.clone(), StaticTopic { route, options, leaders })
            })
            .collect();

        Self {
            topics: RwLock::new(topics),
        }
    }

    /// Record a leadership move; returns the previous leader.
    pub fn set_leader(&self, topic: &str, partition: i32, leader: i64) -> Option<i64> {
        self.topics
            .write()
            .get_mut(topic)
            .and_then(|topic| topic.leaders.insert(partition, leader))
    }
}

impl Router for StaticRouter {
    fn resolve(&self, topic: &str, _authorization: i64) -> Option<Route> {
        self.topics.read().get(topic).map(|topic| topic.route)
    }

    fn leader(&self, topic: &str, partition: i32) -> Option<i64> {
        self.topics
            .read()
            .get(topic)
            .and_then(|topic| topic.leaders.get(&partition).copied())
    }

    fn topic_options(&self, topic: &str) -> TopicOptions {
        self.topics
            .read()
            .get(topic)
            .map(|topic| topic.options.clone())
            .unwrap_or_default()
    }
}
