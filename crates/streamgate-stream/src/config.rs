//! Gateway Configuration
//!
//! Settings shared by every shard of the gateway plus the static topic table
//! the [`StaticRouter`](crate::router::StaticRouter) serves from.
//!
//! ## GatewayConfig
//!
//! - **server_reconnect_delay_secs**: Upper bound of the fetch upstream reconnect backoff (default: 5)
//! - **client_reconnect_delay_secs**: Upper bound of the produce upstream reconnect backoff, 0 disables (default: 0)
//! - **client_cleanup_delay_secs**: Grace period before an idle produce upstream is closed (default: 30)
//! - **produce_window_bytes** / **fetch_window_bytes**: Window granted upstream (default: 64KiB)
//! - **budget_slots**: Slots in the shared budget pool (default: 1024)
//!
//! ## Example
//!
//! ```toml
//! server_reconnect_delay_secs = 5
//!
//! [[topics]]
//! name = "orders"
//! default_offset = "historical"
//! partitions = [{ id = 0, leader = 1 }, { id = 1, leader = 2 }]
//!
//! [topics.cache]
//! cleanup_policy = "compact"
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use streamgate_cache::CacheConfig;
use streamgate_core::offset::{DeltaType, OffsetType};

use crate::error::StreamError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_server_reconnect_delay_secs")]
    pub server_reconnect_delay_secs: u64,

    #[serde(default)]
    pub client_reconnect_delay_secs: u64,

    #[serde(default = "default_client_cleanup_delay_secs")]
    pub client_cleanup_delay_secs: u64,

    #[serde(default = "default_window_bytes")]
    pub produce_window_bytes: i32,

    #[serde(default = "default_window_bytes")]
    pub fetch_window_bytes: i32,

    #[serde(default = "default_budget_slots")]
    pub budget_slots: usize,

    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,

    /// Where a fetch upstream starts when the cache is empty (default: live)
    #[serde(default = "default_offset")]
    pub default_offset: OffsetType,

    #[serde(default)]
    pub delta_type: DeltaType,

    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub id: i32,
    pub leader: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_reconnect_delay_secs: default_server_reconnect_delay_secs(),
            client_reconnect_delay_secs: 0,
            client_cleanup_delay_secs: default_client_cleanup_delay_secs(),
            produce_window_bytes: default_window_bytes(),
            fetch_window_bytes: default_window_bytes(),
            budget_slots: default_budget_slots(),
            topics: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), StreamError> {
        if self.budget_slots == 0 {
            return Err(StreamError::Config("budget_slots must be positive".to_string()));
        }
        if self.produce_window_bytes <= 0 || self.fetch_window_bytes <= 0 {
            return Err(StreamError::Config("window sizes must be positive".to_string()));
        }
        for topic in &self.topics {
            if self.topics.iter().filter(|t| t.name == topic.name).count() > 1 {
                return Err(StreamError::Config(format!("duplicate topic {}", topic.name)));
            }
        }
        Ok(())
    }

    pub fn topic(&self, name: &str) -> Option<&TopicConfig> {
        self.topics.iter().find(|topic| topic.name == name)
    }
}

impl TopicConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_offset: default_offset(),
            delta_type: DeltaType::default(),
            partitions: Vec::new(),
            cache: CacheConfig::default(),
        }
    }

    pub fn with_partition(mut self, id: i32, leader: i64) -> Self {
        self.partitions.push(PartitionConfig { id, leader });
        self
    }
}

fn default_server_reconnect_delay_secs() -> u64 {
    5
}

fn default_client_cleanup_delay_secs() -> u64 {
    30
}

fn default_window_bytes() -> i32 {
    64 * 1024
}

fn default_budget_slots() -> usize {
    1024
}

fn default_offset() -> OffsetType {
    OffsetType::Live
}
