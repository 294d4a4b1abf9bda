//! Cache Configuration
//!
//! Per-topic settings that shape how a cached partition rolls, retains and
//! compacts its segments. Names and defaults follow the broker's topic
//! configuration so a topic's settings can be mirrored as-is.
//!
//! ## CacheConfig
//!
//! - **cleanup_policy**: `delete`, `compact` or `compact_and_delete` (default: delete)
//! - **segment_bytes**: Roll the head segment when the next entry would exceed this (default: 1GiB)
//! - **segment_ms**: Roll the head segment after this age (default: 7 days)
//! - **retention_ms**: Delete sealed segments older than this (default: 7 days)
//! - **min_cleanable_dirty_ratio**: Dirty share that makes a segment compactable (default: 0.5)
//! - **min_compaction_lag_ms** / **max_compaction_lag_ms**: Bounds on how long a dirty
//!   segment waits before compaction
//!
//! ## Usage
//!
//! ```ignore
//! use streamgate_cache::{CacheConfig, CleanupPolicy};
//!
//! let config = CacheConfig {
//!     cleanup_policy: CleanupPolicy::Compact,
//!     segment_bytes: 1024 * 1024, // 1MiB for faster rolling
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    Delete,
    Compact,
    CompactAndDelete,
}

impl CleanupPolicy {
    pub fn delete(self) -> bool {
        matches!(self, CleanupPolicy::Delete | CleanupPolicy::CompactAndDelete)
    }

    pub fn compact(self) -> bool {
        matches!(self, CleanupPolicy::Compact | CleanupPolicy::CompactAndDelete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Segment cleanup policy (default: delete)
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,

    /// Largest record the broker accepts (default: 1000012)
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: i32,

    /// Retention of sealed segments in milliseconds (default: 7 days)
    #[serde(default = "default_retention_ms")]
    pub retention_ms: i64,

    /// Retention of delete markers in milliseconds (default: 1 day)
    #[serde(default = "default_delete_retention_ms")]
    pub delete_retention_ms: i64,

    /// Minimum age of a dirty segment before compaction (default: 0)
    #[serde(default)]
    pub min_compaction_lag_ms: i64,

    /// Maximum age of a dirty segment before compaction (default: unbounded)
    #[serde(default = "default_max_compaction_lag_ms")]
    pub max_compaction_lag_ms: i64,

    /// Dirty bytes ratio above which a segment is compactable (default: 0.5)
    #[serde(default = "default_min_cleanable_dirty_ratio")]
    pub min_cleanable_dirty_ratio: f64,

    /// Age at which the head segment is rolled, in milliseconds (default: 7 days)
    #[serde(default = "default_segment_ms")]
    pub segment_ms: i64,

    /// Size at which the head segment is rolled (default: 1GiB)
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: i64,

    /// Size of a segment's offset index (default: 10MiB)
    #[serde(default = "default_segment_index_bytes")]
    pub segment_index_bytes: i64,

    /// Space reserved for trailing headers of produced records (default: 256)
    #[serde(default = "default_trailers_size_max")]
    pub trailers_size_max: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cleanup_policy: CleanupPolicy::default(),
            max_message_bytes: default_max_message_bytes(),
            retention_ms: default_retention_ms(),
            delete_retention_ms: default_delete_retention_ms(),
            min_compaction_lag_ms: 0,
            max_compaction_lag_ms: default_max_compaction_lag_ms(),
            min_cleanable_dirty_ratio: default_min_cleanable_dirty_ratio(),
            segment_ms: default_segment_ms(),
            segment_bytes: default_segment_bytes(),
            segment_index_bytes: default_segment_index_bytes(),
            trailers_size_max: default_trailers_size_max(),
        }
    }
}

fn default_max_message_bytes() -> i32 {
    1_000_012 // broker default message.max.bytes
}

fn default_retention_ms() -> i64 {
    604_800_000 // 7 days
}

fn default_delete_retention_ms() -> i64 {
    86_400_000 // 1 day
}

fn default_max_compaction_lag_ms() -> i64 {
    i64::MAX
}

fn default_min_cleanable_dirty_ratio() -> f64 {
    0.5
}

fn default_segment_ms() -> i64 {
    604_800_000 // 7 days
}

fn default_segment_bytes() -> i64 {
    0x4000_0000 // 1GiB
}

fn default_segment_index_bytes() -> i64 {
    0xA0_0000 // 10MiB
}

fn default_trailers_size_max() -> i32 {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.cleanup_policy, CleanupPolicy::Delete);
        assert_eq!(config.segment_bytes, 0x4000_0000);
        assert_eq!(config.max_compaction_lag_ms, i64::MAX);
        assert_eq!(config.trailers_size_max, 256);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CacheConfig = toml::from_str(
            r#"
            cleanup_policy = "compact_and_delete"
            segment_bytes = 4096
            "#,
        )
        .unwrap();

        assert!(config.cleanup_policy.compact());
        assert!(config.cleanup_policy.delete());
        assert_eq!(config.segment_bytes, 4096);
        assert_eq!(config.retention_ms, 604_800_000);
        assert_eq!(config.min_cleanable_dirty_ratio, 0.5);
    }

    #[test]
    fn test_policy_flags() {
        assert!(CleanupPolicy::Delete.delete());
        assert!(!CleanupPolicy::Delete.compact());
        assert!(CleanupPolicy::Compact.compact());
        assert!(!CleanupPolicy::Compact.delete());
    }
}
