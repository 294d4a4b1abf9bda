//! Offset policy and partition progress.

use serde::{Deserialize, Serialize};

/// Sentinel offsets a fetch may start from instead of an explicit offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetType {
    /// Start after the latest offset and follow new records
    Live,
    /// Start at the earliest retained offset and stop at the latest one
    Historical,
}

impl OffsetType {
    pub const LIVE: i64 = -1;
    pub const HISTORICAL: i64 = -2;

    pub fn value(self) -> i64 {
        match self {
            OffsetType::Live => Self::LIVE,
            OffsetType::Historical => Self::HISTORICAL,
        }
    }

    /// Interpret a raw offset field; explicit offsets yield `None`.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            Self::LIVE => Some(OffsetType::Live),
            Self::HISTORICAL => Some(OffsetType::Historical),
            _ => None,
        }
    }
}

pub const DEFAULT_LATEST_OFFSET: i64 = OffsetType::LIVE;
pub const DEFAULT_STABLE_OFFSET: i64 = OffsetType::LIVE;

/// Sequence number stamped on the empty entry written for a produce FLUSH.
pub const PRODUCE_FLUSH_SEQUENCE: i32 = -1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    #[default]
    ReadUncommitted,
    ReadCommitted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    #[default]
    None,
    JsonPatch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Evaluation {
    #[default]
    Lazy,
    Eager,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    None,
    LeaderOnly,
    #[default]
    InSyncReplicas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionResult {
    Commit,
    Abort,
}

/// Progress of a partition as reported by the broker.
///
/// `stable_offset` is the last transactionally committed position and
/// `latest_offset` the last appended one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionProgress {
    pub partition_id: i32,
    pub partition_offset: i64,
    pub stable_offset: i64,
    pub latest_offset: i64,
}

impl PartitionProgress {
    pub fn new(partition_id: i32, partition_offset: i64) -> Self {
        Self {
            partition_id,
            partition_offset,
            stable_offset: DEFAULT_STABLE_OFFSET,
            latest_offset: DEFAULT_LATEST_OFFSET,
        }
    }

    pub fn with_offsets(mut self, stable_offset: i64, latest_offset: i64) -> Self {
        self.stable_offset = stable_offset;
        self.latest_offset = latest_offset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_type_values() {
        assert_eq!(OffsetType::Live.value(), -1);
        assert_eq!(OffsetType::Historical.value(), -2);
        assert_eq!(OffsetType::from_value(-2), Some(OffsetType::Historical));
        assert_eq!(OffsetType::from_value(17), None);
    }

    #[test]
    fn test_progress_defaults() {
        let progress = PartitionProgress::new(3, 10);
        assert_eq!(progress.stable_offset, DEFAULT_STABLE_OFFSET);
        assert_eq!(progress.latest_offset, DEFAULT_LATEST_OFFSET);

        let progress = progress.with_offsets(8, 12);
        assert_eq!((progress.stable_offset, progress.latest_offset), (8, 12));
    }

    #[test]
    fn test_isolation_serde() {
        let isolation: Isolation = serde_json::from_str("\"read_committed\"").unwrap();
        assert_eq!(isolation, Isolation::ReadCommitted);
    }
}
