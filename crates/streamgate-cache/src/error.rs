//! Cache error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Record too large: {size} bytes exceeds segment limit {limit}")]
    RecordTooLarge { size: i64, limit: i64 },

    #[error("Invalid record at offset {offset}: {reason}")]
    InvalidRecord { offset: i64, reason: String },

    #[error("Offset {offset} does not advance beyond {progress}")]
    OffsetRegression { offset: i64, progress: i64 },

    #[error("Unknown segment: {0}")]
    UnknownSegment(i64),

    #[error("Entry not found: {0}")]
    EntryNotFound(i64),
}

pub type Result<T> = std::result::Result<T, CacheError>;
