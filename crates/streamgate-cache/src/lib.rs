//! StreamGate Cache
//!
//! The local cache a fan-out writes upstream records into and its members
//! read from. A partition is an ordered list of segments; each segment holds
//! entries in offset order:
//!
//! ```text
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!  │ segment @0   │──▶│ segment @120 │──▶│ segment @245 │ ◀── head
//!  │ sealed       │   │ sealed       │   │ appending    │
//!  └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! Sealed segments become eligible for retention deletion and, when they
//! contain superseded (dirty) entries, for compaction. The fan-out schedules
//! both from the deadlines the partition computes.
//!
//! A [`Cursor`] walks the partition forward, skipping entries that fail its
//! [`FilterCondition`].

pub mod condition;
pub mod config;
pub mod cursor;
pub mod entry;
pub mod error;
pub mod partition;
pub mod segment;

pub use condition::{compute_hash, FilterCondition};
pub use config::{CacheConfig, CleanupPolicy};
pub use cursor::Cursor;
pub use entry::{entry_flags, Entry};
pub use error::{CacheError, Result};
pub use partition::{AncestorLookup, EntryStart, MemoryPartition, Partition, ProduceEntryStart};
pub use segment::{Segment, SegmentRef};
