//! Cached partitions.
//!
//! [`Partition`] is the interface the fan-outs drive: seek by offset, roll
//! the head segment, write entries, mark ancestry and compute the deadlines
//! for retention, deletion and compaction. [`MemoryPartition`] keeps its
//! segments in memory and backs every fan-out in this workspace.
//!
//! ## Offset lookups
//!
//! Segments are keyed by base offset, so the two seeks are range queries:
//!
//! ```text
//!   bases:          0        120        245
//!   seek_not_after(130)  ──▶ 120   (last base <= offset)
//!   seek_not_before(130) ──▶ 245   (first base >= offset)
//! ```

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use streamgate_core::offset::{AckMode, DeltaType, OffsetType};
use streamgate_core::record::Header;
use tracing::debug;

use crate::config::{CacheConfig, CleanupPolicy};
use crate::entry::{
    entry_flags, entry_size, headers_footprint, Entry, NO_ACKNOWLEDGE, NO_ANCESTOR_OFFSET,
    NO_DESCENDANT_OFFSET,
};
use crate::error::{CacheError, Result};
use crate::segment::{Segment, SegmentRef, NO_DIRTY_SINCE};

/// Outcome of looking up a key's previous entry in one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncestorLookup {
    Found(i64),
    NotFound,
}

/// Entry written from an upstream fetch.
#[derive(Debug, Clone)]
pub struct EntryStart {
    pub offset: i64,
    pub timestamp: i64,
    pub producer_id: i64,
    pub key: Option<Bytes>,
    pub key_hash: u32,
    pub value_len: i32,
    pub headers: Vec<Header>,
    pub ancestor: i64,
    pub flags: u32,
    pub delta_type: DeltaType,
}

/// Entry written by a producing member.
#[derive(Debug, Clone)]
pub struct ProduceEntryStart {
    pub offset: i64,
    pub timestamp: i64,
    pub owner_id: i64,
    pub sequence: i32,
    pub ack_mode: AckMode,
    pub key: Option<Bytes>,
    pub key_hash: u32,
    pub value_len: i32,
    pub headers: Vec<Header>,
    pub trailers_size_max: i32,
    pub payload: Option<Bytes>,
}

pub trait Partition: Send {
    fn topic(&self) -> &str;

    fn id(&self) -> i32;

    fn config(&self) -> &CacheConfig;

    fn cleanup_policy(&self) -> CleanupPolicy {
        self.config().cleanup_policy
    }

    fn head(&self) -> Option<SegmentRef>;

    fn first_segment(&self) -> Option<SegmentRef>;

    fn next_segment(&self, segment: SegmentRef) -> Option<SegmentRef>;

    fn previous_segment(&self, segment: SegmentRef) -> Option<SegmentRef>;

    fn segment(&self, segment: SegmentRef) -> Option<&Segment>;

    /// First segment whose base offset is at or after `offset`.
    fn seek_not_before(&self, offset: i64) -> Option<SegmentRef>;

    /// Last segment whose base offset is at or before `offset`.
    fn seek_not_after(&self, offset: i64) -> Option<SegmentRef>;

    /// Offset the next appended entry will carry; `default` when the partition is empty.
    fn next_offset(&self, default: OffsetType) -> i64;

    /// Seal the head and start a new one at `offset`.
    fn append(&mut self, offset: i64, now: i64) -> SegmentRef;

    /// Head segment with room for an entry of this shape, rolling if needed.
    ///
    /// Returns `None` when the entry cannot fit even an empty segment.
    fn new_head_if_necessary(
        &mut self,
        offset: i64,
        key: Option<&Bytes>,
        value_len: i32,
        headers_size_max: i32,
        now: i64,
    ) -> Option<SegmentRef>;

    fn entry(&self, offset: i64) -> Option<&Entry>;

    /// First entry at or after `offset`, across segments.
    fn next_entry(&self, offset: i64) -> Option<&Entry>;

    fn write_entry_start(&mut self, segment: SegmentRef, start: EntryStart) -> Result<()>;

    fn write_entry_continue(&mut self, segment: SegmentRef, offset: i64, payload: &[u8]) -> Result<()>;

    fn write_entry_finish(&mut self, segment: SegmentRef, offset: i64) -> Result<()>;

    /// Discard an entry whose writing stopped before it was finished, so its
    /// offset can be written again.
    fn abandon_entry(&mut self, segment: SegmentRef, offset: i64) -> bool;

    fn write_produce_entry_start(&mut self, segment: SegmentRef, start: ProduceEntryStart) -> Result<()>;

    fn write_produce_entry_continue(
        &mut self,
        segment: SegmentRef,
        offset: i64,
        payload: &[u8],
    ) -> Result<()>;

    fn write_produce_entry_fin(
        &mut self,
        segment: SegmentRef,
        offset: i64,
        acknowledge: i64,
        trailers: Vec<Header>,
    ) -> Result<()>;

    /// Link the previous entry with `key` in `segment` to its descendant and mark it dirty.
    fn find_and_mark_ancestor(
        &mut self,
        segment: SegmentRef,
        key: Option<&Bytes>,
        hash: u32,
        descendant_offset: i64,
        now: i64,
    ) -> AncestorLookup;

    /// Mark entries of an aborted transaction from `from_offset` on; returns how many.
    fn find_and_abort_producer_id(&mut self, segment: SegmentRef, producer_id: i64, from_offset: i64) -> usize;

    fn find_and_mark_dirty(&mut self, segment: SegmentRef, offset: i64, now: i64) -> Option<&Entry>;

    fn retain_at(&self, segment: SegmentRef) -> i64;

    fn delete_at(&self, segment: SegmentRef, retention_max: i64) -> i64;

    fn compact_at(&mut self, segment: SegmentRef, now: i64) -> i64;

    /// Compact a sealed segment once it is cleanable; returns true if it was removed.
    fn clean(&mut self, segment: SegmentRef, now: i64) -> bool;

    fn remove_segment(&mut self, segment: SegmentRef) -> Option<Segment>;
}

/// In-memory partition cache.
pub struct MemoryPartition {
    topic: String,
    id: i32,
    config: CacheConfig,
    segments: BTreeMap<i64, Segment>,
    progress: i64,
}

impl MemoryPartition {
    pub fn new(topic: impl Into<String>, id: i32, config: CacheConfig) -> Self {
        Self {
            topic: topic.into(),
            id,
            config,
            segments: BTreeMap::new(),
            progress: -1,
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn segment_mut(&mut self, segment: SegmentRef) -> Result<&mut Segment> {
        self.segments
            .get_mut(&segment.0)
            .ok_or(CacheError::UnknownSegment(segment.0))
    }

    fn entry_mut(&mut self, segment: SegmentRef, offset: i64) -> Result<&mut Entry> {
        self.segment_mut(segment)?
            .entry_mut(offset)
            .ok_or(CacheError::EntryNotFound(offset))
    }

    fn advance_progress(&mut self, offset: i64) -> Result<()> {
        if offset <= self.progress {
            return Err(CacheError::OffsetRegression {
                offset,
                progress: self.progress,
            });
        }
        self.progress = offset;
        Ok(())
    }

    fn is_head(&self, segment: SegmentRef) -> bool {
        self.segments.keys().next_back() == Some(&segment.0)
    }
}

impl Partition for MemoryPartition {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn id(&self) -> i32 {
        self.id
    }

    fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn head(&self) -> Option<SegmentRef> {
        self.segments.values().next_back().map(Segment::segment_ref)
    }

    fn first_segment(&self) -> Option<SegmentRef> {
        self.segments.values().next().map(Segment::segment_ref)
    }

    fn next_segment(&self, segment: SegmentRef) -> Option<SegmentRef> {
        self.segments
            .range(segment.0 + 1..)
            .next()
            .map(|(_, s)| s.segment_ref())
    }

    fn previous_segment(&self, segment: SegmentRef) -> Option<SegmentRef> {
        self.segments
            .range(..segment.0)
            .next_back()
            .map(|(_, s)| s.segment_ref())
    }

    fn segment(&self, segment: SegmentRef) -> Option<&Segment> {
        self.segments.get(&segment.0)
    }

    fn seek_not_before(&self, offset: i64) -> Option<SegmentRef> {
        self.segments
            .range(offset..)
            .next()
            .map(|(_, s)| s.segment_ref())
    }

    fn seek_not_after(&self, offset: i64) -> Option<SegmentRef> {
        self.segments
            .range(..=offset)
            .next_back()
            .map(|(_, s)| s.segment_ref())
    }

    fn next_offset(&self, default: OffsetType) -> i64 {
        match self.segments.values().next_back() {
            Some(head) => head.last_offset() + 1,
            None => default.value(),
        }
    }

    fn append(&mut self, offset: i64, now: i64) -> SegmentRef {
        let mut base_offset = offset;

        let head = self
            .segments
            .values()
            .next_back()
            .map(|head| (head.base_offset(), head.is_empty(), head.last_offset()));
        if let Some((head_base, empty, last_offset)) = head {
            if empty {
                base_offset = base_offset.max(head_base);
                self.segments.remove(&head_base);
            } else {
                base_offset = base_offset.max(last_offset + 1);
                if let Some(head) = self.segments.get_mut(&head_base) {
                    head.seal();
                }
            }
        }

        debug!(
            topic = %self.topic,
            partition = self.id,
            base_offset,
            "Appended cache segment"
        );

        let segment = Segment::new(base_offset, now);
        let segment_ref = segment.segment_ref();
        self.segments.insert(base_offset, segment);
        segment_ref
    }

    fn new_head_if_necessary(
        &mut self,
        offset: i64,
        key: Option<&Bytes>,
        value_len: i32,
        headers_size_max: i32,
        now: i64,
    ) -> Option<SegmentRef> {
        let required = entry_size(key, value_len, headers_size_max);
        let limit = self.config.segment_bytes;
        if required > limit {
            return None;
        }

        let roll = self
            .segments
            .values()
            .next_back()
            .map_or(true, |head| head.available(limit) < required);
        if roll {
            Some(self.append(offset, now))
        } else {
            self.head()
        }
    }

    fn entry(&self, offset: i64) -> Option<&Entry> {
        let (_, segment) = self.segments.range(..=offset).next_back()?;
        segment.entry(offset)
    }

    fn next_entry(&self, offset: i64) -> Option<&Entry> {
        let start = self
            .segments
            .range(..=offset)
            .next_back()
            .map_or(offset, |(&base, _)| base);

        self.segments
            .range(start..)
            .find_map(|(_, segment)| segment.next_entry(offset))
    }

    fn write_entry_start(&mut self, segment: SegmentRef, start: EntryStart) -> Result<()> {
        self.advance_progress(start.offset)?;

        let value = (start.value_len >= 0).then(|| BytesMut::with_capacity(start.value_len as usize));
        let reserved = entry_size(start.key.as_ref(), start.value_len, headers_footprint(&start.headers));
        let entry = Entry {
            offset: start.offset,
            timestamp: start.timestamp,
            owner_id: start.producer_id,
            acknowledge: NO_ACKNOWLEDGE,
            sequence: 0,
            ack_mode: AckMode::None,
            ancestor: start.ancestor,
            descendant: NO_DESCENDANT_OFFSET,
            flags: start.flags,
            key: start.key,
            key_hash: start.key_hash,
            headers: start.headers,
            trailers: Vec::new(),
            value_len: start.value_len,
            value,
            delta_type: start.delta_type,
            reserved,
        };

        self.segment_mut(segment)?.push(entry);
        Ok(())
    }

    fn write_entry_continue(&mut self, segment: SegmentRef, offset: i64, payload: &[u8]) -> Result<()> {
        let entry = self.entry_mut(segment, offset)?;

        match entry.value.as_mut() {
            Some(value) => value.extend_from_slice(payload),
            None if payload.is_empty() => {}
            None => {
                return Err(CacheError::InvalidRecord {
                    offset,
                    reason: "payload for null value".to_string(),
                })
            }
        }
        Ok(())
    }

    fn write_entry_finish(&mut self, segment: SegmentRef, offset: i64) -> Result<()> {
        let entry = self.entry_mut(segment, offset)?;
        entry.flags |= entry_flags::COMPLETED;
        Ok(())
    }

    fn abandon_entry(&mut self, segment: SegmentRef, offset: i64) -> bool {
        let Some(target) = self.segments.get_mut(&segment.0) else {
            return false;
        };
        if !target.remove_unfinished(offset) {
            return false;
        }
        self.progress = self.progress.min(target.last_offset());
        debug!(
            topic = %self.topic,
            partition = self.id,
            offset,
            "Abandoned unfinished cache entry"
        );
        true
    }

    fn write_produce_entry_start(&mut self, segment: SegmentRef, start: ProduceEntryStart) -> Result<()> {
        let payload_len = start.payload.as_ref().map_or(0, Bytes::len);
        if start.value_len < 0 && payload_len > 0 {
            return Err(CacheError::InvalidRecord {
                offset: start.offset,
                reason: "payload for null value".to_string(),
            });
        }
        if start.value_len >= 0 && payload_len > start.value_len as usize {
            return Err(CacheError::InvalidRecord {
                offset: start.offset,
                reason: format!(
                    "fragment of {} bytes exceeds value length {}",
                    payload_len, start.value_len
                ),
            });
        }

        self.advance_progress(start.offset)?;

        let value = (start.value_len >= 0).then(|| {
            let mut value = BytesMut::with_capacity(start.value_len as usize);
            if let Some(payload) = start.payload.as_ref() {
                value.extend_from_slice(payload);
            }
            value
        });
        let reserved = entry_size(
            start.key.as_ref(),
            start.value_len,
            headers_footprint(&start.headers) + start.trailers_size_max,
        );
        let entry = Entry {
            offset: start.offset,
            timestamp: start.timestamp,
            owner_id: start.owner_id,
            acknowledge: NO_ACKNOWLEDGE,
            sequence: start.sequence,
            ack_mode: start.ack_mode,
            ancestor: NO_ANCESTOR_OFFSET,
            descendant: NO_DESCENDANT_OFFSET,
            flags: 0,
            key: start.key,
            key_hash: start.key_hash,
            headers: start.headers,
            trailers: Vec::new(),
            value_len: start.value_len,
            value,
            delta_type: DeltaType::None,
            reserved,
        };

        self.segment_mut(segment)?.push(entry);
        Ok(())
    }

    fn write_produce_entry_continue(
        &mut self,
        segment: SegmentRef,
        offset: i64,
        payload: &[u8],
    ) -> Result<()> {
        let entry = self.entry_mut(segment, offset)?;

        let remaining = (entry.value_len.max(0) as usize).saturating_sub(entry.value_written());
        if payload.len() > remaining {
            return Err(CacheError::InvalidRecord {
                offset,
                reason: format!(
                    "fragment of {} bytes exceeds remaining {}",
                    payload.len(),
                    remaining
                ),
            });
        }
        if let Some(value) = entry.value.as_mut() {
            value.extend_from_slice(payload);
        }
        Ok(())
    }

    fn write_produce_entry_fin(
        &mut self,
        segment: SegmentRef,
        offset: i64,
        acknowledge: i64,
        trailers: Vec<Header>,
    ) -> Result<()> {
        let trailers_size_max = self.config.trailers_size_max;
        let entry = self.entry_mut(segment, offset)?;

        if headers_footprint(&trailers) > trailers_size_max {
            return Err(CacheError::InvalidRecord {
                offset,
                reason: "trailers exceed reserved space".to_string(),
            });
        }
        entry.trailers = trailers;
        entry.acknowledge = acknowledge;
        entry.flags |= entry_flags::COMPLETED;
        Ok(())
    }

    fn find_and_mark_ancestor(
        &mut self,
        segment: SegmentRef,
        key: Option<&Bytes>,
        hash: u32,
        descendant_offset: i64,
        now: i64,
    ) -> AncestorLookup {
        let Some(key) = key else {
            return AncestorLookup::NotFound;
        };
        let Some(target) = self.segments.get_mut(&segment.0) else {
            return AncestorLookup::NotFound;
        };
        let Some(ancestor) = target.find_key(key, hash, descendant_offset) else {
            return AncestorLookup::NotFound;
        };

        if let Some(entry) = target.entry_mut(ancestor) {
            entry.descendant = descendant_offset;
        }
        target.mark_dirty(ancestor, now);
        AncestorLookup::Found(ancestor)
    }

    fn find_and_abort_producer_id(&mut self, segment: SegmentRef, producer_id: i64, from_offset: i64) -> usize {
        self.segments
            .get_mut(&segment.0)
            .map_or(0, |target| target.abort_owner(producer_id, from_offset))
    }

    fn find_and_mark_dirty(&mut self, segment: SegmentRef, offset: i64, now: i64) -> Option<&Entry> {
        let target = self.segments.get_mut(&segment.0)?;
        if target.mark_dirty(offset, now) {
            target.entry(offset)
        } else {
            None
        }
    }

    fn retain_at(&self, segment: SegmentRef) -> i64 {
        self.segments.get(&segment.0).map_or(i64::MAX, |target| {
            target.timestamp().saturating_add(self.config.segment_ms)
        })
    }

    fn delete_at(&self, segment: SegmentRef, retention_max: i64) -> i64 {
        self.segments.get(&segment.0).map_or(i64::MAX, |target| {
            target
                .timestamp()
                .saturating_add(self.config.retention_ms.min(retention_max))
        })
    }

    fn compact_at(&mut self, segment: SegmentRef, now: i64) -> i64 {
        let min_ratio = self.config.min_cleanable_dirty_ratio;
        let min_lag = self.config.min_compaction_lag_ms;
        let max_lag = self.config.max_compaction_lag_ms;

        let Some(target) = self.segments.get_mut(&segment.0) else {
            return i64::MAX;
        };

        let dirty_since = target.dirty_since();
        let mut cleanable_at = target.cleanable_at();
        if cleanable_at == i64::MAX && dirty_since != NO_DIRTY_SINCE {
            let ratio = target.cleanable_dirty_ratio();
            if ratio >= min_ratio {
                cleanable_at = dirty_since.saturating_add(min_lag).min(now);
            } else if ratio != 0.0 && max_lag != i64::MAX {
                cleanable_at = dirty_since.saturating_add(max_lag).min(now);
            }

            if cleanable_at != i64::MAX {
                target.set_cleanable_at(cleanable_at);
            }
        }

        cleanable_at
    }

    fn clean(&mut self, segment: SegmentRef, now: i64) -> bool {
        if self.is_head(segment) {
            return false;
        }
        let Some(target) = self.segments.get_mut(&segment.0) else {
            return false;
        };
        if target.cleanable_at() > now {
            return false;
        }

        let removed = target.compact();
        let empty = target.is_empty();
        debug!(
            topic = %self.topic,
            partition = self.id,
            base_offset = segment.0,
            removed,
            "Compacted cache segment"
        );

        if empty {
            self.segments.remove(&segment.0);
        }
        empty
    }

    fn remove_segment(&mut self, segment: SegmentRef) -> Option<Segment> {
        self.segments.remove(&segment.0)
    }
}
