//! Cache segments.
//!
//! A segment owns a contiguous run of entries starting at its base offset.
//! Entries are appended in offset order, so lookups are binary searches.
//! Besides entries the segment tracks the bookkeeping compaction needs:
//! how many of its log bytes belong to dirty entries and since when.

use bytes::Bytes;

use crate::entry::{entry_flags, Entry};

pub const NO_DIRTY_SINCE: i64 = -1;

/// Handle to a segment, stable for the segment's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentRef(pub(crate) i64);

impl SegmentRef {
    pub fn base_offset(self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    base_offset: i64,
    timestamp: i64,
    sealed: bool,
    entries: Vec<Entry>,
    log_bytes: i64,
    dirty_bytes: i64,
    dirty_since: i64,
    cleanable_at: i64,
}

impl Segment {
    pub fn new(base_offset: i64, timestamp: i64) -> Self {
        Self {
            base_offset,
            timestamp,
            sealed: false,
            entries: Vec::new(),
            log_bytes: 0,
            dirty_bytes: 0,
            dirty_since: NO_DIRTY_SINCE,
            cleanable_at: i64::MAX,
        }
    }

    pub fn segment_ref(&self) -> SegmentRef {
        SegmentRef(self.base_offset)
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// Offset of the last entry, or one before the base when empty.
    pub fn last_offset(&self) -> i64 {
        self.entries
            .last()
            .map_or(self.base_offset - 1, |entry| entry.offset)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn log_bytes(&self) -> i64 {
        self.log_bytes
    }

    pub fn dirty_bytes(&self) -> i64 {
        self.dirty_bytes
    }

    pub fn dirty_since(&self) -> i64 {
        self.dirty_since
    }

    pub fn cleanable_at(&self) -> i64 {
        self.cleanable_at
    }

    pub(crate) fn set_cleanable_at(&mut self, cleanable_at: i64) {
        self.cleanable_at = cleanable_at;
    }

    pub fn cleanable_dirty_ratio(&self) -> f64 {
        if self.log_bytes == 0 {
            0.0
        } else {
            self.dirty_bytes as f64 / self.log_bytes as f64
        }
    }

    fn position(&self, offset: i64) -> Option<usize> {
        self.entries
            .binary_search_by_key(&offset, |entry| entry.offset)
            .ok()
    }

    pub fn entry(&self, offset: i64) -> Option<&Entry> {
        self.position(offset).map(|index| &self.entries[index])
    }

    pub(crate) fn entry_mut(&mut self, offset: i64) -> Option<&mut Entry> {
        self.position(offset).map(move |index| &mut self.entries[index])
    }

    /// First entry at or after `offset`.
    pub fn next_entry(&self, offset: i64) -> Option<&Entry> {
        let index = self.entries.partition_point(|entry| entry.offset < offset);
        self.entries.get(index)
    }

    pub(crate) fn push(&mut self, entry: Entry) {
        debug_assert!(entry.offset > self.last_offset() || self.entries.is_empty());
        self.log_bytes += entry.reserved;
        self.entries.push(entry);
    }

    /// Drop the last entry if it is `offset` and was never completed.
    pub(crate) fn remove_unfinished(&mut self, offset: i64) -> bool {
        match self.entries.last() {
            Some(entry) if entry.offset == offset && !entry.is_completed() => {}
            _ => return false,
        }
        if let Some(entry) = self.entries.pop() {
            self.log_bytes -= entry.reserved;
            if entry.is_dirty() {
                self.dirty_bytes -= entry.reserved;
            }
        }
        true
    }

    /// Log space still available before `limit` is reached.
    pub fn available(&self, limit: i64) -> i64 {
        limit - self.log_bytes
    }

    /// Flag the entry dirty, accounting its bytes once.
    pub(crate) fn mark_dirty(&mut self, offset: i64, now: i64) -> bool {
        let Some(index) = self.position(offset) else {
            return false;
        };
        let entry = &mut self.entries[index];
        if entry.is_dirty() {
            return true;
        }
        entry.flags |= entry_flags::DIRTY;
        self.dirty_bytes += entry.reserved;
        if self.dirty_since == NO_DIRTY_SINCE {
            self.dirty_since = now;
        }
        true
    }

    /// Most recent live entry before `before_offset` with the given key.
    ///
    /// Entries whose hash collides but whose key bytes differ are passed over.
    pub(crate) fn find_key(&self, key: &Bytes, hash: u32, before_offset: i64) -> Option<i64> {
        let end = self.entries.partition_point(|entry| entry.offset < before_offset);
        self.entries[..end]
            .iter()
            .rev()
            .filter(|entry| !entry.has_flags(entry_flags::ABORTED | entry_flags::CONTROL))
            .find(|entry| entry.key_hash == hash && entry.key.as_ref() == Some(key))
            .map(|entry| entry.offset)
    }

    /// Mark non-control entries owned by `producer_id` aborted.
    pub(crate) fn abort_owner(&mut self, producer_id: i64, from_offset: i64) -> usize {
        let mut aborted = 0;
        for entry in self.entries.iter_mut().filter(|e| e.offset >= from_offset) {
            if entry.owner_id == producer_id && !entry.is_control() {
                entry.flags |= entry_flags::ABORTED;
                aborted += 1;
            }
        }
        aborted
    }

    /// Drop dirty entries and reset the compaction bookkeeping.
    pub(crate) fn compact(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.is_dirty());
        self.log_bytes = self.entries.iter().map(|entry| entry.reserved).sum();
        self.dirty_bytes = 0;
        self.dirty_since = NO_DIRTY_SINCE;
        self.cleanable_at = i64::MAX;
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_core::offset::{AckMode, DeltaType};

    fn entry(offset: i64, reserved: i64, flags: u32) -> Entry {
        Entry {
            offset,
            timestamp: 0,
            owner_id: 0,
            acknowledge: -1,
            sequence: 0,
            ack_mode: AckMode::None,
            ancestor: -1,
            descendant: -1,
            flags,
            key: None,
            key_hash: 0,
            headers: Vec::new(),
            trailers: Vec::new(),
            value_len: 0,
            value: None,
            delta_type: DeltaType::None,
            reserved,
        }
    }

    fn segment(offsets: &[i64]) -> Segment {
        let mut segment = Segment::new(10, 1_000);
        for &offset in offsets {
            segment.push(entry(offset, 100, entry_flags::COMPLETED));
        }
        segment
    }

    #[test]
    fn test_next_entry_finds_first_at_or_after() {
        let segment = segment(&[10, 12, 15]);

        assert_eq!(segment.next_entry(0).map(|e| e.offset), Some(10));
        assert_eq!(segment.next_entry(11).map(|e| e.offset), Some(12));
        assert_eq!(segment.next_entry(15).map(|e| e.offset), Some(15));
        assert!(segment.next_entry(16).is_none());
        assert!(segment.entry(13).is_none());
        assert_eq!(segment.last_offset(), 15);
    }

    #[test]
    fn test_empty_segment_bounds() {
        let segment = Segment::new(10, 1_000);
        assert!(segment.is_empty());
        assert_eq!(segment.last_offset(), 9);
        assert!(segment.next_entry(10).is_none());
        assert_eq!(segment.available(1024), 1024);
    }

    #[test]
    fn test_dirty_bytes_counted_once() {
        let mut segment = segment(&[10, 11]);
        assert_eq!(segment.log_bytes(), 200);

        assert!(segment.mark_dirty(10, 5_000));
        assert!(segment.mark_dirty(10, 6_000));
        assert!(!segment.mark_dirty(12, 6_000));

        assert_eq!(segment.dirty_bytes(), 100);
        assert_eq!(segment.dirty_since(), 5_000);
        assert_eq!(segment.cleanable_dirty_ratio(), 0.5);
        assert_eq!(segment.available(1024), 824);
    }

    #[test]
    fn test_remove_unfinished_only_drops_open_tail() {
        let mut segment = segment(&[10]);
        segment.push(entry(11, 50, 0));

        assert!(!segment.remove_unfinished(10));
        assert!(segment.remove_unfinished(11));
        assert!(!segment.remove_unfinished(11));
        assert_eq!(segment.last_offset(), 10);
        assert_eq!(segment.log_bytes(), 100);
    }

    #[test]
    fn test_compact_drops_dirty_entries() {
        let mut segment = segment(&[10, 11, 12]);
        segment.mark_dirty(11, 5_000);
        segment.set_cleanable_at(5_000);

        assert_eq!(segment.compact(), 1);
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.log_bytes(), 200);
        assert_eq!(segment.dirty_since(), NO_DIRTY_SINCE);
        assert_eq!(segment.cleanable_at(), i64::MAX);
        assert_eq!(segment.next_entry(11).map(|e| e.offset), Some(12));
    }
}
