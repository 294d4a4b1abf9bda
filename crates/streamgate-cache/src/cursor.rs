use streamgate_core::offset::DeltaType;

use crate::condition::FilterCondition;
use crate::entry::{entry_flags, Entry};
use crate::partition::Partition;
use crate::segment::SegmentRef;

/// Forward-only scan position over a partition.
///
/// `offset` is the next offset the owner wants to read. `next` peeks at the
/// first matching entry at or after it; entries that fail the condition are
/// stepped over. The position only moves on `advance`, once the owner has
/// consumed the entry. An entry still being written blocks the cursor until
/// it is completed or marked dirty.
#[derive(Debug, Clone)]
pub struct Cursor {
    condition: FilterCondition,
    delta_type: DeltaType,
    segment: Option<SegmentRef>,
    offset: i64,
    latest: i64,
    filters: u64,
    open: bool,
}

impl Cursor {
    pub fn new(condition: FilterCondition, delta_type: DeltaType) -> Self {
        Self {
            condition,
            delta_type,
            segment: None,
            offset: 0,
            latest: 0,
            filters: 0,
            open: false,
        }
    }

    /// Reposition at `offset` within `segment`.
    pub fn init(&mut self, segment: Option<SegmentRef>, offset: i64, latest: i64) {
        self.segment = segment;
        self.offset = offset;
        self.latest = latest;
        self.filters = 0;
        self.open = true;
    }

    pub fn next<'a, P>(&mut self, partition: &'a P) -> Option<&'a Entry>
    where
        P: Partition + ?Sized,
    {
        loop {
            let entry = partition.next_entry(self.offset)?;
            if !entry.has_flags(entry_flags::ADVANCE) {
                return None;
            }
            let filters = self.condition.test(entry);
            if filters != 0 {
                self.filters = filters;
                self.segment = partition.seek_not_after(entry.offset);
                return Some(entry);
            }
            self.offset = self.offset.max(entry.offset + 1);
        }
    }

    /// True when the entry at the cursor is still being written.
    pub fn is_blocked<P>(&self, partition: &P) -> bool
    where
        P: Partition + ?Sized,
    {
        partition
            .next_entry(self.offset)
            .map_or(false, |entry| !entry.has_flags(entry_flags::ADVANCE))
    }

    pub fn advance(&mut self, offset: i64) {
        debug_assert!(offset >= self.offset, "cursor moved backwards: {} < {}", offset, self.offset);
        self.offset = self.offset.max(offset);
    }

    pub fn close(&mut self) {
        self.segment = None;
        self.open = false;
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn latest(&self) -> i64 {
        self.latest
    }

    /// Filter bits matched by the entry last returned from `next`.
    pub fn filters(&self) -> u64 {
        self.filters
    }

    pub fn segment(&self) -> Option<SegmentRef> {
        self.segment
    }

    pub fn delta_type(&self) -> DeltaType {
        self.delta_type
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}
