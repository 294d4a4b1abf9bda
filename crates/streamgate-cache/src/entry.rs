use bytes::{Bytes, BytesMut};
use streamgate_core::offset::{AckMode, DeltaType};
use streamgate_core::record::{headers_size, Header};

pub mod entry_flags {
    /// Superseded or abandoned; removed by compaction
    pub const DIRTY: u32 = 0x01;
    pub const COMPLETED: u32 = 0x02;
    /// Part of an aborted transaction
    pub const ABORTED: u32 = 0x04;
    /// Transaction marker, carries no value
    pub const CONTROL: u32 = 0x08;
    /// Either flag lets the produce high-watermark move past the entry
    pub const ADVANCE: u32 = COMPLETED | DIRTY;
}

pub const NO_ANCESTOR_OFFSET: i64 = -1;
pub const NO_DESCENDANT_OFFSET: i64 = -1;
pub const NO_ACKNOWLEDGE: i64 = -1;

/// Fixed bookkeeping cost of an entry in a segment log.
pub const ENTRY_OVERHEAD: i64 = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub offset: i64,
    pub timestamp: i64,
    /// Producer id for fetched records, member stream id for produced ones
    pub owner_id: i64,
    pub acknowledge: i64,
    pub sequence: i32,
    pub ack_mode: AckMode,
    pub ancestor: i64,
    pub descendant: i64,
    pub flags: u32,
    pub key: Option<Bytes>,
    pub key_hash: u32,
    pub headers: Vec<Header>,
    pub trailers: Vec<Header>,
    /// Declared value length, -1 for a null value
    pub value_len: i32,
    pub value: Option<BytesMut>,
    pub delta_type: DeltaType,
    /// Log space reserved for the entry
    pub reserved: i64,
}

impl Entry {
    pub fn has_flags(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }

    pub fn is_aborted(&self) -> bool {
        self.has_flags(entry_flags::ABORTED)
    }

    pub fn is_control(&self) -> bool {
        self.has_flags(entry_flags::CONTROL)
    }

    pub fn is_dirty(&self) -> bool {
        self.has_flags(entry_flags::DIRTY)
    }

    pub fn is_completed(&self) -> bool {
        self.has_flags(entry_flags::COMPLETED)
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Value bytes written so far.
    pub fn value_written(&self) -> usize {
        self.value.as_ref().map_or(0, BytesMut::len)
    }

    pub fn key_len(&self) -> usize {
        self.key.as_ref().map_or(0, Bytes::len)
    }
}

/// Log space needed for an entry with the given shape.
pub fn entry_size(key: Option<&Bytes>, value_len: i32, headers_size_max: i32) -> i64 {
    ENTRY_OVERHEAD
        + key.map_or(0, |k| k.len() as i64)
        + i64::from(value_len.max(0))
        + i64::from(headers_size_max.max(0))
}

pub(crate) fn headers_footprint(headers: &[Header]) -> i32 {
    headers_size(headers) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_size_ignores_null_value() {
        let key = Bytes::from_static(b"key");
        assert_eq!(entry_size(Some(&key), -1, 0), ENTRY_OVERHEAD + 3);
        assert_eq!(entry_size(None, 100, 20), ENTRY_OVERHEAD + 120);
    }

    #[test]
    fn test_advance_mask() {
        assert_ne!(entry_flags::ADVANCE & entry_flags::DIRTY, 0);
        assert_ne!(entry_flags::ADVANCE & entry_flags::COMPLETED, 0);
        assert_eq!(entry_flags::ADVANCE & entry_flags::ABORTED, 0);
    }
}
