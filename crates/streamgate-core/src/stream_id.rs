use std::sync::atomic::{AtomicU64, Ordering};

/// Reply stream id paired with an initial stream id.
pub fn reply_id(initial_id: u64) -> u64 {
    initial_id ^ 1
}

pub fn is_initial(stream_id: u64) -> bool {
    stream_id & 1 == 1
}

/// Allocator for initial stream ids opened towards the upstream.
#[derive(Debug)]
pub struct StreamIds {
    next: AtomicU64,
}

impl StreamIds {
    /// Ids are allocated from `base` upwards; `base` is rounded to the next odd id.
    pub fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base | 1),
        }
    }

    pub fn supply_initial_id(&self) -> u64 {
        self.next.fetch_add(2, Ordering::Relaxed)
    }
}

impl Default for StreamIds {
    fn default() -> Self {
        Self::new(1 << 32)
    }
}
