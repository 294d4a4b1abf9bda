use streamgate_core::{Frame, StreamIds};
use tokio::sync::mpsc::UnboundedSender;

use crate::budget::BudgetPool;
use crate::outbox::Outbox;
use crate::signaler::Signaler;

/// Shard resources lent to a fan-out or member while it handles a frame.
pub struct StreamContext<'a> {
    pub signaler: &'a dyn Signaler,
    pub budgets: &'a BudgetPool,
    pub ids: &'a StreamIds,
    /// Inbox of the owning shard, for wake-ups raised outside a handler
    pub wakeups: &'a UnboundedSender<Frame>,
    pub out: &'a mut Outbox,
}

impl StreamContext<'_> {
    pub fn now_millis(&self) -> i64 {
        self.signaler.now_millis()
    }
}
