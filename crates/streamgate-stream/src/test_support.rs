use streamgate_core::{Frame, StreamIds};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::budget::BudgetPool;
use crate::context::StreamContext;
use crate::outbox::Outbox;
use crate::signaler::ManualSignaler;

/// Owns everything a [`StreamContext`] borrows, for unit tests.
pub(crate) struct TestHarness {
    pub signaler: ManualSignaler,
    pub budgets: BudgetPool,
    pub ids: StreamIds,
    pub wakeups: UnboundedSender<Frame>,
    pub wakeups_rx: UnboundedReceiver<Frame>,
    pub out: Outbox,
}

impl TestHarness {
    pub fn new() -> Self {
        streamgate_observability::logging::init("warn");
        let (wakeups, wakeups_rx) = unbounded_channel();
        Self {
            signaler: ManualSignaler::new(wakeups.clone(), 1_000_000),
            budgets: BudgetPool::new(16),
            ids: StreamIds::new(1001),
            wakeups,
            wakeups_rx,
            out: Outbox::new(),
        }
    }

    pub fn context(&mut self) -> StreamContext<'_> {
        StreamContext {
            signaler: &self.signaler,
            budgets: &self.budgets,
            ids: &self.ids,
            wakeups: &self.wakeups,
            out: &mut self.out,
        }
    }
}
