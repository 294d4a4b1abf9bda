//! Shared Flow-Control Budget
//!
//! A budget is a pool of window credit identified by a `budget_id` and shared
//! by every stream that draws from one upstream window. The stream granting
//! the window is the *creditor*; streams spending it are *debitors*.
//!
//! ## Slots
//!
//! Budgets live in a fixed number of slots. Acquiring a budget binds its id
//! to a free slot; the slot is returned once its last creditor and debitor
//! are released. Running out of slots is a resource-exhaustion failure for
//! the stream asking.
//!
//! ## Claims
//!
//! ```text
//!   remaining = 100,  claim(min = 40, max = 150)
//!
//!   fetch_sub(150)      remaining = -50, previous = 100
//!   previous >= min     grant 100, give back the 50 overdrawn
//! ```
//!
//! A claim never grants a negative amount. When it grants less than `max`
//! the debitor is *watching*: its flusher runs on the next credit so it can
//! claim again. Counters are atomics so claims from several shards can race
//! on the same budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use streamgate_observability::metrics::BUDGET_CLAIMS_SHORT_TOTAL;
use tracing::debug;

/// Callback run when a watching debitor may claim again; receives the watcher id.
pub type Flusher = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CreditorIndex(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebitorIndex(usize);

struct Watcher {
    flusher: Flusher,
    watching: bool,
}

#[derive(Default)]
struct BudgetSlot {
    remaining: AtomicI64,
    creditors: AtomicUsize,
    debitors: AtomicUsize,
    watchers: Mutex<HashMap<u64, Watcher>>,
}

pub struct BudgetPool {
    slots: Vec<BudgetSlot>,
    /// budget id to slot; only taken on acquire and release
    index: Mutex<HashMap<u64, usize>>,
}

impl BudgetPool {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| BudgetSlot::default()).collect(),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `budget_id` to a slot for a creditor.
    ///
    /// Returns `None` when every slot is in use.
    pub fn acquire_creditor(&self, budget_id: u64) -> Option<CreditorIndex> {
        let mut index = self.index.lock();
        let slot = match index.get(&budget_id) {
            Some(&slot) => slot,
            None => {
                let in_use: Vec<usize> = index.values().copied().collect();
                let slot = (0..self.slots.len()).find(|slot| !in_use.contains(slot))?;
                self.slots[slot].remaining.store(0, Ordering::Release);
                index.insert(budget_id, slot);
                slot
            }
        };
        self.slots[slot].creditors.fetch_add(1, Ordering::AcqRel);
        debug!(budget_id, slot, "Acquired budget creditor");
        Some(CreditorIndex(slot))
    }

    /// Add credit and wake watching debitors. Returns the previous balance.
    pub fn credit(&self, creditor: CreditorIndex, credit: i64) -> i64 {
        let slot = &self.slots[creditor.0];
        let previous = slot.remaining.fetch_add(credit, Ordering::AcqRel);
        if credit > 0 {
            Self::flush(slot);
        }
        previous
    }

    /// Take back the creditor's `unused` credit and drop its hold on the slot.
    pub fn release_creditor(&self, creditor: CreditorIndex, unused: i64) {
        let slot = &self.slots[creditor.0];
        slot.remaining.fetch_sub(unused, Ordering::AcqRel);
        slot.creditors.fetch_sub(1, Ordering::AcqRel);
        self.free_if_unused(creditor.0);
    }

    /// Register a debitor on an existing budget.
    ///
    /// Returns `None` when no creditor has acquired `budget_id`.
    pub fn acquire_debitor(&self, budget_id: u64, watcher_id: u64, flusher: Flusher) -> Option<DebitorIndex> {
        let index = self.index.lock();
        let slot = *index.get(&budget_id)?;
        let target = &self.slots[slot];
        target.debitors.fetch_add(1, Ordering::AcqRel);
        target.watchers.lock().insert(
            watcher_id,
            Watcher {
                flusher,
                watching: false,
            },
        );
        Some(DebitorIndex(slot))
    }

    /// Claim between `min` and `max` credit. `deferred` is accepted for
    /// callers that know how much of the message is still to come.
    pub fn claim(&self, debitor: DebitorIndex, watcher_id: u64, min: i64, max: i64, _deferred: i64) -> i64 {
        let slot = &self.slots[debitor.0];
        let previous = slot.remaining.fetch_sub(max, Ordering::AcqRel);

        let claimed = if previous >= max {
            max
        } else if previous >= min && previous > 0 {
            slot.remaining.fetch_add(max - previous, Ordering::AcqRel);
            previous
        } else {
            slot.remaining.fetch_add(max, Ordering::AcqRel);
            0
        };

        let short = claimed < max;
        if short {
            BUDGET_CLAIMS_SHORT_TOTAL.inc();
        }
        if let Some(watcher) = slot.watchers.lock().get_mut(&watcher_id) {
            watcher.watching = short;
        }
        claimed
    }

    pub fn release_debitor(&self, debitor: DebitorIndex, watcher_id: u64) {
        let slot = &self.slots[debitor.0];
        slot.watchers.lock().remove(&watcher_id);
        slot.debitors.fetch_sub(1, Ordering::AcqRel);
        self.free_if_unused(debitor.0);
    }

    pub fn available(&self, debitor: DebitorIndex) -> i64 {
        self.slots[debitor.0].remaining.load(Ordering::Acquire)
    }

    /// Slots currently bound to a budget.
    pub fn slots_in_use(&self) -> usize {
        self.index.lock().len()
    }

    fn flush(slot: &BudgetSlot) {
        let woken: Vec<(u64, Flusher)> = {
            let mut watchers = slot.watchers.lock();
            watchers
                .iter_mut()
                .filter(|(_, watcher)| watcher.watching)
                .map(|(&id, watcher)| {
                    watcher.watching = false;
                    (id, watcher.flusher.clone())
                })
                .collect()
        };
        for (watcher_id, flusher) in woken {
            flusher(watcher_id);
        }
    }

    fn free_if_unused(&self, slot: usize) {
        let mut index = self.index.lock();
        let target = &self.slots[slot];
        if target.creditors.load(Ordering::Acquire) == 0 && target.debitors.load(Ordering::Acquire) == 0 {
            index.retain(|_, bound| *bound != slot);
            target.remaining.store(0, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for BudgetPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetPool")
            .field("slots", &self.slots.len())
            .field("in_use", &self.slots_in_use())
            .finish()
    }
}
