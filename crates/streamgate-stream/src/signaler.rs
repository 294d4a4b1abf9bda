//! Timers and wake-ups.
//!
//! Fan-outs and members never block: anything that has to happen later is a
//! SIGNAL frame delivered back to the shard inbox, addressed to the stream
//! that asked for it. A deadline already due is signalled immediately and
//! no handle is returned.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use streamgate_core::frame::{Frame, FrameHeader, Signal};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

pub trait Signaler: Send + Sync {
    fn now_millis(&self) -> i64;

    /// Arm a timer firing `signal_id` at `address` once `deadline` is reached.
    fn schedule(&self, deadline: i64, address: u64, signal_id: i32) -> TimerHandle;

    fn signal_now(&self, address: u64, signal_id: i32);

    /// Returns true if the timer had not fired yet.
    fn cancel(&self, handle: TimerHandle) -> bool;

    fn signal_at(&self, deadline: i64, address: u64, signal_id: i32) -> Option<TimerHandle> {
        if deadline <= self.now_millis() {
            self.signal_now(address, signal_id);
            None
        } else {
            Some(self.schedule(deadline, address, signal_id))
        }
    }
}

/// Cancel the timer in `handle`, if any.
pub fn cancel_timer(signaler: &dyn Signaler, handle: &mut Option<TimerHandle>) {
    if let Some(handle) = handle.take() {
        signaler.cancel(handle);
    }
}

pub fn signal_frame(address: u64, signal_id: i32) -> Frame {
    Frame::Signal(Signal {
        header: FrameHeader::new(0, 0, address),
        signal_id,
    })
}

/// Timers backed by tokio sleeps, delivering into the shard inbox.
pub struct TokioSignaler {
    inbox: UnboundedSender<Frame>,
    timers: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_id: AtomicU64,
    runtime: tokio::runtime::Handle,
}

impl TokioSignaler {
    /// Must be called from within a tokio runtime.
    pub fn new(inbox: UnboundedSender<Frame>) -> Self {
        Self {
            inbox,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Signaler for TokioSignaler {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as i64)
    }

    fn schedule(&self, deadline: i64, address: u64, signal_id: i32) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = Duration::from_millis((deadline - self.now_millis()).max(0) as u64);
        let inbox = self.inbox.clone();
        let timers = self.timers.clone();

        // hold the lock so the task cannot remove its entry before it is inserted
        let mut pending = self.timers.lock();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            timers.lock().remove(&id);
            trace!(address, signal_id, "Timer fired");
            let _ = inbox.send(signal_frame(address, signal_id));
        });
        pending.insert(id, task);
        TimerHandle(id)
    }

    fn signal_now(&self, address: u64, signal_id: i32) {
        let _ = self.inbox.send(signal_frame(address, signal_id));
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        match self.timers.lock().remove(&handle.0) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

/// Deterministic clock for tests: time only moves on [`ManualSignaler::advance`]
/// and [`ManualSignaler::set_now`].
pub struct ManualSignaler {
    inbox: UnboundedSender<Frame>,
    now: AtomicI64,
    next_id: AtomicU64,
    timers: Mutex<BTreeMap<(i64, u64), (u64, i32)>>,
}

impl ManualSignaler {
    pub fn new(inbox: UnboundedSender<Frame>, now: i64) -> Self {
        Self {
            inbox,
            now: AtomicI64::new(now),
            next_id: AtomicU64::new(1),
            timers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Move the clock forward, firing due timers in deadline order.
    pub fn advance(&self, millis: i64) {
        let now = self.now.fetch_add(millis, Ordering::AcqRel) + millis;
        let due: Vec<(u64, i32)> = {
            let mut timers = self.timers.lock();
            let later = timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut *timers, later).into_values().collect()
        };
        for (address, signal_id) in due {
            let _ = self.inbox.send(signal_frame(address, signal_id));
        }
    }

    /// Step the clock to `now` without firing anything, as a wall clock
    /// adjusted backwards would.
    pub fn set_now(&self, now: i64) {
        self.now.store(now, Ordering::Release);
    }

    /// Deadlines armed for `address` and `signal_id`.
    pub fn deadlines(&self, address: u64, signal_id: i32) -> Vec<i64> {
        self.timers
            .lock()
            .iter()
            .filter(|(_, &(a, s))| a == address && s == signal_id)
            .map(|(&(deadline, _), _)| deadline)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Signaler for ManualSignaler {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    fn schedule(&self, deadline: i64, address: u64, signal_id: i32) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().insert((deadline, id), (address, signal_id));
        TimerHandle(id)
    }

    fn signal_now(&self, address: u64, signal_id: i32) {
        let _ = self.inbox.send(signal_frame(address, signal_id));
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut timers = self.timers.lock();
        let key = timers.keys().find(|(_, id)| *id == handle.0).copied();
        key.and_then(|key| timers.remove(&key)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn signal_id(frame: Frame) -> (u64, i32) {
        match frame {
            Frame::Signal(signal) => (signal.header.stream_id, signal.signal_id),
            other => panic!("expected signal, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_manual_fires_in_deadline_order() {
        let (tx, mut rx) = unbounded_channel();
        let signaler = ManualSignaler::new(tx, 1_000);

        signaler.signal_at(1_300, 9, 2);
        signaler.signal_at(1_100, 9, 1);
        signaler.signal_at(2_000, 9, 3);

        signaler.advance(300);
        assert_eq!(signal_id(rx.try_recv().unwrap()), (9, 1));
        assert_eq!(signal_id(rx.try_recv().unwrap()), (9, 2));
        assert!(rx.try_recv().is_err());
        assert_eq!(signaler.pending(), 1);
    }

    #[test]
    fn test_due_deadline_signals_now() {
        let (tx, mut rx) = unbounded_channel();
        let signaler = ManualSignaler::new(tx, 1_000);

        assert!(signaler.signal_at(1_000, 4, 1).is_none());
        assert_eq!(signal_id(rx.try_recv().unwrap()), (4, 1));
    }

    #[test]
    fn test_manual_cancel() {
        let (tx, mut rx) = unbounded_channel();
        let signaler = ManualSignaler::new(tx, 0);

        let mut handle = signaler.signal_at(100, 4, 1);
        assert_eq!(signaler.deadlines(4, 1), vec![100]);
        cancel_timer(&signaler, &mut handle);
        assert!(handle.is_none());

        // cancelling nothing is a no-op
        cancel_timer(&signaler, &mut handle);
        signaler.advance(200);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tokio_signaler_fires() {
        let (tx, mut rx) = unbounded_channel();
        let signaler = TokioSignaler::new(tx);

        let deadline = signaler.now_millis() + 20;
        assert!(signaler.signal_at(deadline, 5, 3).is_some());

        let frame = rx.recv().await.unwrap();
        assert_eq!(signal_id(frame), (5, 3));
    }

    #[tokio::test]
    async fn test_tokio_signaler_cancel() {
        let (tx, mut rx) = unbounded_channel();
        let signaler = TokioSignaler::new(tx);

        let handle = signaler.schedule(signaler.now_millis() + 50, 5, 3);
        assert!(signaler.cancel(handle));
        assert_eq!(signaler.pending(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
