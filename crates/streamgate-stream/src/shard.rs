//! Shard Event Loop
//!
//! A shard owns one fetch factory and one produce factory and runs every
//! frame addressed to them on a single tokio task. Downstream frames,
//! upstream frames, timer signals and budget wake-ups all arrive on the
//! same inbox, so fan-outs and members never need locks:
//!
//! ```text
//!   downstream ──┐
//!   upstream  ───┼──▶ inbox ──▶ Shard ──▶ outbound
//!   timers    ───┤              │
//!   budgets   ───┘              ├── FetchFactory
//!                               └── ProduceFactory
//! ```
//!
//! Frames emitted while handling one inbox frame are forwarded to the
//! outbound channel in emission order.

use std::sync::Arc;

use streamgate_core::{Frame, StreamIds};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::budget::BudgetPool;
use crate::config::GatewayConfig;
use crate::context::StreamContext;
use crate::error::{Result, StreamError};
use crate::fetch::{FetchFactory, FetchFactoryOptions};
use crate::outbox::Outbox;
use crate::produce::{ProduceFactory, ProduceFactoryOptions};
use crate::router::Router;
use crate::signaler::{Signaler, TokioSignaler};

/// Signal addresses of fetch fan-outs count up from here.
pub const FETCH_ADDRESS_BASE: u64 = 1 << 62;
/// Signal addresses of produce fan-outs count up from here.
pub const PRODUCE_ADDRESS_BASE: u64 = 3 << 61;
/// First id handed to upstream streams opened by this shard.
pub const UPSTREAM_ID_BASE: u64 = 1 << 48;

pub struct Shard {
    fetch: FetchFactory,
    produce: ProduceFactory,
    signaler: Arc<dyn Signaler>,
    budgets: Arc<BudgetPool>,
    ids: StreamIds,
    wakeups: UnboundedSender<Frame>,
    inbox: UnboundedReceiver<Frame>,
    outbound: UnboundedSender<Frame>,
    out: Outbox,
}

impl Shard {
    /// `inbox` is the shard's own channel; `signaler` must deliver into its sender.
    pub fn new(
        config: &GatewayConfig,
        router: Arc<dyn Router>,
        budgets: Arc<BudgetPool>,
        signaler: Arc<dyn Signaler>,
        inbox: (UnboundedSender<Frame>, UnboundedReceiver<Frame>),
        outbound: UnboundedSender<Frame>,
    ) -> Self {
        let fetch = FetchFactory::new(
            Arc::clone(&router),
            FetchFactoryOptions {
                reconnect_delay_secs: config.server_reconnect_delay_secs,
                window_bytes: config.fetch_window_bytes,
            },
            FETCH_ADDRESS_BASE,
        );
        let produce = ProduceFactory::new(
            router,
            ProduceFactoryOptions {
                reconnect_delay_secs: config.client_reconnect_delay_secs,
                cleanup_delay_secs: config.client_cleanup_delay_secs,
                window_bytes: config.produce_window_bytes,
            },
            PRODUCE_ADDRESS_BASE,
        );
        let (wakeups, inbox) = inbox;

        Self {
            fetch,
            produce,
            signaler,
            budgets,
            ids: StreamIds::new(UPSTREAM_ID_BASE),
            wakeups,
            inbox,
            outbound,
            out: Outbox::new(),
        }
    }

    /// Spawn a shard with tokio timers on the current runtime.
    pub fn spawn(
        config: &GatewayConfig,
        router: Arc<dyn Router>,
        budgets: Arc<BudgetPool>,
        outbound: UnboundedSender<Frame>,
    ) -> ShardHandle {
        let (sender, receiver) = unbounded_channel();
        let signaler = Arc::new(TokioSignaler::new(sender.clone()));
        let shard = Shard::new(config, router, budgets, signaler, (sender.clone(), receiver), outbound);
        let task = tokio::spawn(shard.run());

        ShardHandle {
            inbox: sender,
            task,
        }
    }

    pub fn fetch(&self) -> &FetchFactory {
        &self.fetch
    }

    pub fn produce(&self) -> &ProduceFactory {
        &self.produce
    }

    /// Dispatch one frame and forward whatever it produced.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let mut cx = StreamContext {
            signaler: self.signaler.as_ref(),
            budgets: &self.budgets,
            ids: &self.ids,
            wakeups: &self.wakeups,
            out: &mut self.out,
        };

        if self.fetch.handles(&frame) {
            self.fetch.on_frame(&frame, &mut cx);
        } else if self.produce.handles(&frame) {
            self.produce.on_frame(&frame, &mut cx);
        } else {
            debug!(stream_id = frame.stream_id(), kind = ?frame.kind(), "Dropping unroutable frame");
        }

        for frame in self.out.take() {
            self.outbound
                .send(frame)
                .map_err(|_| StreamError::ShardClosed)?;
        }
        Ok(())
    }

    /// Handle whatever is already queued in the inbox without waiting.
    pub fn run_pending(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(frame) = self.inbox.try_recv() {
            self.handle_frame(frame)?;
            handled += 1;
        }
        Ok(handled)
    }

    pub async fn run(mut self) {
        info!("Shard started");
        while let Some(frame) = self.inbox.recv().await {
            if let Err(e) = self.handle_frame(frame) {
                warn!(error = %e, "Shard stopping");
                break;
            }
        }
        info!(
            fetch_fanouts = self.fetch.fan_count(),
            produce_fanouts = self.produce.fan_count(),
            "Shard stopped"
        );
    }
}

/// Sending side of a spawned [`Shard`].
pub struct ShardHandle {
    inbox: UnboundedSender<Frame>,
    task: JoinHandle<()>,
}

impl ShardHandle {
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.inbox.send(frame).map_err(|_| StreamError::ShardClosed)
    }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::router::StaticRouter;
    use crate::signaler::ManualSignaler;
    use std::time::Duration;
    use streamgate_core::frame::{Begin, BeginEx, FetchBeginEx, FrameHeader, ProduceBeginEx};
    use streamgate_core::offset::{OffsetType, PartitionProgress};

    fn config() -> GatewayConfig {
        GatewayConfig {
            topics: vec![TopicConfig::new("orders").with_partition(0, 7)],
            ..Default::default()
        }
    }

    fn fetch_begin(stream_id: u64) -> Frame {
        Frame::Begin(Begin {
            header: FrameHeader::new(0, 1, stream_id),
            affinity: 7,
            extension: Some(BeginEx::Fetch(FetchBeginEx::new(
                "orders",
                PartitionProgress::new(0, OffsetType::HISTORICAL),
            ))),
        })
    }

    #[tokio::test]
    async fn test_spawned_shard_opens_upstream() {
        let config = config();
        let (outbound, mut frames) = unbounded_channel();
        let handle = Shard::spawn(
            &config,
            Arc::new(StaticRouter::new(&config)),
            Arc::new(BudgetPool::new(config.budget_slots)),
            outbound,
        );

        handle.send(fetch_begin(11)).unwrap();

        let mut upstream = None;
        while upstream.is_none() {
            let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
                .await
                .unwrap()
                .unwrap();
            if let Frame::Begin(begin) = frame {
                if begin.header.stream_id >= UPSTREAM_ID_BASE {
                    upstream = Some(begin);
                }
            }
        }
        let upstream = upstream.unwrap();
        assert_eq!(upstream.affinity, 7);
        assert!(matches!(upstream.extension, Some(BeginEx::Fetch(_))));

        handle.stop().await;
    }

    #[test]
    fn test_routes_by_direction() {
        let config = config();
        let (sender, receiver) = unbounded_channel();
        let signaler = Arc::new(ManualSignaler::new(sender.clone(), 1_000_000));
        let (outbound, mut frames) = unbounded_channel();
        let mut shard = Shard::new(
            &config,
            Arc::new(StaticRouter::new(&config)),
            Arc::new(BudgetPool::new(16)),
            signaler,
            (sender, receiver),
            outbound,
        );

        shard.handle_frame(fetch_begin(11)).unwrap();
        let produce = Frame::Begin(Begin {
            header: FrameHeader::new(0, 1, 21),
            affinity: 7,
            extension: Some(BeginEx::Produce(ProduceBeginEx {
                transaction: None,
                topic: "orders".to_string(),
                partition: PartitionProgress::new(0, -1),
            })),
        });
        shard.handle_frame(produce).unwrap();

        assert_eq!(shard.fetch().fan_count(), 1);
        assert_eq!(shard.produce().fan_count(), 1);
        assert!(frames.try_recv().is_ok());
    }

    #[test]
    fn test_closed_outbound_stops_shard() {
        let config = config();
        let (sender, receiver) = unbounded_channel();
        let signaler = Arc::new(ManualSignaler::new(sender.clone(), 1_000_000));
        let (outbound, frames) = unbounded_channel();
        drop(frames);
        let mut shard = Shard::new(
            &config,
            Arc::new(StaticRouter::new(&config)),
            Arc::new(BudgetPool::new(16)),
            signaler,
            (sender, receiver),
            outbound,
        );

        let result = shard.handle_frame(fetch_begin(11));
        assert!(matches!(result, Err(StreamError::ShardClosed)));
    }
}
