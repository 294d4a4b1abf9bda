//! Integration tests for fetch fan-outs driven through a shard

use std::sync::Arc;

use bytes::Bytes;
use streamgate_core::frame::{
    flags, Begin, BeginEx, Data, DataEx, End, FetchBeginEx, FetchDataEx, FetchFlushEx, Flush, FlushEx, Frame,
    FrameHeader, Reset, ResetEx, Transaction, Window,
};
use streamgate_core::offset::{DeltaType, Isolation, PartitionProgress, TransactionResult};
use streamgate_core::stream_id::reply_id;
use streamgate_stream::shard::{FETCH_ADDRESS_BASE, UPSTREAM_ID_BASE};
use streamgate_stream::{BudgetPool, GatewayConfig, ManualSignaler, PartitionKey, Shard, StaticRouter, TopicConfig};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

const SIGNAL_RECONNECT: i32 = 1;

struct Gateway {
    shard: Shard,
    signaler: Arc<ManualSignaler>,
    router: Arc<StaticRouter>,
    frames: UnboundedReceiver<Frame>,
}

impl Gateway {
    fn new(config: GatewayConfig) -> Self {
        streamgate_observability::logging::init("warn");
        let (sender, receiver) = unbounded_channel();
        let signaler = Arc::new(ManualSignaler::new(sender.clone(), 1_000_000));
        let router = Arc::new(StaticRouter::new(&config));
        let (outbound, frames) = unbounded_channel();
        let shard = Shard::new(
            &config,
            router.clone(),
            Arc::new(BudgetPool::new(16)),
            signaler.clone(),
            (sender, receiver),
            outbound,
        );
        Self {
            shard,
            signaler,
            router,
            frames,
        }
    }

    fn send(&mut self, frame: Frame) -> Vec<Frame> {
        self.shard.handle_frame(frame).unwrap();
        self.shard.run_pending().unwrap();
        self.collect()
    }

    fn advance(&mut self, millis: i64) -> Vec<Frame> {
        self.signaler.advance(millis);
        self.shard.run_pending().unwrap();
        self.collect()
    }

    fn collect(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn offsets(&self) -> (i64, i64, i64) {
        self.shard
            .fetch()
            .fan(&PartitionKey::new("orders", 0))
            .unwrap()
            .offsets()
    }
}

fn config(reconnect_delay_secs: u64) -> GatewayConfig {
    GatewayConfig {
        server_reconnect_delay_secs: reconnect_delay_secs,
        topics: vec![TopicConfig::new("orders").with_partition(0, 7)],
        ..Default::default()
    }
}

fn member_begin(stream_id: u64, affinity: i64, isolation: Isolation) -> Frame {
    let mut extension = FetchBeginEx::new("orders", PartitionProgress::new(0, 0));
    extension.isolation = isolation;
    Frame::Begin(Begin {
        header: FrameHeader::new(0, 1, stream_id),
        affinity,
        extension: Some(BeginEx::Fetch(extension)),
    })
}

fn window(stream_id: u64, acknowledge: i64, maximum: i32) -> Frame {
    Frame::Window(Window {
        header: FrameHeader::new(0, 1, stream_id).window(acknowledge, acknowledge, maximum),
        budget_id: 0,
        padding: 0,
        minimum: 0,
    })
}

fn reset(stream_id: u64, error: i16) -> Frame {
    Frame::Reset(Reset {
        header: FrameHeader::new(0, 1, stream_id),
        extension: Some(ResetEx { error }),
    })
}

fn record(reply_id: u64, offset: i64, producer_id: i64, value: &[u8], frame_flags: u8) -> Frame {
    Frame::Data(Data {
        header: FrameHeader::new(0, 1, reply_id),
        flags: frame_flags,
        budget_id: 0,
        reserved: value.len() as i32,
        payload: Some(Bytes::copy_from_slice(value)),
        extension: Some(DataEx::Fetch(FetchDataEx {
            deferred: 0,
            timestamp: 0,
            producer_id,
            headers_size_max: 0,
            filters: 0,
            partition: PartitionProgress::new(0, offset).with_offsets(offset, offset),
            key: None,
            headers: Vec::new(),
            delta_type: DeltaType::None,
            ancestor_offset: -1,
        })),
    })
}

/// First fragment of a record whose remaining `deferred` bytes follow in later frames.
fn record_start(reply_id: u64, offset: i64, value: &[u8], deferred: i32) -> Frame {
    let mut frame = record(reply_id, offset, 0, value, flags::INIT);
    if let Frame::Data(Data {
        extension: Some(DataEx::Fetch(extension)),
        ..
    }) = &mut frame
    {
        extension.deferred = deferred;
    }
    frame
}

fn upstream_flush(reply_id: u64, progress: PartitionProgress, transaction: Option<Transaction>) -> Frame {
    Frame::Flush(Flush {
        header: FrameHeader::new(0, 1, reply_id),
        budget_id: 0,
        reserved: 0,
        extension: Some(FlushEx::Fetch(FetchFlushEx {
            partition: progress,
            transaction,
            filters: Vec::new(),
            evaluation: Default::default(),
        })),
    })
}

/// Upstream BEGINs among `frames`, as (initial id, affinity).
fn upstream_begins(frames: &[Frame]) -> Vec<(u64, i64)> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Begin(begin) if begin.header.stream_id >= UPSTREAM_ID_BASE => {
                Some((begin.header.stream_id, begin.affinity))
            }
            _ => None,
        })
        .collect()
}

fn reset_error(frames: &[Frame], stream_id: u64) -> Option<i16> {
    frames.iter().find_map(|frame| match frame {
        Frame::Reset(reset) if reset.header.stream_id == stream_id => reset.error(),
        _ => None,
    })
}

/// Answer the upstream BEGIN of `initial_id` with a window and a reply BEGIN.
fn open_upstream(gateway: &mut Gateway, initial_id: u64) -> Vec<Frame> {
    let mut frames = gateway.send(window(initial_id, 0, 65536));
    frames.extend(gateway.send(Frame::Begin(Begin {
        header: FrameHeader::new(0, 1, reply_id(initial_id)),
        affinity: 0,
        extension: Some(BeginEx::Fetch(FetchBeginEx::new(
            "orders",
            PartitionProgress::new(0, 0).with_offsets(-1, -1),
        ))),
    })));
    frames
}

#[derive(Debug, PartialEq)]
enum Delivery {
    Data(u8, Vec<u8>),
    Transaction(TransactionResult, i64),
}

/// What a member's consumer received on its reply stream, progress flushes aside.
fn deliveries(frames: &[Frame], member_reply_id: u64) -> Vec<Delivery> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) if data.header.stream_id == member_reply_id => Some(Delivery::Data(
                data.flags,
                data.payload.as_ref().map_or(Vec::new(), |p| p.to_vec()),
            )),
            Frame::Flush(Flush {
                header,
                extension: Some(FlushEx::Fetch(FetchFlushEx {
                    transaction: Some(transaction),
                    ..
                })),
                ..
            }) if header.stream_id == member_reply_id => {
                Some(Delivery::Transaction(transaction.result, transaction.producer_id))
            }
            _ => None,
        })
        .collect()
}

#[test]
fn test_offsets_monotonic_under_arbitrary_progress() {
    let mut gateway = Gateway::new(config(0));
    let frames = gateway.send(member_begin(11, 7, Isolation::ReadUncommitted));
    let (initial_id, _) = upstream_begins(&frames)[0];
    open_upstream(&mut gateway, initial_id);
    let upstream_reply_id = reply_id(initial_id);

    // deterministic pseudo-random progress, regressions included
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = |bound: i64| {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        (seed % bound as u64) as i64
    };

    let mut offset = 0;
    let mut previous = gateway.offsets();
    for _ in 0..200 {
        let frame = if next(3) == 0 {
            let progress = PartitionProgress::new(0, offset - next(4))
                .with_offsets(offset - next(6), offset - next(6));
            upstream_flush(upstream_reply_id, progress, None)
        } else {
            offset += 1 + next(2);
            let mut frame = record(upstream_reply_id, offset, 0, b"v", flags::INIT_FIN);
            if let Frame::Data(Data {
                extension: Some(DataEx::Fetch(extension)),
                ..
            }) = &mut frame
            {
                extension.partition = extension
                    .partition
                    .with_offsets(offset - next(5), offset + next(5) - 2);
            }
            frame
        };
        gateway.send(frame);

        let current = gateway.offsets();
        assert!(current.0 >= previous.0, "partition offset regressed: {:?} -> {:?}", previous, current);
        assert!(current.1 >= previous.1, "stable offset regressed: {:?} -> {:?}", previous, current);
        assert!(current.2 >= previous.2, "latest offset regressed: {:?} -> {:?}", previous, current);
        assert!(current.1 <= current.2, "stable beyond latest: {:?}", current);
        previous = current;
    }
}

#[test]
fn test_one_upstream_per_partition() {
    let mut gateway = Gateway::new(config(0));
    let mut frames = Vec::new();
    for stream_id in [11, 13, 15] {
        frames.extend(gateway.send(member_begin(stream_id, 7, Isolation::ReadUncommitted)));
    }
    let begins = upstream_begins(&frames);
    assert_eq!(begins.len(), 1);
    let (first_upstream, _) = begins[0];

    let mut frames = Vec::new();
    for stream_id in [11, 13, 15] {
        frames.extend(gateway.send(Frame::End(End {
            header: FrameHeader::new(0, 1, stream_id),
        })));
    }
    assert!(frames
        .iter()
        .any(|f| matches!(f, Frame::Abort(abort) if abort.header.stream_id == first_upstream)));

    let mut frames = Vec::new();
    for stream_id in [17, 19] {
        frames.extend(gateway.send(member_begin(stream_id, 7, Isolation::ReadUncommitted)));
    }
    let begins = upstream_begins(&frames);
    assert_eq!(begins.len(), 1);
    assert_ne!(begins[0].0, first_upstream);
    assert_eq!(gateway.shard.fetch().fan_count(), 1);
}

#[test]
fn test_isolation_levels_see_transactions_differently() {
    let mut gateway = Gateway::new(config(0));
    let mut frames = gateway.send(member_begin(11, 7, Isolation::ReadCommitted));
    frames.extend(gateway.send(member_begin(13, 7, Isolation::ReadUncommitted)));
    let (initial_id, _) = upstream_begins(&frames)[0];
    open_upstream(&mut gateway, initial_id);
    let upstream_reply_id = reply_id(initial_id);

    let mut frames = gateway.send(window(reply_id(11), 0, 65536));
    frames.extend(gateway.send(window(reply_id(13), 0, 65536)));

    frames.extend(gateway.send(record(upstream_reply_id, 0, 0, b"e1", flags::INIT_FIN)));
    frames.extend(gateway.send(record(upstream_reply_id, 1, 42, b"e2", flags::INIT_FIN | flags::SKIP)));
    frames.extend(gateway.send(upstream_flush(
        upstream_reply_id,
        PartitionProgress::new(0, 2).with_offsets(2, 2),
        Some(Transaction {
            result: TransactionResult::Abort,
            producer_id: 42,
        }),
    )));
    frames.extend(gateway.send(record(upstream_reply_id, 3, 0, b"e3", flags::INIT_FIN)));

    assert_eq!(
        deliveries(&frames, reply_id(11)),
        vec![
            Delivery::Data(flags::INIT_FIN, b"e1".to_vec()),
            Delivery::Data(flags::INIT_FIN, b"e3".to_vec()),
        ]
    );
    assert_eq!(
        deliveries(&frames, reply_id(13)),
        vec![
            Delivery::Data(flags::INIT_FIN, b"e1".to_vec()),
            Delivery::Data(flags::INIT_FIN | flags::SKIP, b"e2".to_vec()),
            Delivery::Transaction(TransactionResult::Abort, 42),
            Delivery::Data(flags::INIT_FIN, b"e3".to_vec()),
        ]
    );
}

#[test]
fn test_fragments_reassemble_under_small_windows() {
    let mut gateway = Gateway::new(config(0));
    let frames = gateway.send(member_begin(11, 7, Isolation::ReadUncommitted));
    let (initial_id, _) = upstream_begins(&frames)[0];
    open_upstream(&mut gateway, initial_id);

    let value: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let mut frames = gateway.send(record(reply_id(initial_id), 0, 0, &value, flags::INIT_FIN));

    // the consumer acknowledges everything received before granting the next window
    for increment in [1500, 1200, 2000, 3000] {
        let acknowledged: i64 = frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) if data.header.stream_id == reply_id(11) => Some(i64::from(data.reserved)),
                _ => None,
            })
            .sum();
        frames.extend(gateway.send(window(reply_id(11), acknowledged, increment)));
    }

    let fragments: Vec<&Data> = frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) if data.header.stream_id == reply_id(11) => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(fragments.len(), 4);
    assert!(fragments.iter().all(|data| data.payload_len() < value.len()));
    assert_eq!(fragments.first().map(|d| d.flags), Some(flags::INIT));
    assert_eq!(fragments.last().map(|d| d.flags), Some(flags::FIN));

    let reassembled: Vec<u8> = fragments
        .iter()
        .flat_map(|data| data.payload.as_ref().map_or(Vec::new(), |p| p.to_vec()))
        .collect();
    assert_eq!(reassembled, value);
}

#[test]
fn test_fragmented_upstream_record_delivered_whole() {
    let mut gateway = Gateway::new(config(0));
    let frames = gateway.send(member_begin(11, 7, Isolation::ReadUncommitted));
    let (initial_id, _) = upstream_begins(&frames)[0];
    open_upstream(&mut gateway, initial_id);
    let upstream_reply_id = reply_id(initial_id);

    let mut frames = gateway.send(window(reply_id(11), 0, 65536));
    frames.extend(gateway.send(record_start(upstream_reply_id, 0, b"abc", 3)));
    assert!(deliveries(&frames, reply_id(11)).is_empty());

    frames.extend(gateway.send(record(upstream_reply_id, 0, 0, b"def", flags::FIN)));
    assert_eq!(
        deliveries(&frames, reply_id(11)),
        vec![Delivery::Data(flags::INIT_FIN, b"abcdef".to_vec())]
    );
}

#[test]
fn test_interrupted_upstream_record_rewritten_after_reconnect() {
    let mut gateway = Gateway::new(config(5));
    let frames = gateway.send(member_begin(11, 7, Isolation::ReadUncommitted));
    let (initial_id, _) = upstream_begins(&frames)[0];
    open_upstream(&mut gateway, initial_id);

    let mut frames = gateway.send(window(reply_id(11), 0, 65536));
    frames.extend(gateway.send(record_start(reply_id(initial_id), 0, b"abc", 3)));
    frames.extend(gateway.send(reset(initial_id, 7)));

    let reconnected = gateway.advance(50);
    let (next_id, _) = upstream_begins(&reconnected)[0];
    frames.extend(reconnected);
    frames.extend(open_upstream(&mut gateway, next_id));
    frames.extend(gateway.send(record(reply_id(next_id), 0, 0, b"abcdef", flags::INIT_FIN)));

    assert_eq!(
        deliveries(&frames, reply_id(11)),
        vec![Delivery::Data(flags::INIT_FIN, b"abcdef".to_vec())]
    );
}

#[test]
fn test_leader_change_resets_stale_members() {
    let mut gateway = Gateway::new(config(0));
    let mut frames = gateway.send(member_begin(11, 7, Isolation::ReadUncommitted));
    frames.extend(gateway.send(member_begin(13, 7, Isolation::ReadUncommitted)));
    let (old_upstream, affinity) = upstream_begins(&frames)[0];
    assert_eq!(affinity, 7);

    gateway.router.set_leader("orders", 0, 9);
    let frames = gateway.send(member_begin(15, 9, Isolation::ReadUncommitted));

    assert!(frames
        .iter()
        .any(|f| matches!(f, Frame::Abort(abort) if abort.header.stream_id == old_upstream)));
    assert_eq!(reset_error(&frames, 11), Some(6));
    assert_eq!(reset_error(&frames, 13), Some(6));

    let begins = upstream_begins(&frames);
    assert_eq!(begins.len(), 1);
    assert_ne!(begins[0].0, old_upstream);
    assert_eq!(begins[0].1, 9);

    let fan = gateway.shard.fetch().fan(&PartitionKey::new("orders", 0)).unwrap();
    assert_eq!(fan.member_count(), 1);
    assert!(fan.has_member(15));
    assert_eq!(fan.leader_id(), 9);
}

#[test]
fn test_reconnect_backoff_doubles_and_resets() {
    let mut gateway = Gateway::new(config(5));
    let frames = gateway.send(member_begin(11, 7, Isolation::ReadUncommitted));
    let (mut upstream, _) = upstream_begins(&frames)[0];

    let mut now = 1_000_000;
    for delay in [50, 100, 200, 400] {
        gateway.send(reset(upstream, 7));
        assert_eq!(
            gateway.signaler.deadlines(FETCH_ADDRESS_BASE, SIGNAL_RECONNECT),
            vec![now + delay]
        );

        let frames = gateway.advance(delay);
        now += delay;
        let begins = upstream_begins(&frames);
        assert_eq!(begins.len(), 1);
        assert_ne!(begins[0].0, upstream);
        upstream = begins[0].0;
    }

    // a successful reopen starts the next failure from the shortest delay
    gateway.send(window(upstream, 0, 65536));
    gateway.send(reset(upstream, 7));
    assert_eq!(
        gateway.signaler.deadlines(FETCH_ADDRESS_BASE, SIGNAL_RECONNECT),
        vec![now + 50]
    );
}

#[test]
fn test_not_leader_reset_is_terminal() {
    let mut gateway = Gateway::new(config(5));
    let frames = gateway.send(member_begin(11, 7, Isolation::ReadUncommitted));
    let (upstream, _) = upstream_begins(&frames)[0];

    let frames = gateway.send(reset(upstream, 6));

    assert_eq!(reset_error(&frames, 11), Some(6));
    assert!(gateway
        .signaler
        .deadlines(FETCH_ADDRESS_BASE, SIGNAL_RECONNECT)
        .is_empty());
    let fan = gateway.shard.fetch().fan(&PartitionKey::new("orders", 0)).unwrap();
    assert_eq!(fan.member_count(), 0);
}
