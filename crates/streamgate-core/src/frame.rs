//! Frame model exchanged at the stream boundary.
//!
//! Frames are addressed by `stream_id`. BEGIN, DATA, FLUSH, END and ABORT
//! travel in the direction of a half; WINDOW and RESET travel against it.
//! SIGNAL frames are local wake-ups addressed to a fan-out or a member.
//!
//! Extensions carry the broker-specific metadata for fetch and produce
//! streams. The byte encoding of the broker protocol is not modelled here.

use bytes::Bytes;

use crate::filter::Filter;
use crate::offset::{AckMode, DeltaType, Evaluation, Isolation, PartitionProgress, TransactionResult};
use crate::record::Header;

pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const INIT: u8 = 0x02;
    pub const INCOMPLETE: u8 = 0x04;
    pub const SKIP: u8 = 0x08;

    /// A complete message in one frame.
    pub const INIT_FIN: u8 = INIT | FIN;
}

/// Window bytes reserved by a FLUSH frame carrying an extension.
pub const SIZE_OF_FLUSH_WITH_EXTENSION: i32 = 64;

/// Value length of a message whose first fragment carries `payload_len`
/// bytes with `deferred` bytes still to come, or `None` if it does not fit
/// an `i32` or `deferred` is negative.
pub fn value_length(payload_len: usize, deferred: i32) -> Option<i32> {
    if deferred < 0 {
        return None;
    }
    i32::try_from(payload_len).ok()?.checked_add(deferred)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
    pub sequence: i64,
    pub acknowledge: i64,
    pub maximum: i32,
    pub trace_id: i64,
    pub authorization: i64,
}

impl FrameHeader {
    pub fn new(origin_id: u64, routed_id: u64, stream_id: u64) -> Self {
        Self {
            origin_id,
            routed_id,
            stream_id,
            ..Default::default()
        }
    }

    pub fn window(mut self, sequence: i64, acknowledge: i64, maximum: i32) -> Self {
        self.sequence = sequence;
        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self
    }

    pub fn trace(mut self, trace_id: i64) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn authorization(mut self, authorization: i64) -> Self {
        self.authorization = authorization;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Begin,
    Data,
    Flush,
    End,
    Abort,
    Reset,
    Window,
    Signal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Begin(Begin),
    Data(Data),
    Flush(Flush),
    End(End),
    Abort(Abort),
    Reset(Reset),
    Window(Window),
    Signal(Signal),
}

impl Frame {
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Begin(f) => &f.header,
            Frame::Data(f) => &f.header,
            Frame::Flush(f) => &f.header,
            Frame::End(f) => &f.header,
            Frame::Abort(f) => &f.header,
            Frame::Reset(f) => &f.header,
            Frame::Window(f) => &f.header,
            Frame::Signal(f) => &f.header,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.header().stream_id
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Begin(_) => FrameKind::Begin,
            Frame::Data(_) => FrameKind::Data,
            Frame::Flush(_) => FrameKind::Flush,
            Frame::End(_) => FrameKind::End,
            Frame::Abort(_) => FrameKind::Abort,
            Frame::Reset(_) => FrameKind::Reset,
            Frame::Window(_) => FrameKind::Window,
            Frame::Signal(_) => FrameKind::Signal,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub header: FrameHeader,
    pub affinity: i64,
    pub extension: Option<BeginEx>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub header: FrameHeader,
    pub flags: u8,
    pub budget_id: u64,
    pub reserved: i32,
    pub payload: Option<Bytes>,
    pub extension: Option<DataEx>,
}

impl Data {
    pub fn is_init(&self) -> bool {
        self.flags & flags::INIT != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    pub fn is_skip(&self) -> bool {
        self.flags & flags::SKIP != 0
    }

    pub fn is_incomplete(&self) -> bool {
        self.flags & flags::INCOMPLETE != 0
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    pub header: FrameHeader,
    pub budget_id: u64,
    pub reserved: i32,
    pub extension: Option<FlushEx>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct End {
    pub header: FrameHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    pub header: FrameHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reset {
    pub header: FrameHeader,
    pub extension: Option<ResetEx>,
}

impl Reset {
    pub fn error(&self) -> Option<i16> {
        self.extension.as_ref().map(|ex| ex.error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub header: FrameHeader,
    pub budget_id: u64,
    pub padding: i32,
    pub minimum: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub header: FrameHeader,
    pub signal_id: i32,
}

// ---- Extensions ----

#[derive(Debug, Clone, PartialEq)]
pub enum BeginEx {
    Fetch(FetchBeginEx),
    Produce(ProduceBeginEx),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchBeginEx {
    pub topic: String,
    pub partition: PartitionProgress,
    pub filters: Vec<Filter>,
    pub evaluation: Evaluation,
    pub isolation: Isolation,
    pub delta_type: DeltaType,
}

impl FetchBeginEx {
    pub fn new(topic: impl Into<String>, partition: PartitionProgress) -> Self {
        Self {
            topic: topic.into(),
            partition,
            filters: Vec::new(),
            evaluation: Evaluation::default(),
            isolation: Isolation::default(),
            delta_type: DeltaType::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceBeginEx {
    pub transaction: Option<String>,
    pub topic: String,
    pub partition: PartitionProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataEx {
    Fetch(FetchDataEx),
    Produce(ProduceDataEx),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchDataEx {
    /// Bytes of the value still to come after this fragment
    pub deferred: i32,
    pub timestamp: i64,
    pub producer_id: i64,
    pub headers_size_max: i32,
    /// Bitmask of the filters matched by the record
    pub filters: u64,
    pub partition: PartitionProgress,
    pub key: Option<Bytes>,
    pub headers: Vec<Header>,
    pub delta_type: DeltaType,
    pub ancestor_offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceDataEx {
    pub deferred: i32,
    pub timestamp: i64,
    pub sequence: i32,
    pub ack_mode: AckMode,
    pub key: Option<Bytes>,
    /// Record headers on an INIT fragment, trailers on a later FIN fragment
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushEx {
    Fetch(FetchFlushEx),
    Produce(ProduceFlushEx),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchFlushEx {
    pub partition: PartitionProgress,
    pub transaction: Option<Transaction>,
    /// Replacement filters when sent by a consumer
    pub filters: Vec<Filter>,
    pub evaluation: Evaluation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub result: TransactionResult,
    pub producer_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceFlushEx {
    pub partition: PartitionProgress,
    pub key: Option<Bytes>,
    pub error: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetEx {
    pub error: i16,
}
