//! Produce member: one downstream producer writing into a shared partition.
//!
//! Acknowledgment is deferred. A DATA frame grows the member's window
//! without moving `acknowledge`; the window only slides once the upstream
//! acks the entry the frame completed.

use bytes::Bytes;
use streamgate_cache::SegmentRef;
use streamgate_core::frame::{BeginEx, Data, Flush, FlushEx, FrameHeader, ProduceBeginEx, ProduceFlushEx};
use streamgate_core::offset::PartitionProgress;
use streamgate_core::stream_id::reply_id;
use streamgate_core::StreamState;
use tracing::{debug, warn};

use crate::context::StreamContext;

/// What a producer is granted in each initial WINDOW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGrant {
    /// Credit a producer may have outstanding
    pub window_bytes: i32,
    /// Shared budget of the fan-out, 0 before one is acquired
    pub budget_id: u64,
    pub padding: i32,
}

#[derive(Debug)]
pub struct ProduceMember {
    origin_id: u64,
    routed_id: u64,
    initial_id: u64,
    reply_id: u64,
    authorization: i64,
    leader_id: i64,
    state: StreamState,

    initial_seq: i64,
    initial_ack: i64,
    initial_max: i32,
    reply_seq: i64,
    reply_ack: i64,
    reply_max: i32,

    /// Entry being written, or last written
    segment: Option<SegmentRef>,
    partition_offset: i64,
    acked_offset: i64,
}

impl ProduceMember {
    pub fn new(header: &FrameHeader, leader_id: i64) -> Self {
        Self {
            origin_id: header.origin_id,
            routed_id: header.routed_id,
            initial_id: header.stream_id,
            reply_id: reply_id(header.stream_id),
            authorization: header.authorization,
            leader_id,
            state: StreamState::default(),
            initial_seq: header.sequence,
            initial_ack: header.acknowledge,
            initial_max: 0,
            reply_seq: 0,
            reply_ack: 0,
            reply_max: 0,
            segment: None,
            partition_offset: -1,
            acked_offset: -1,
        }
    }

    pub fn initial_id(&self) -> u64 {
        self.initial_id
    }

    pub fn reply_id(&self) -> u64 {
        self.reply_id
    }

    pub fn leader_id(&self) -> i64 {
        self.leader_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn initial_seq(&self) -> i64 {
        self.initial_seq
    }

    pub fn initial_ack(&self) -> i64 {
        self.initial_ack
    }

    /// Offset of the last entry this member started.
    pub fn partition_offset(&self) -> i64 {
        self.partition_offset
    }

    pub fn acked_offset(&self) -> i64 {
        self.acked_offset
    }

    pub fn segment(&self) -> Option<SegmentRef> {
        self.segment
    }

    /// Every entry this member wrote has been acked.
    pub fn is_settled(&self) -> bool {
        self.acked_offset >= self.partition_offset
    }

    pub(crate) fn entry_started(&mut self, segment: SegmentRef, offset: i64) {
        self.segment = Some(segment);
        self.partition_offset = offset;
    }

    fn header(&self, stream_id: u64) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, stream_id).authorization(self.authorization)
    }

    fn initial_header(&self) -> FrameHeader {
        self.header(self.initial_id)
            .window(self.initial_seq, self.initial_ack, self.initial_max)
    }

    fn reply_header(&self) -> FrameHeader {
        self.header(self.reply_id)
            .window(self.reply_seq, self.reply_ack, self.reply_max)
    }

    pub fn on_initial_begin(&mut self) {
        self.state.initial_opening();
    }

    /// Account a DATA frame against the window.
    ///
    /// Returns false when the frame overran the window; the member is then
    /// reset and must be detached.
    pub fn on_initial_data(&mut self, data: &Data, cx: &mut StreamContext<'_>) -> bool {
        debug_assert!(data.header.acknowledge <= data.header.sequence);
        self.initial_seq = self.initial_seq.max(data.header.sequence) + i64::from(data.reserved);
        self.check_window(cx)
    }

    /// Account a FLUSH frame against the window; same contract as DATA.
    pub fn on_initial_flush(&mut self, flush: &Flush, cx: &mut StreamContext<'_>) -> bool {
        self.initial_seq = self.initial_seq.max(flush.header.sequence) + i64::from(flush.reserved);
        flush.reserved <= 0 || self.check_window(cx)
    }

    fn check_window(&mut self, cx: &mut StreamContext<'_>) -> bool {
        if self.initial_seq > self.initial_ack + i64::from(self.initial_max) {
            warn!(
                stream_id = self.initial_id,
                sequence = self.initial_seq,
                acknowledge = self.initial_ack,
                maximum = self.initial_max,
                "Producer exceeded window"
            );
            self.cleanup(cx, None);
            return false;
        }
        true
    }

    /// Window after a DATA frame was written: credit grows, `acknowledge` holds.
    pub fn after_data(&mut self, incomplete: bool, grant: WindowGrant, cx: &mut StreamContext<'_>) {
        let no_ack = if incomplete { 0 } else { self.initial_seq - self.initial_ack };
        let maximum = if incomplete {
            grant.window_bytes
        } else {
            (no_ack + i64::from(grant.window_bytes)).min(i64::from(i32::MAX)) as i32
        };
        self.do_initial_window(no_ack, maximum, grant, cx);
    }

    pub fn do_initial_window(&mut self, min_no_ack: i64, min_max: i32, grant: WindowGrant, cx: &mut StreamContext<'_>) {
        if self.state.is_initial_closed() {
            return;
        }
        let new_ack = (self.initial_seq - min_no_ack).max(self.initial_ack);
        if new_ack > self.initial_ack || min_max > self.initial_max || !self.state.is_initial_opened() {
            self.initial_ack = new_ack;
            self.initial_max = min_max;
            self.state.initial_opened();
            cx.out
                .window(self.initial_header(), grant.budget_id, grant.padding, 0);
        }
    }

    pub fn do_reply_begin_if_necessary(
        &mut self,
        topic: &str,
        partition_id: i32,
        offset_high_watermark: i64,
        cx: &mut StreamContext<'_>,
    ) {
        if self.state.is_reply_opening() {
            return;
        }
        self.state.reply_opening();

        let extension = ProduceBeginEx {
            transaction: None,
            topic: topic.to_string(),
            partition: PartitionProgress::new(partition_id, offset_high_watermark),
        };
        cx.out.begin(
            self.reply_header(),
            self.leader_id,
            Some(BeginEx::Produce(extension)),
        );
    }

    pub fn on_reply_window(&mut self, maximum: i32, acknowledge: i64) {
        self.reply_ack = self.reply_ack.max(acknowledge);
        self.reply_max = maximum;
        self.state.reply_opened();
    }

    /// Returns true once the member is finished and should detach.
    pub fn on_initial_end(&mut self, cx: &mut StreamContext<'_>) -> bool {
        self.state.initial_closed();
        if self.is_settled() {
            self.do_reply_end_if_necessary(cx);
            true
        } else {
            debug!(
                stream_id = self.initial_id,
                pending = self.partition_offset - self.acked_offset,
                "Producer ending with unacked records"
            );
            false
        }
    }

    pub fn on_initial_abort(&mut self, cx: &mut StreamContext<'_>) {
        self.state.initial_closed();
        self.do_reply_abort_if_necessary(cx);
    }

    /// Returns true once the member is finished and should detach.
    pub fn on_reply_reset(&mut self, cx: &mut StreamContext<'_>) -> bool {
        self.state.reply_closed();
        if self.is_settled() {
            self.do_initial_reset_if_necessary(cx, None);
            true
        } else {
            false
        }
    }

    /// Deliver the ack for `offset`. Returns true when this was the last
    /// outstanding ack of a member whose producer already ended.
    pub fn on_message_ack(
        &mut self,
        offset: i64,
        acknowledge: i64,
        key: Option<Bytes>,
        partition_id: i32,
        grant: WindowGrant,
        cx: &mut StreamContext<'_>,
    ) -> bool {
        self.acked_offset = self.acked_offset.max(offset);

        if self.state.reply_active() {
            let extension = ProduceFlushEx {
                partition: PartitionProgress::new(partition_id, offset),
                key,
                error: 0,
            };
            cx.out
                .flush(self.reply_header(), 0, 0, Some(FlushEx::Produce(extension)));
        }

        if acknowledge >= 0 {
            let acked = (acknowledge - self.initial_ack).max(0);
            let maximum = (i64::from(self.initial_max) - acked).max(i64::from(grant.window_bytes)) as i32;
            self.do_initial_window(self.initial_seq - acknowledge, maximum, grant, cx);
        }

        if self.state.is_initial_closed() && offset >= self.partition_offset {
            self.do_reply_end_if_necessary(cx);
            return true;
        }
        false
    }

    /// The upstream rejected the entry at `offset`; the member is reset.
    pub fn on_message_error(&mut self, offset: i64, error: i16, cx: &mut StreamContext<'_>) {
        self.acked_offset = self.acked_offset.max(offset);
        warn!(stream_id = self.initial_id, offset, error, "Produce rejected upstream");
        self.cleanup(cx, Some(error));
    }

    pub fn do_reply_end_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.reply_active() {
            cx.out.end(self.reply_header());
        }
        self.state.reply_closed();
    }

    pub fn do_reply_abort_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.reply_active() {
            cx.out.abort(self.reply_header());
        }
        self.state.reply_closed();
    }

    pub fn do_initial_reset_if_necessary(&mut self, cx: &mut StreamContext<'_>, error: Option<i16>) {
        if self.state.initial_active() {
            cx.out.reset(self.initial_header(), error);
        }
        self.state.initial_closed();
    }

    pub fn cleanup(&mut self, cx: &mut StreamContext<'_>, error: Option<i16>) {
        self.do_initial_reset_if_necessary(cx, error);
        self.do_reply_abort_if_necessary(cx);
    }
}
