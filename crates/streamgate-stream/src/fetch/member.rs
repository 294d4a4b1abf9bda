//! Fetch member: one downstream consumer of a fetch fan-out.
//!
//! A member owns a private [`Cursor`] over the fan-out's cache partition and
//! drains it into DATA frames as its reply window allows. Values larger than
//! the window are split into fragments:
//!
//! ```text
//!   entry value: [■■■■■■■■■■■■■■■■■■■■■■■■]
//!   frames:       INIT      (none)    FIN
//!                [■■■■■■■■][■■■■■■■■][■■■■■■■■]
//!                 message_offset ────▶
//! ```
//!
//! `message_offset` is non-zero only while a value is part way out. Filter
//! updates replace the cursor, but never in the middle of a value.

use std::sync::Arc;

use bytes::Bytes;
use streamgate_cache::{Cursor, Entry, FilterCondition, Partition};
use streamgate_core::frame::{
    flags, DataEx, FetchBeginEx, FetchDataEx, FetchFlushEx, FlushEx, FrameHeader, Transaction, Window,
    SIZE_OF_FLUSH_WITH_EXTENSION,
};
use streamgate_core::offset::{DeltaType, Isolation, OffsetType, PartitionProgress, TransactionResult};
use streamgate_core::record::headers_size;
use streamgate_core::stream_id::reply_id;
use streamgate_core::{BeginEx, Frame, StreamState};
use streamgate_observability::metrics::{FETCH_BYTES_TOTAL, FETCH_FRAGMENTS_TOTAL};
use tracing::{debug, warn};

use crate::budget::{DebitorIndex, Flusher};
use crate::context::StreamContext;
use crate::signaler::signal_frame;

/// Members are woken with this signal when shared budget frees up.
pub const SIGNAL_BUDGET_FLUSH: i32 = 16;

/// Largest fragment a member insists on before accepting a partial one.
const FRAGMENT_LENGTH_MIN: i32 = 1024;

/// What a member may read of its fan-out while draining.
pub struct FanView<'a> {
    pub partition: &'a dyn Partition,
    pub partition_offset: i64,
    pub stable_offset: i64,
    pub latest_offset: i64,
}

impl FanView<'_> {
    fn progress(&self, partition_offset: i64) -> PartitionProgress {
        PartitionProgress::new(self.partition.id(), partition_offset)
            .with_offsets(self.stable_offset, self.latest_offset)
    }
}

#[derive(Debug)]
pub struct FetchMember {
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
    reply_pad: i32,
    reply_min: i32,
    reply_budget_id: u64,
    debitor: Option<DebitorIndex>,

    cursor: Cursor,
    pending_cursor: Option<Cursor>,
    isolation: Isolation,
    delta_type: DeltaType,
    initial_offset: i64,
    bounded: bool,
    message_offset: i32,
    initial_group_partition_offset: i64,
    initial_group_latest_offset: i64,
    /// Highest offset the consumer has been told about, by DATA or FLUSH
    flushed_offset: i64,
}

impl FetchMember {
    pub fn new(header: &FrameHeader, leader_id: i64, begin: &FetchBeginEx) -> Self {
        let condition = FilterCondition::from_filters(&begin.filters, begin.evaluation);
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
            reply_pad: 0,
            reply_min: 0,
            reply_budget_id: 0,
            debitor: None,
            cursor: Cursor::new(condition, begin.delta_type),
            pending_cursor: None,
            isolation: begin.isolation,
            delta_type: begin.delta_type,
            initial_offset: begin.partition.partition_offset,
            bounded: begin.partition.latest_offset == OffsetType::HISTORICAL,
            message_offset: 0,
            initial_group_partition_offset: -1,
            initial_group_latest_offset: -1,
            flushed_offset: -1,
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

    pub fn cursor_offset(&self) -> i64 {
        self.cursor.offset()
    }

    pub fn has_debitor(&self) -> bool {
        self.debitor.is_some()
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

    fn reply_window(&self) -> i64 {
        i64::from(self.reply_max) - (self.reply_seq - self.reply_ack)
    }

    pub fn on_initial_begin(&mut self) {
        self.state.initial_opening();
    }

    /// Consumers send nothing upstream; their initial window stays empty.
    pub fn do_initial_window(&mut self, cx: &mut StreamContext<'_>) {
        if !self.state.is_initial_opened() {
            self.state.initial_opened();
            cx.out.window(self.initial_header(), 0, 0, 0);
        }
    }

    pub fn do_reply_begin_if_necessary(&mut self, fan: &FanView<'_>, cx: &mut StreamContext<'_>) {
        if self.state.is_reply_opening() {
            return;
        }
        self.state.reply_opening();

        self.initial_group_partition_offset = fan.partition_offset;
        self.initial_group_latest_offset = fan.latest_offset;

        let offset = match OffsetType::from_value(self.initial_offset) {
            Some(OffsetType::Live) => fan.latest_offset + 1,
            Some(OffsetType::Historical) => fan
                .partition
                .first_segment()
                .map_or(0, |segment| segment.base_offset()),
            None => self.initial_offset,
        }
        .max(0);
        self.initial_offset = offset;

        let segment = fan
            .partition
            .seek_not_after(offset)
            .or_else(|| fan.partition.first_segment());
        self.cursor.init(segment, offset, self.initial_group_latest_offset);
        self.flushed_offset = offset - 1;

        debug!(
            topic = fan.partition.topic(),
            partition = fan.partition.id(),
            stream_id = self.reply_id,
            offset,
            "Fetch member reply opening"
        );

        let mut begin = FetchBeginEx::new(
            fan.partition.topic(),
            PartitionProgress::new(fan.partition.id(), self.cursor.offset())
                .with_offsets(fan.stable_offset, self.initial_group_latest_offset),
        );
        begin.isolation = self.isolation;
        begin.delta_type = self.delta_type;
        cx.out
            .begin(self.reply_header(), self.leader_id, Some(BeginEx::Fetch(begin)));
    }

    /// Returns false when the member could not be given budget and was closed.
    pub fn on_reply_window(&mut self, window: &Window, fan: &FanView<'_>, cx: &mut StreamContext<'_>) -> bool {
        let header = &window.header;
        debug_assert!(header.acknowledge <= header.sequence);
        debug_assert!(header.acknowledge >= self.reply_ack);

        self.reply_ack = self.reply_ack.max(header.acknowledge);
        self.reply_max = header.maximum;
        self.reply_pad = window.padding;
        self.reply_min = window.minimum;
        self.reply_budget_id = window.budget_id;

        if !self.state.is_reply_opened() {
            self.state.reply_opened();

            if self.reply_budget_id != 0 && self.debitor.is_none() {
                let wakeups = cx.wakeups.clone();
                let flusher: Flusher = Arc::new(move |watcher_id| {
                    let _ = wakeups.send(signal_frame(watcher_id, SIGNAL_BUDGET_FLUSH));
                });
                self.debitor = cx
                    .budgets
                    .acquire_debitor(self.reply_budget_id, self.reply_id, flusher);

                if self.debitor.is_none() {
                    warn!(
                        stream_id = self.reply_id,
                        budget_id = self.reply_budget_id,
                        "No debitor available for fetch member"
                    );
                    self.cleanup(cx, None);
                    return false;
                }
            }
        }

        self.drain(fan, cx);
        true
    }

    /// A FLUSH from the consumer replaces its filters.
    pub fn on_initial_flush(&mut self, flush: &FetchFlushEx, fan: &FanView<'_>, cx: &mut StreamContext<'_>) {
        let condition = FilterCondition::from_filters(&flush.filters, flush.evaluation);
        self.pending_cursor = Some(Cursor::new(condition, self.delta_type));
        if self.message_offset == 0 {
            self.adopt_pending_cursor();
        }

        self.drain(fan, cx);
    }

    pub fn on_initial_end(&mut self, cx: &mut StreamContext<'_>) {
        self.state.initial_closed();
        self.do_reply_end_if_necessary(cx);
        self.release(cx);
    }

    pub fn on_initial_abort(&mut self, cx: &mut StreamContext<'_>) {
        self.state.initial_closed();
        self.do_reply_abort_if_necessary(cx);
        self.release(cx);
    }

    pub fn on_reply_reset(&mut self, cx: &mut StreamContext<'_>) {
        self.state.reply_closed();
        self.do_initial_reset_if_necessary(cx, None);
        self.release(cx);
    }

    pub fn do_reply_end_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.reply_active() {
            self.state.reply_closed();
            cx.out.end(self.reply_header());
        }
    }

    pub fn do_reply_abort_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.reply_active() {
            self.state.reply_closed();
            cx.out.abort(self.reply_header());
        }
    }

    pub fn do_initial_reset_if_necessary(&mut self, cx: &mut StreamContext<'_>, error: Option<i16>) {
        if self.state.initial_active() {
            self.state.initial_closed();
            cx.out.reset(self.initial_header(), error);
        }
        self.state.initial_closed();
    }

    /// Close both halves, reporting `error` on the initial one.
    pub fn cleanup(&mut self, cx: &mut StreamContext<'_>, error: Option<i16>) {
        self.do_initial_reset_if_necessary(cx, error);
        self.do_reply_abort_if_necessary(cx);
        self.release(cx);
    }

    fn release(&mut self, cx: &mut StreamContext<'_>) {
        if let Some(debitor) = self.debitor.take() {
            cx.budgets.release_debitor(debitor, self.reply_id);
        }
        self.cursor.close();
        self.pending_cursor = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn isolated_ceiling(&self, fan: &FanView<'_>) -> i64 {
        match self.isolation {
            Isolation::ReadCommitted => fan.stable_offset,
            Isolation::ReadUncommitted => fan.latest_offset,
        }
    }

    /// Swap in a replacement cursor at the current position.
    fn adopt_pending_cursor(&mut self) {
        debug_assert_eq!(self.message_offset, 0, "cursor replaced mid-message");
        if let Some(mut next) = self.pending_cursor.take() {
            next.init(self.cursor.segment(), self.cursor.offset(), self.cursor.latest());
            self.cursor = next;
        }
    }

    pub fn drain(&mut self, fan: &FanView<'_>, cx: &mut StreamContext<'_>) {
        let ceiling = self.isolated_ceiling(fan);
        let mut exhausted = false;

        while self.state.is_reply_opened()
            && !self.state.is_reply_closing()
            && self.reply_window() >= i64::from(self.reply_pad)
            && self.cursor.offset() <= fan.partition_offset
        {
            if self.message_offset == 0 {
                self.adopt_pending_cursor();
            }

            let partition = fan.partition;
            let entry = match self.cursor.next(partition) {
                Some(entry) if entry.offset <= fan.latest_offset => entry,
                _ => {
                    if self.bounded && !self.cursor.is_blocked(partition) {
                        self.cursor
                            .advance(self.cursor.offset().max(fan.partition_offset + 1));
                    }
                    exhausted = true;
                    break;
                }
            };

            if self.message_offset == 0 {
                if entry.offset > ceiling {
                    exhausted = true;
                    break;
                }

                if entry.descendant != -1
                    && entry.descendant <= self.initial_group_partition_offset
                    && partition.cleanup_policy().compact()
                {
                    self.cursor.advance(entry.offset + 1);
                    continue;
                }

                if entry.is_control() {
                    if self.isolation == Isolation::ReadUncommitted
                        && !self.do_reply_flush_transaction(entry, fan, cx)
                    {
                        break;
                    }
                    self.cursor.advance(entry.offset + 1);
                    continue;
                }

                if entry.is_aborted() && self.isolation == Isolation::ReadCommitted {
                    self.cursor.advance(entry.offset + 1);
                    continue;
                }
            }

            if !self.do_reply_data(entry, fan, cx) {
                break;
            }

            if self.bounded && self.cursor.offset() > self.initial_group_latest_offset {
                break;
            }
        }

        if self.bounded && self.cursor.offset() > self.initial_group_latest_offset {
            self.do_reply_end_if_necessary(cx);
            return;
        }

        if exhausted && ceiling > self.flushed_offset && self.state.reply_active() {
            self.do_reply_flush_progress(ceiling, fan, cx);
        }
    }

    fn reserve_flush(&mut self, cx: &mut StreamContext<'_>) -> bool {
        if self.reply_window() < i64::from(SIZE_OF_FLUSH_WITH_EXTENSION) {
            return false;
        }
        match self.debitor {
            Some(debitor) => {
                let size = i64::from(SIZE_OF_FLUSH_WITH_EXTENSION);
                cx.budgets.claim(debitor, self.reply_id, size, size, 0) == size
            }
            None => true,
        }
    }

    fn do_reply_flush(&mut self, extension: FetchFlushEx, cx: &mut StreamContext<'_>) {
        cx.out.flush(
            self.reply_header(),
            self.reply_budget_id,
            SIZE_OF_FLUSH_WITH_EXTENSION,
            Some(FlushEx::Fetch(extension)),
        );
        self.reply_seq += i64::from(SIZE_OF_FLUSH_WITH_EXTENSION);
    }

    /// Tell an uncommitted reader where a transaction ended.
    fn do_reply_flush_transaction(&mut self, entry: &Entry, fan: &FanView<'_>, cx: &mut StreamContext<'_>) -> bool {
        if !self.reserve_flush(cx) {
            return false;
        }
        let result = if entry.is_aborted() {
            TransactionResult::Abort
        } else {
            TransactionResult::Commit
        };
        self.do_reply_flush(
            FetchFlushEx {
                partition: fan.progress(entry.offset),
                transaction: Some(Transaction {
                    result,
                    producer_id: entry.owner_id,
                }),
                filters: Vec::new(),
                evaluation: Default::default(),
            },
            cx,
        );
        self.flushed_offset = self.flushed_offset.max(entry.offset);
        true
    }

    fn do_reply_flush_progress(&mut self, ceiling: i64, fan: &FanView<'_>, cx: &mut StreamContext<'_>) {
        if !self.reserve_flush(cx) {
            return;
        }
        self.do_reply_flush(
            FetchFlushEx {
                partition: fan.progress(ceiling),
                transaction: None,
                filters: Vec::new(),
                evaluation: Default::default(),
            },
            cx,
        );
        self.flushed_offset = ceiling;
    }

    /// Send the next fragment of `entry`; false if the window or budget is too small.
    fn do_reply_data(&mut self, entry: &Entry, fan: &FanView<'_>, cx: &mut StreamContext<'_>) -> bool {
        let value = entry.value();
        let remaining = value.map_or(0, |value| value.len() as i32 - self.message_offset);
        debug_assert!(remaining >= 0);

        let length_min = remaining.min(FRAGMENT_LENGTH_MIN);
        let reply_budget = self.reply_window().max(0).min(i64::from(i32::MAX)) as i32;
        let reserved_max = (remaining + self.reply_pad).min(reply_budget).max(self.reply_min);
        let reserved_min = (length_min + self.reply_pad).min(reserved_max).max(self.reply_min);

        if reply_budget < reserved_min
            || !(reserved_min > self.reply_pad || reserved_min == self.reply_pad && remaining == 0)
        {
            return false;
        }

        let mut reserved = reserved_max;
        if let Some(debitor) = self.debitor {
            let length_max = (reserved_max - self.reply_pad).min(remaining);
            let deferred_max = remaining - length_max;
            reserved = cx.budgets.claim(
                debitor,
                self.reply_id,
                i64::from(reserved_min),
                i64::from(reserved_max),
                i64::from(deferred_max),
            ) as i32;
        }

        if reserved < self.reply_pad || reserved == self.reply_pad && value.is_some() && remaining > 0 {
            return false;
        }

        let length = (reserved - self.reply_pad).min(remaining);
        let deferred = remaining - length;

        let mut frame_flags = 0;
        if self.message_offset == 0 {
            frame_flags |= flags::INIT;
        }
        if length == remaining {
            frame_flags |= flags::FIN;
        }
        if entry.is_aborted() {
            frame_flags |= flags::SKIP;
        }

        let payload = value.map(|value| {
            let start = self.message_offset as usize;
            Bytes::copy_from_slice(&value[start..start + length as usize])
        });

        let extension = if frame_flags & flags::INIT != 0 {
            Some(DataEx::Fetch(FetchDataEx {
                deferred,
                timestamp: entry.timestamp,
                producer_id: entry.owner_id,
                headers_size_max: headers_size(&entry.headers) as i32,
                filters: self.cursor.filters(),
                partition: fan.progress(entry.offset),
                key: entry.key.clone(),
                headers: entry.headers.clone(),
                delta_type: DeltaType::None,
                ancestor_offset: -1,
            }))
        } else if frame_flags & flags::FIN != 0 {
            Some(DataEx::Fetch(FetchDataEx {
                deferred: 0,
                timestamp: entry.timestamp,
                producer_id: entry.owner_id,
                headers_size_max: 0,
                filters: self.cursor.filters(),
                partition: fan.progress(entry.offset),
                key: None,
                headers: Vec::new(),
                delta_type: DeltaType::None,
                ancestor_offset: -1,
            }))
        } else {
            None
        };

        cx.out.data(
            self.reply_header(),
            frame_flags,
            self.reply_budget_id,
            reserved,
            payload,
            extension,
        );
        self.reply_seq += i64::from(reserved);
        debug_assert!(self.reply_ack <= self.reply_seq);

        let topic = fan.partition.topic();
        FETCH_FRAGMENTS_TOTAL.with_label_values(&[topic]).inc();
        FETCH_BYTES_TOTAL.with_label_values(&[topic]).inc_by(length as u64);

        if frame_flags & flags::FIN != 0 {
            self.message_offset = 0;
            self.cursor.advance(entry.offset + 1);
            self.flushed_offset = self.flushed_offset.max(entry.offset);
        } else {
            self.message_offset += length;
        }
        true
    }

    /// Signals addressed to this member.
    pub fn on_signal(&mut self, signal_id: i32, fan: &FanView<'_>, cx: &mut StreamContext<'_>) {
        if signal_id == SIGNAL_BUDGET_FLUSH {
            self.drain(fan, cx);
        }
    }
}
