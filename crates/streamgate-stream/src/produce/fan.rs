//! Produce fan-out: members write into one cached partition, one upstream
//! produce stream carries it to the broker.
//!
//! Entries get consecutive offsets in write order. The fan-out tells the
//! upstream how far the partition is ready with a FLUSH carrying the
//! *offset high-watermark*, the last offset before the first entry that is
//! neither completed nor abandoned:
//!
//! ```text
//!   offset     0     1     2     3
//!   flags      C     C     -     C        C = completed
//!   watermark              ▲ 1
//! ```
//!
//! Upstream acks arrive as FLUSH frames and are handed to the owning
//! members strictly in offset order.

use bytes::Bytes;
use streamgate_cache::{
    compute_hash, entry_flags, AncestorLookup, Cursor, FilterCondition, Partition, ProduceEntryStart,
    SegmentRef,
};
use streamgate_core::frame::{
    value_length, BeginEx, Data, DataEx, Flush, FlushEx, Frame, FrameHeader, ProduceBeginEx,
    ProduceFlushEx, Window, SIZE_OF_FLUSH_WITH_EXTENSION,
};
use streamgate_core::offset::{
    AckMode, DeltaType, OffsetType, PartitionProgress, DEFAULT_LATEST_OFFSET, PRODUCE_FLUSH_SEQUENCE,
};
use streamgate_core::record::headers_size;
use streamgate_core::stream_id::reply_id;
use streamgate_core::{ErrorCode, StreamState};
use streamgate_observability::metrics::{
    FANOUTS_OPEN, MEMBERS_ATTACHED, PRODUCE_ACKS_TOTAL, PRODUCE_ERRORS_TOTAL, PRODUCE_RECORDS_TOTAL,
    SEGMENTS_REMOVED_TOTAL, UPSTREAM_RECONNECTS_TOTAL,
};
use tracing::{debug, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::budget::CreditorIndex;
use crate::context::StreamContext;
use crate::error::StreamError;
use crate::produce::member::{ProduceMember, WindowGrant};
use crate::signaler::{cancel_timer, TimerHandle};

pub const SIGNAL_SEGMENT_COMPACT: i32 = 1;
pub const SIGNAL_GROUP_CLEANUP: i32 = 2;
pub const SIGNAL_RECONNECT: i32 = 3;

const DIRECTION: &str = "produce";

#[derive(Debug, Clone, Copy)]
pub struct ProduceFanOptions {
    pub reconnect_delay_secs: u64,
    pub cleanup_delay_secs: u64,
    pub window_bytes: i32,
}

pub struct ProduceFan {
    address: u64,
    origin_id: u64,
    routed_id: u64,
    authorization: i64,
    partition: Box<dyn Partition>,
    /// Scans written entries for the offset high-watermark
    cursor: Cursor,
    backoff: ReconnectBackoff,
    cleanup_delay_ms: i64,
    window_bytes: i32,

    leader_id: i64,
    initial_id: u64,
    reply_id: u64,
    state: StreamState,
    upstream_open: bool,

    initial_seq: i64,
    initial_ack: i64,
    initial_max: i32,
    initial_pad: i32,
    reply_seq: i64,
    reply_ack: i64,
    reply_max: i32,

    creditor: Option<CreditorIndex>,
    /// Offset assigned to the next entry
    partition_offset: i64,
    offset_high_watermark: i64,
    /// Next offset waiting for an upstream ack
    last_ack_offset: i64,

    compact_at: i64,
    compact_timer: Option<TimerHandle>,
    cleanup_timer: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,

    members: Vec<ProduceMember>,
    detached: Vec<u64>,
}

impl ProduceFan {
    pub fn new(
        address: u64,
        origin_id: u64,
        routed_id: u64,
        leader_id: i64,
        mut partition: Box<dyn Partition>,
        options: ProduceFanOptions,
        now: i64,
    ) -> Self {
        let start = partition.next_offset(OffsetType::Live).max(0);
        let head = partition.new_head_if_necessary(start, None, 0, 0, now);
        let mut cursor = Cursor::new(FilterCondition::None, DeltaType::None);
        cursor.init(head, start, 0);

        Self {
            address,
            origin_id,
            routed_id,
            authorization: 0,
            partition,
            cursor,
            backoff: ReconnectBackoff::from_secs(options.reconnect_delay_secs),
            cleanup_delay_ms: (options.cleanup_delay_secs as i64).saturating_mul(1000),
            window_bytes: options.window_bytes,
            leader_id,
            initial_id: 0,
            reply_id: 0,
            state: StreamState::default(),
            upstream_open: false,
            initial_seq: 0,
            initial_ack: 0,
            initial_max: 0,
            initial_pad: 0,
            reply_seq: 0,
            reply_ack: 0,
            reply_max: 0,
            creditor: None,
            partition_offset: start,
            offset_high_watermark: DEFAULT_LATEST_OFFSET,
            last_ack_offset: start,
            compact_at: i64::MAX,
            compact_timer: None,
            cleanup_timer: None,
            reconnect_timer: None,
            members: Vec::new(),
            detached: Vec::new(),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn leader_id(&self) -> i64 {
        self.leader_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn upstream_ids(&self) -> Option<(u64, u64)> {
        (self.initial_id != 0).then_some((self.initial_id, self.reply_id))
    }

    pub fn offset_high_watermark(&self) -> i64 {
        self.offset_high_watermark
    }

    pub fn partition_offset(&self) -> i64 {
        self.partition_offset
    }

    pub fn partition(&self) -> &dyn Partition {
        self.partition.as_ref()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_member(&self, initial_id: u64) -> bool {
        self.members.iter().any(|m| m.initial_id() == initial_id)
    }

    pub fn take_detached(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.detached)
    }

    fn topic(&self) -> &str {
        self.partition.topic()
    }

    /// Shared budget of this fan-out, keyed by its signal address.
    pub fn budget_id(&self) -> u64 {
        self.address
    }

    fn grant(&self) -> WindowGrant {
        WindowGrant {
            window_bytes: self.window_bytes,
            budget_id: if self.creditor.is_some() { self.budget_id() } else { 0 },
            padding: self.initial_pad,
        }
    }

    fn initial_header(&self) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, self.initial_id)
            .window(self.initial_seq, self.initial_ack, self.initial_max)
            .authorization(self.authorization)
    }

    fn reply_header(&self) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, self.reply_id)
            .window(self.reply_seq, self.reply_ack, self.reply_max)
            .authorization(self.authorization)
    }

    pub fn settle(&mut self) {
        let open = self.state.is_initial_opening() && !self.state.is_closed();
        if open != self.upstream_open {
            self.upstream_open = open;
            let gauge = FANOUTS_OPEN.with_label_values(&[DIRECTION]);
            if open {
                gauge.inc();
            } else {
                gauge.dec();
            }
        }
    }

    // ---- membership ----

    pub fn attach(&mut self, mut member: ProduceMember, cx: &mut StreamContext<'_>) {
        cancel_timer(cx.signaler, &mut self.cleanup_timer);

        if member.leader_id() != self.leader_id {
            debug!(
                topic = self.topic(),
                partition = self.partition.id(),
                from = self.leader_id,
                to = member.leader_id(),
                "Produce leader changed"
            );
            self.leader_id = member.leader_id();
        }

        member.on_initial_begin();
        self.members.push(member);
        MEMBERS_ATTACHED
            .with_label_values(&[DIRECTION, self.partition.topic()])
            .inc();

        self.do_initial_begin_if_necessary(cx);

        let grant = self.grant();
        let initial_opened = self.state.is_initial_opened();
        let reply_opened = self.state.is_reply_opened();
        let topic = self.partition.topic().to_string();
        let partition_id = self.partition.id();
        let watermark = self.offset_high_watermark;
        if let Some(member) = self.members.last_mut() {
            if initial_opened {
                member.do_initial_window(0, grant.window_bytes, grant, cx);
            }
            if reply_opened {
                member.do_reply_begin_if_necessary(&topic, partition_id, watermark, cx);
            }
        }
    }

    fn member_closed(&mut self, index: usize, cx: &mut StreamContext<'_>) {
        let member = self.members.remove(index);
        self.detached.push(member.initial_id());
        MEMBERS_ATTACHED
            .with_label_values(&[DIRECTION, self.partition.topic()])
            .dec();

        self.mark_entries_dirty(&member, cx);
        self.flush_initial_if_necessary(cx);

        if self.members.is_empty() {
            self.schedule_cleanup(cx);
        }
    }

    /// Tear down an empty fan now, or after the configured cleanup delay.
    fn schedule_cleanup(&mut self, cx: &mut StreamContext<'_>) {
        if self.cleanup_delay_ms == 0 {
            self.do_initial_abort_if_necessary(cx);
            self.do_reply_reset_if_necessary(cx);
        } else {
            cancel_timer(cx.signaler, &mut self.cleanup_timer);
            let deadline = cx.now_millis() + self.cleanup_delay_ms;
            self.cleanup_timer = cx.signaler.signal_at(deadline, self.address, SIGNAL_GROUP_CLEANUP);
        }
    }

    fn position(&self, initial_id: u64) -> Option<usize> {
        self.members.iter().position(|m| m.initial_id() == initial_id)
    }

    pub fn on_member_frame(&mut self, initial_id: u64, frame: &Frame, cx: &mut StreamContext<'_>) {
        let Some(index) = self.position(initial_id) else {
            debug!(stream_id = frame.stream_id(), "Frame for detached produce member");
            return;
        };

        match frame {
            Frame::Data(data) => self.on_member_data(index, data, cx),
            Frame::Flush(flush) => self.on_member_flush(index, flush, cx),
            Frame::End(_) => {
                if self.members[index].on_initial_end(cx) {
                    self.member_closed(index, cx);
                }
            }
            Frame::Abort(_) => {
                self.members[index].on_initial_abort(cx);
                self.member_closed(index, cx);
            }
            Frame::Window(window) => {
                self.members[index].on_reply_window(window.header.maximum, window.header.acknowledge);
            }
            Frame::Reset(_) => {
                if self.members[index].on_reply_reset(cx) {
                    self.member_closed(index, cx);
                }
            }
            other => warn!(
                stream_id = other.stream_id(),
                kind = ?other.kind(),
                "Unexpected frame from produce member"
            ),
        }
    }

    fn on_member_data(&mut self, index: usize, data: &Data, cx: &mut StreamContext<'_>) {
        if !self.members[index].on_initial_data(data, cx) {
            self.member_closed(index, cx);
            return;
        }

        let result = self.write(index, data, cx);

        if data.is_incomplete() {
            let offset = self.members[index].partition_offset();
            self.mark_entry_dirty(offset, cx);
            self.flush_initial_if_necessary(cx);
        }

        match result {
            Ok(()) => {
                let grant = self.grant();
                self.members[index].after_data(data.is_incomplete(), grant, cx);
            }
            Err(error) => self.reject_member(index, error, cx),
        }

        self.credit(data.reserved, cx);
    }

    fn on_member_flush(&mut self, index: usize, flush: &Flush, cx: &mut StreamContext<'_>) {
        if !self.members[index].on_initial_flush(flush, cx) {
            self.member_closed(index, cx);
            return;
        }

        if flush.reserved > 0 {
            match self.write_flush_entry(index, cx) {
                Ok(offset) => {
                    self.mark_entry_dirty(offset, cx);
                    let grant = self.grant();
                    let member = &mut self.members[index];
                    let no_ack = member.initial_seq() - member.initial_ack();
                    member.do_initial_window(no_ack, grant.window_bytes, grant, cx);
                }
                Err(error) => self.reject_member(index, error, cx),
            }
            self.credit(flush.reserved, cx);
        }
    }

    fn reject_member(&mut self, index: usize, error: ErrorCode, cx: &mut StreamContext<'_>) {
        let code = error.as_i16();
        PRODUCE_ERRORS_TOTAL
            .with_label_values(&[self.partition.topic(), &code.to_string()])
            .inc();
        warn!(
            topic = self.topic(),
            partition = self.partition.id(),
            stream_id = self.members[index].initial_id(),
            error = ?error,
            "Rejected produced record"
        );
        self.members[index].cleanup(cx, Some(code));
        self.member_closed(index, cx);
    }

    /// Return the member's reserved bytes to the shared budget once cached.
    fn credit(&mut self, reserved: i32, cx: &mut StreamContext<'_>) {
        if let Some(creditor) = self.creditor {
            if reserved > 0 {
                cx.budgets.credit(creditor, i64::from(reserved));
            }
        }
    }

    /// Write one DATA fragment of a member into the cache.
    fn write(&mut self, index: usize, data: &Data, cx: &mut StreamContext<'_>) -> Result<(), ErrorCode> {
        let now = cx.now_millis();
        let extension = match &data.extension {
            Some(DataEx::Produce(extension)) => Some(extension),
            _ => None,
        };

        if data.is_init() {
            let extension = extension.ok_or(ErrorCode::CorruptMessage)?;
            if !data.is_fin() && extension.deferred == 0 {
                return Err(ErrorCode::CorruptMessage);
            }

            let trailers_size_max = self.partition.config().trailers_size_max;
            let headers_size_max = headers_size(&extension.headers) as i32 + trailers_size_max;
            let value_len = match &data.payload {
                Some(payload) => {
                    value_length(payload.len(), extension.deferred).ok_or(ErrorCode::CorruptMessage)?
                }
                None => -1,
            };
            if i64::from(value_len) + i64::from(headers_size_max) > self.partition.config().segment_bytes {
                return Err(ErrorCode::RecordListTooLarge);
            }

            let offset = self.partition_offset;
            let key = extension.key.as_ref();
            let segment = self
                .partition
                .new_head_if_necessary(offset, key, value_len, headers_size_max, now)
                .ok_or(ErrorCode::RecordListTooLarge)?;

            let key_hash = compute_hash(key);
            if key.is_some() && self.partition.cleanup_policy().compact() {
                self.find_and_mark_ancestor(segment, key, key_hash, offset, cx);
            }

            let start = ProduceEntryStart {
                offset,
                timestamp: extension.timestamp,
                owner_id: self.members[index].initial_id() as i64,
                sequence: extension.sequence,
                ack_mode: extension.ack_mode,
                key: extension.key.clone(),
                key_hash,
                value_len,
                headers: extension.headers.clone(),
                trailers_size_max,
                payload: data.payload.clone(),
            };
            self.partition
                .write_produce_entry_start(segment, start)
                .map_err(|e| {
                    debug!(offset, error = %StreamError::from(e), "Invalid produced record");
                    ErrorCode::InvalidRecord
                })?;

            self.members[index].entry_started(segment, offset);
            self.partition_offset += 1;
            PRODUCE_RECORDS_TOTAL
                .with_label_values(&[self.partition.topic()])
                .inc();
        } else if let Some(payload) = data.payload.as_ref().filter(|payload| !payload.is_empty()) {
            let member = &self.members[index];
            let segment = member.segment().ok_or(ErrorCode::CorruptMessage)?;
            self.partition
                .write_produce_entry_continue(segment, member.partition_offset(), payload)
                .map_err(|_| ErrorCode::InvalidRecord)?;
        }

        if data.is_fin() {
            let member = &self.members[index];
            let segment = member.segment().ok_or(ErrorCode::CorruptMessage)?;
            let trailers = match (data.is_init(), extension) {
                (false, Some(extension)) => extension.headers.clone(),
                _ => Vec::new(),
            };
            self.partition
                .write_produce_entry_fin(segment, member.partition_offset(), member.initial_seq(), trailers)
                .map_err(|_| ErrorCode::InvalidRecord)?;
            self.flush_initial_if_necessary(cx);
        }

        Ok(())
    }

    fn write_flush_entry(&mut self, index: usize, cx: &mut StreamContext<'_>) -> Result<i64, ErrorCode> {
        let now = cx.now_millis();
        let offset = self.partition_offset;
        let segment = self
            .partition
            .new_head_if_necessary(offset, None, 0, 0, now)
            .ok_or(ErrorCode::RecordListTooLarge)?;

        let start = ProduceEntryStart {
            offset,
            timestamp: now,
            owner_id: self.members[index].initial_id() as i64,
            sequence: PRODUCE_FLUSH_SEQUENCE,
            ack_mode: AckMode::LeaderOnly,
            key: None,
            key_hash: compute_hash(None),
            value_len: 0,
            headers: Vec::new(),
            trailers_size_max: self.partition.config().trailers_size_max,
            payload: None,
        };
        let acknowledge = self.members[index].initial_seq();
        self.partition
            .write_produce_entry_start(segment, start)
            .map_err(|_| ErrorCode::InvalidRecord)?;
        self.partition
            .write_produce_entry_fin(segment, offset, acknowledge, Vec::new())
            .map_err(|_| ErrorCode::InvalidRecord)?;

        self.members[index].entry_started(segment, offset);
        self.partition_offset += 1;
        self.flush_initial_if_necessary(cx);
        Ok(offset)
    }

    fn find_and_mark_ancestor(
        &mut self,
        head: SegmentRef,
        key: Option<&Bytes>,
        key_hash: u32,
        descendant: i64,
        cx: &mut StreamContext<'_>,
    ) {
        let now = cx.now_millis();
        let mut segment = Some(head);
        while let Some(current) = segment {
            if let AncestorLookup::Found(_) =
                self.partition
                    .find_and_mark_ancestor(current, key, key_hash, descendant, now)
            {
                self.schedule_compact(current, cx);
                return;
            }
            segment = self.partition.previous_segment(current);
        }
    }

    // ---- offset high-watermark ----

    fn flush_initial_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        let previous = self.offset_high_watermark;

        loop {
            let next = self
                .cursor
                .next(self.partition.as_ref())
                .map(|entry| (entry.offset, entry.has_flags(entry_flags::ADVANCE)));
            match next {
                Some((offset, true)) => self.cursor.advance(offset + 1),
                _ => break,
            }
        }

        self.offset_high_watermark = self.cursor.offset() - 1;
        if self.offset_high_watermark > previous {
            self.do_flush_initial_if_necessary(cx);
        }
    }

    fn do_flush_initial_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        let available = i64::from(self.initial_max) - (self.initial_seq - self.initial_ack);
        if self.state.is_initial_opened()
            && !self.state.is_initial_closed()
            && self.offset_high_watermark >= 0
            && available >= i64::from(SIZE_OF_FLUSH_WITH_EXTENSION)
        {
            let extension = ProduceFlushEx {
                partition: PartitionProgress::new(self.partition.id(), self.offset_high_watermark),
                key: None,
                error: 0,
            };
            cx.out.flush(
                self.initial_header(),
                0,
                SIZE_OF_FLUSH_WITH_EXTENSION,
                Some(FlushEx::Produce(extension)),
            );
            self.initial_seq += i64::from(SIZE_OF_FLUSH_WITH_EXTENSION);
        }
    }

    // ---- acknowledgment ----

    /// Hand acks up to `partition_offset` to their members, one offset at a time.
    fn ack_offset_high_watermark(&mut self, error: i16, partition_offset: i64, cx: &mut StreamContext<'_>) {
        let grant = self.grant();
        let partition_id = self.partition.id();

        while self.last_ack_offset <= partition_offset {
            let offset = self.last_ack_offset;
            self.last_ack_offset += 1;

            let Some((owner_id, acknowledge, key)) = self.mark_entry_dirty(offset, cx) else {
                continue;
            };
            let Some(index) = self.position(owner_id as u64) else {
                continue;
            };

            if error != 0 {
                PRODUCE_ERRORS_TOTAL
                    .with_label_values(&[self.partition.topic(), &error.to_string()])
                    .inc();
                self.members[index].on_message_error(offset, error, cx);
                self.member_closed(index, cx);
            } else {
                PRODUCE_ACKS_TOTAL
                    .with_label_values(&[self.partition.topic()])
                    .inc();
                let done = self.members[index]
                    .on_message_ack(offset, acknowledge, key, partition_id, grant, cx);
                if done {
                    self.member_closed(index, cx);
                }
            }
        }
    }

    /// Mark the entry at `offset` dirty; returns its owner, acknowledge and key.
    fn mark_entry_dirty(&mut self, offset: i64, cx: &mut StreamContext<'_>) -> Option<(i64, i64, Option<Bytes>)> {
        let now = cx.now_millis();
        let segment = self.partition.seek_not_after(offset)?;
        let marked = self
            .partition
            .find_and_mark_dirty(segment, offset, now)
            .map(|entry| (entry.owner_id, entry.acknowledge, entry.key.clone()));
        self.schedule_compact(segment, cx);
        marked
    }

    fn mark_entries_dirty(&mut self, member: &ProduceMember, cx: &mut StreamContext<'_>) {
        let owner_id = member.initial_id() as i64;
        let last = member.partition_offset();
        let mut offset = member.acked_offset() + 1;

        while offset <= last {
            let Some((next, owner)) = self
                .partition
                .next_entry(offset)
                .map(|entry| (entry.offset, entry.owner_id))
            else {
                break;
            };
            if next > last {
                break;
            }
            if owner == owner_id {
                self.mark_entry_dirty(next, cx);
            }
            offset = next + 1;
        }
    }

    fn schedule_compact(&mut self, segment: SegmentRef, cx: &mut StreamContext<'_>) {
        let compact_at = self.partition.compact_at(segment, cx.now_millis());
        if compact_at == i64::MAX {
            return;
        }
        if self.compact_timer.is_some() && compact_at < self.compact_at {
            cancel_timer(cx.signaler, &mut self.compact_timer);
        }
        if self.compact_timer.is_none() {
            self.compact_at = compact_at;
            self.compact_timer = cx.signaler.signal_at(compact_at, self.address, SIGNAL_SEGMENT_COMPACT);
        }
    }

    // ---- upstream lifecycle ----

    fn do_initial_begin_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.is_closed() {
            self.state = StreamState::default();
            self.initial_seq = 0;
            self.initial_ack = 0;
            self.initial_max = 0;
            self.initial_pad = 0;
            self.reply_seq = 0;
            self.reply_ack = 0;
            self.reply_max = 0;
        }

        if !self.state.is_initial_opening() {
            self.do_initial_begin(cx);
        }
    }

    fn do_initial_begin(&mut self, cx: &mut StreamContext<'_>) {
        if self.creditor.is_none() {
            self.creditor = cx.budgets.acquire_creditor(self.budget_id());
            if self.creditor.is_none() {
                let error = StreamError::BudgetExhausted(self.budget_id());
                warn!(topic = self.topic(), partition = self.partition.id(), error = %error, "Produce fan-out cannot open");
                for mut member in self.members.drain(..) {
                    member.cleanup(cx, Some(ErrorCode::UnknownServerError.as_i16()));
                    self.detached.push(member.initial_id());
                    MEMBERS_ATTACHED
                        .with_label_values(&[DIRECTION, self.partition.topic()])
                        .dec();
                }
                return;
            }
        }

        self.initial_id = cx.ids.supply_initial_id();
        self.reply_id = reply_id(self.initial_id);

        debug!(
            topic = self.topic(),
            partition = self.partition.id(),
            stream_id = self.initial_id,
            leader = self.leader_id,
            "Produce fan-out connecting"
        );

        let extension = ProduceBeginEx {
            transaction: None,
            topic: self.topic().to_string(),
            partition: PartitionProgress::new(self.partition.id(), DEFAULT_LATEST_OFFSET),
        };
        cx.out.begin(
            self.initial_header(),
            self.leader_id,
            Some(BeginEx::Produce(extension)),
        );
        self.state.initial_opening();
    }

    fn on_initial_closed(&mut self, cx: &mut StreamContext<'_>) {
        self.state.initial_closed();
        if let Some(creditor) = self.creditor.take() {
            let unused = i64::from(self.initial_max) - (self.initial_seq - self.initial_ack);
            cx.budgets.release_creditor(creditor, unused.max(0));
        }
        self.initial_seq = 0;
        self.initial_ack = 0;
        self.initial_max = 0;
        self.initial_pad = 0;
    }

    fn do_initial_abort_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.initial_active() {
            cx.out.abort(self.initial_header());
        }
        self.on_initial_closed(cx);
    }

    fn do_reply_reset_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if !self.state.is_reply_closed() && self.initial_id != 0 {
            cx.out.reset(self.reply_header(), None);
        }
        self.state.reply_closed();
    }

    fn do_reply_window(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.is_reply_closed() {
            return;
        }
        self.reply_ack = self.reply_seq;
        self.reply_max = self.window_bytes;
        self.state.reply_opened();
        cx.out.window(self.reply_header(), 0, 0, 0);
    }

    fn schedule_reconnect(&mut self, cx: &mut StreamContext<'_>) {
        cancel_timer(cx.signaler, &mut self.reconnect_timer);
        let delay = self.backoff.next_delay();
        let deadline = cx.now_millis() + delay.as_millis() as i64;

        info!(
            topic = self.topic(),
            partition = self.partition.id(),
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Produce fan-out reconnecting"
        );
        UPSTREAM_RECONNECTS_TOTAL
            .with_label_values(&[DIRECTION, self.partition.topic()])
            .inc();

        self.reconnect_timer = cx.signaler.signal_at(deadline, self.address, SIGNAL_RECONNECT);
    }

    pub fn on_upstream_frame(&mut self, frame: &Frame, cx: &mut StreamContext<'_>) {
        let stream_id = frame.stream_id();
        if self.initial_id == 0 || (stream_id != self.initial_id && stream_id != self.reply_id) {
            debug!(stream_id, "Frame for stale produce upstream");
            return;
        }

        match frame {
            Frame::Begin(_) => self.on_reply_begin(cx),
            Frame::Flush(flush) => self.on_reply_flush(flush, cx),
            Frame::End(_) => self.on_reply_closed(false, cx),
            Frame::Abort(_) => self.on_reply_closed(true, cx),
            Frame::Reset(reset) => {
                let error = reset.error().unwrap_or(ErrorCode::UnknownServerError.as_i16());
                self.on_initial_reset(error, cx);
            }
            Frame::Window(window) => self.on_initial_window(window, cx),
            Frame::Data(_) | Frame::Signal(_) => {}
        }
    }

    fn on_reply_begin(&mut self, cx: &mut StreamContext<'_>) {
        self.state.reply_opened();

        let topic = self.partition.topic().to_string();
        let partition_id = self.partition.id();
        let watermark = self.offset_high_watermark;
        for member in self.members.iter_mut() {
            member.do_reply_begin_if_necessary(&topic, partition_id, watermark, cx);
        }

        self.do_reply_window(cx);
    }

    fn on_reply_flush(&mut self, flush: &Flush, cx: &mut StreamContext<'_>) {
        self.reply_seq = self.reply_seq.max(flush.header.sequence) + i64::from(flush.reserved);

        let Some(FlushEx::Produce(extension)) = &flush.extension else {
            return;
        };

        let previous = self.last_ack_offset;
        self.ack_offset_high_watermark(extension.error, extension.partition.partition_offset, cx);
        if self.last_ack_offset > previous {
            self.do_reply_window(cx);
        }
    }

    fn on_reply_closed(&mut self, aborted: bool, cx: &mut StreamContext<'_>) {
        self.state.reply_closed();
        self.do_initial_abort_if_necessary(cx);

        debug!(topic = self.topic(), partition = self.partition.id(), aborted, "Produce fan-out disconnected");

        // no ack can arrive for entries still in flight
        let last = self.partition_offset - 1;
        self.ack_offset_high_watermark(ErrorCode::UnknownServerError.as_i16(), last, cx);

        let drained = !self.members.is_empty();
        for mut member in self.members.drain(..) {
            if aborted {
                member.do_reply_abort_if_necessary(cx);
            } else {
                member.do_reply_end_if_necessary(cx);
            }
            member.do_initial_reset_if_necessary(cx, None);
            self.detached.push(member.initial_id());
            MEMBERS_ATTACHED
                .with_label_values(&[DIRECTION, self.partition.topic()])
                .dec();
        }
        if drained {
            self.schedule_cleanup(cx);
        }
    }

    fn on_initial_reset(&mut self, error: i16, cx: &mut StreamContext<'_>) {
        self.state.initial_closed();
        self.do_reply_reset_if_necessary(cx);

        let not_leader = error == ErrorCode::NotLeaderOrFollower.as_i16();
        if self.backoff.is_enabled() && !self.members.is_empty() && not_leader {
            self.on_initial_closed(cx);
            self.schedule_reconnect(cx);
            return;
        }

        warn!(topic = self.topic(), partition = self.partition.id(), error, "Produce fan-out reset");
        for member in self.members.iter_mut() {
            member.do_initial_reset_if_necessary(cx, Some(error));
        }
        self.on_initial_closed(cx);

        // outstanding entries fail with the upstream error
        let last = self.partition_offset - 1;
        self.ack_offset_high_watermark(error, last, cx);

        let drained = !self.members.is_empty();
        for mut member in self.members.drain(..) {
            member.do_reply_abort_if_necessary(cx);
            self.detached.push(member.initial_id());
            MEMBERS_ATTACHED
                .with_label_values(&[DIRECTION, self.partition.topic()])
                .dec();
        }
        if drained {
            self.schedule_cleanup(cx);
        }
    }

    fn on_initial_window(&mut self, window: &Window, cx: &mut StreamContext<'_>) {
        self.initial_ack = self.initial_ack.max(window.header.acknowledge);
        self.initial_max = window.header.maximum;
        self.initial_pad = window.padding;

        if !self.state.is_initial_opened() {
            self.backoff.reset();
            self.state.initial_opened();

            if let Some(creditor) = self.creditor {
                cx.budgets.credit(creditor, i64::from(self.window_bytes));
            }

            let grant = self.grant();
            for member in self.members.iter_mut() {
                member.do_initial_window(0, grant.window_bytes, grant, cx);
            }
        }

        self.do_flush_initial_if_necessary(cx);
    }

    // ---- signals ----

    pub fn on_signal(&mut self, signal_id: i32, cx: &mut StreamContext<'_>) {
        match signal_id {
            SIGNAL_SEGMENT_COMPACT => self.on_segment_compact(cx),
            SIGNAL_GROUP_CLEANUP => {
                self.cleanup_timer = None;
                if self.members.is_empty() {
                    debug!(topic = self.topic(), partition = self.partition.id(), "Produce fan-out idle");
                    self.do_initial_abort_if_necessary(cx);
                    self.do_reply_reset_if_necessary(cx);
                }
            }
            SIGNAL_RECONNECT => {
                self.reconnect_timer = None;
                self.do_initial_begin_if_necessary(cx);
            }
            other => debug!(signal_id = other, "Unknown produce fan-out signal"),
        }
    }

    fn on_segment_compact(&mut self, cx: &mut StreamContext<'_>) {
        let now = cx.now_millis();
        let head = self.partition.head();
        let mut segment = self.partition.first_segment();
        while let Some(current) = segment {
            if Some(current) == head {
                break;
            }
            segment = self.partition.next_segment(current);
            if self.partition.clean(current, now) {
                SEGMENTS_REMOVED_TOTAL
                    .with_label_values(&[self.partition.topic(), "compaction"])
                    .inc();
            }
        }
        self.compact_at = i64::MAX;
        self.compact_timer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;
    use streamgate_cache::{CacheConfig, MemoryPartition};
    use streamgate_core::frame::{flags, Abort, Begin, End, ProduceDataEx, Reset, ResetEx};

    const ADDRESS: u64 = 1 << 61;

    fn fan(reconnect_delay_secs: u64, cleanup_delay_secs: u64) -> ProduceFan {
        ProduceFan::new(
            ADDRESS,
            0,
            1,
            7,
            Box::new(MemoryPartition::new("orders", 0, CacheConfig::default())),
            ProduceFanOptions {
                reconnect_delay_secs,
                cleanup_delay_secs,
                window_bytes: 65536,
            },
            1_000_000,
        )
    }

    fn member(stream_id: u64) -> ProduceMember {
        ProduceMember::new(&FrameHeader::new(0, 1, stream_id), 7)
    }

    fn fragment(stream_id: u64, sequence: i64, flags: u8, value: &'static str, deferred: i32) -> Frame {
        Frame::Data(Data {
            header: FrameHeader::new(0, 1, stream_id).window(sequence, 0, 0),
            flags,
            budget_id: 0,
            reserved: value.len() as i32,
            payload: Some(Bytes::from_static(value.as_bytes())),
            extension: Some(DataEx::Produce(ProduceDataEx {
                deferred,
                timestamp: 0,
                sequence: 0,
                ack_mode: AckMode::LeaderOnly,
                key: Some(Bytes::from_static(b"k")),
                headers: Vec::new(),
            })),
        })
    }

    fn record(stream_id: u64, sequence: i64) -> Frame {
        fragment(stream_id, sequence, flags::INIT_FIN, "x", 0)
    }

    fn open_upstream(fan: &mut ProduceFan, harness: &mut TestHarness) {
        let (initial_id, reply_id) = fan.upstream_ids().unwrap();
        let window = Frame::Window(Window {
            header: FrameHeader::new(0, 1, initial_id).window(0, 0, 65536),
            budget_id: 0,
            padding: 0,
            minimum: 0,
        });
        fan.on_upstream_frame(&window, &mut harness.context());
        let begin = Frame::Begin(Begin {
            header: FrameHeader::new(0, 1, reply_id),
            affinity: 0,
            extension: None,
        });
        fan.on_upstream_frame(&begin, &mut harness.context());
    }

    fn upstream_reset(fan: &ProduceFan, error: i16) -> Frame {
        Frame::Reset(Reset {
            header: FrameHeader::new(0, 1, fan.upstream_ids().unwrap().0),
            extension: Some(ResetEx { error }),
        })
    }

    #[test]
    fn test_watermark_flushed_after_complete_entry() {
        let mut harness = TestHarness::new();
        let mut fan = fan(0, 0);
        fan.attach(member(21), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        harness.out.take();

        fan.on_member_frame(21, &record(21, 0), &mut harness.context());

        let (initial_id, _) = fan.upstream_ids().unwrap();
        let flushed = harness.out.frames().iter().find_map(|frame| match frame {
            Frame::Flush(Flush {
                header,
                extension: Some(FlushEx::Produce(extension)),
                ..
            }) if header.stream_id == initial_id => Some(extension.partition.partition_offset),
            _ => None,
        });
        assert_eq!(flushed, Some(0));
        assert_eq!(fan.offset_high_watermark(), 0);
        assert_eq!(fan.partition_offset(), 1);
    }

    #[test]
    fn test_incomplete_entry_holds_watermark() {
        let mut harness = TestHarness::new();
        let mut fan = fan(0, 0);
        fan.attach(member(21), &mut harness.context());
        fan.attach(member(23), &mut harness.context());
        open_upstream(&mut fan, &mut harness);

        fan.on_member_frame(21, &fragment(21, 0, flags::INIT, "ab", 3), &mut harness.context());
        fan.on_member_frame(23, &record(23, 0), &mut harness.context());
        assert_eq!(fan.offset_high_watermark(), -1);

        let abort = Frame::Abort(Abort {
            header: FrameHeader::new(0, 1, 21),
        });
        fan.on_member_frame(21, &abort, &mut harness.context());

        assert!(fan.partition().entry(0).unwrap().is_dirty());
        assert_eq!(fan.offset_high_watermark(), 1);
        assert_eq!(fan.member_count(), 1);
    }

    #[test]
    fn test_acks_follow_offset_order() {
        let mut harness = TestHarness::new();
        let mut fan = fan(0, 0);
        fan.attach(member(21), &mut harness.context());
        fan.attach(member(23), &mut harness.context());
        open_upstream(&mut fan, &mut harness);

        fan.on_member_frame(21, &record(21, 0), &mut harness.context());
        fan.on_member_frame(23, &record(23, 0), &mut harness.context());
        fan.on_member_frame(21, &record(21, 1), &mut harness.context());
        harness.out.take();

        let ack = Frame::Flush(Flush {
            header: FrameHeader::new(0, 1, fan.upstream_ids().unwrap().1),
            budget_id: 0,
            reserved: 0,
            extension: Some(FlushEx::Produce(ProduceFlushEx {
                partition: PartitionProgress::new(0, 2),
                key: None,
                error: 0,
            })),
        });
        fan.on_upstream_frame(&ack, &mut harness.context());

        let acks: Vec<(u64, i64)> = harness
            .out
            .frames()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Flush(Flush {
                    header,
                    extension: Some(FlushEx::Produce(extension)),
                    ..
                }) => Some((header.stream_id, extension.partition.partition_offset)),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![(20, 0), (22, 1), (20, 2)]);
    }

    #[test]
    fn test_upstream_error_fails_pending_members() {
        let mut harness = TestHarness::new();
        let mut fan = fan(0, 0);
        fan.attach(member(21), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        fan.on_member_frame(21, &record(21, 0), &mut harness.context());
        harness.out.take();

        let reset = upstream_reset(&fan, ErrorCode::InvalidRecord.as_i16());
        fan.on_upstream_frame(&reset, &mut harness.context());

        let error = harness.out.frames().iter().find_map(|frame| match frame {
            Frame::Reset(reset) if reset.header.stream_id == 21 => reset.error(),
            _ => None,
        });
        assert_eq!(error, Some(87));
        assert_eq!(fan.member_count(), 0);
        assert_eq!(fan.take_detached(), vec![21]);
    }

    #[test]
    fn test_not_leader_reset_schedules_reconnect() {
        let mut harness = TestHarness::new();
        let mut fan = fan(5, 0);
        fan.attach(member(21), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        let first = fan.upstream_ids();
        harness.out.take();

        let reset = upstream_reset(&fan, ErrorCode::NotLeaderOrFollower.as_i16());
        fan.on_upstream_frame(&reset, &mut harness.context());
        assert_eq!(harness.signaler.deadlines(ADDRESS, SIGNAL_RECONNECT), vec![1_000_050]);
        assert_eq!(fan.member_count(), 1);

        fan.on_signal(SIGNAL_RECONNECT, &mut harness.context());
        let begins = harness
            .out
            .frames()
            .iter()
            .filter(|frame| matches!(frame, Frame::Begin(_)))
            .count();
        assert_eq!(begins, 1);
        assert_ne!(fan.upstream_ids(), first);
    }

    #[test]
    fn test_idle_fan_closes_after_cleanup_delay() {
        let mut harness = TestHarness::new();
        let mut fan = fan(0, 1);
        fan.attach(member(21), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        let (initial_id, _) = fan.upstream_ids().unwrap();

        let end = Frame::End(End {
            header: FrameHeader::new(0, 1, 21),
        });
        fan.on_member_frame(21, &end, &mut harness.context());
        assert_eq!(fan.member_count(), 0);
        assert_eq!(
            harness.signaler.deadlines(ADDRESS, SIGNAL_GROUP_CLEANUP),
            vec![1_001_000]
        );
        harness.out.take();

        fan.on_signal(SIGNAL_GROUP_CLEANUP, &mut harness.context());
        let aborted = harness
            .out
            .frames()
            .iter()
            .any(|frame| matches!(frame, Frame::Abort(abort) if abort.header.stream_id == initial_id));
        assert!(aborted);
    }

    #[test]
    fn test_upstream_end_fails_in_flight_entries() {
        let mut harness = TestHarness::new();
        let mut fan = fan(0, 1);
        fan.attach(member(21), &mut harness.context());
        fan.attach(member(23), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        fan.on_member_frame(21, &record(21, 0), &mut harness.context());
        harness.out.take();

        let end = Frame::End(End {
            header: FrameHeader::new(0, 1, fan.upstream_ids().unwrap().1),
        });
        fan.on_upstream_frame(&end, &mut harness.context());

        let frames = harness.out.frames();
        let error = frames.iter().find_map(|frame| match frame {
            Frame::Reset(reset) if reset.header.stream_id == 21 => reset.error(),
            _ => None,
        });
        assert_eq!(error, Some(ErrorCode::UnknownServerError.as_i16()));
        assert!(frames
            .iter()
            .any(|frame| matches!(frame, Frame::End(end) if end.header.stream_id == 22)));
        assert!(fan.partition().entry(0).unwrap().is_dirty());
        assert_eq!(fan.member_count(), 0);
        assert_eq!(
            harness.signaler.deadlines(ADDRESS, SIGNAL_GROUP_CLEANUP),
            vec![1_001_000]
        );
    }

    #[test]
    fn test_oversized_deferred_length_rejected() {
        let mut harness = TestHarness::new();
        let mut fan = fan(0, 0);
        fan.attach(member(21), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        harness.out.take();

        let oversized = fragment(21, 0, flags::INIT, "ab", i32::MAX);
        fan.on_member_frame(21, &oversized, &mut harness.context());

        let error = harness.out.frames().iter().find_map(|frame| match frame {
            Frame::Reset(reset) if reset.header.stream_id == 21 => reset.error(),
            _ => None,
        });
        assert_eq!(error, Some(ErrorCode::CorruptMessage.as_i16()));
        assert!(fan.partition().entry(0).is_none());
        assert_eq!(fan.partition_offset(), 0);
    }
}
