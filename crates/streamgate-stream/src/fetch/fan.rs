//! Fetch fan-out: one upstream fetch per topic partition.
//!
//! The fan-out opens a single upstream fetch on behalf of all its members,
//! writes what arrives into the cache partition and wakes members to drain
//! it. It also owns the partition's segment timers:
//!
//! ```text
//!   RETAIN   head segment aged out: seal it and start a new head
//!   DELETE   sealed segment past retention: remove it
//!   COMPACT  segment with superseded keys: rewrite without them
//! ```
//!
//! Upstream progress `(partition, stable, latest)` only moves forward and
//! `stable <= latest` always holds.

use streamgate_cache::{
    compute_hash, entry_flags, AncestorLookup, EntryStart, Partition, SegmentRef,
};
use streamgate_core::frame::{
    value_length, Begin, BeginEx, Data, DataEx, FetchBeginEx, Flush, FlushEx, Frame, FrameHeader,
    Reset, Window,
};
use streamgate_core::offset::{DeltaType, OffsetType, PartitionProgress, TransactionResult};
use streamgate_core::record::headers_size;
use streamgate_core::stream_id::reply_id;
use streamgate_core::{ErrorCode, StreamState};
use streamgate_observability::metrics::{
    FANOUTS_OPEN, MEMBERS_ATTACHED, SEGMENTS_REMOVED_TOTAL, UPSTREAM_RECONNECTS_TOTAL,
};
use tracing::{debug, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::context::StreamContext;
use crate::fetch::member::{FanView, FetchMember};
use crate::signaler::{cancel_timer, TimerHandle};

pub const SIGNAL_RECONNECT: i32 = 1;
pub const SIGNAL_SEGMENT_RETAIN: i32 = 2;
pub const SIGNAL_SEGMENT_DELETE: i32 = 3;
pub const SIGNAL_SEGMENT_COMPACT: i32 = 4;

/// Retention cap for partitions read from the live end.
pub const LIVE_RETENTION_MAX_MS: i64 = 30_000;

const DIRECTION: &str = "fetch";

#[derive(Debug, Clone, Copy)]
pub struct FetchFanOptions {
    pub default_offset: OffsetType,
    pub delta_type: DeltaType,
    pub reconnect_delay_secs: u64,
    pub window_bytes: i32,
}

pub struct FetchFan {
    address: u64,
    origin_id: u64,
    routed_id: u64,
    authorization: i64,
    partition: Box<dyn Partition>,
    default_offset: OffsetType,
    delta_type: DeltaType,
    retention_max: i64,
    window_bytes: i32,
    backoff: ReconnectBackoff,

    leader_id: i64,
    initial_id: u64,
    reply_id: u64,
    state: StreamState,
    upstream_open: bool,

    initial_seq: i64,
    initial_ack: i64,
    initial_max: i32,
    reply_seq: i64,
    reply_ack: i64,
    reply_max: i32,

    partition_offset: i64,
    stable_offset: i64,
    latest_offset: i64,
    /// Entry being written from a fragmented upstream record
    writing: Option<(SegmentRef, i64)>,

    retain_timer: Option<TimerHandle>,
    delete_timer: Option<TimerHandle>,
    compact_timer: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,
    delete_at: i64,
    compact_at: i64,

    members: Vec<FetchMember>,
    detached: Vec<u64>,
}

impl FetchFan {
    pub fn new(
        address: u64,
        origin_id: u64,
        routed_id: u64,
        leader_id: i64,
        partition: Box<dyn Partition>,
        options: FetchFanOptions,
    ) -> Self {
        let retention_max = match options.default_offset {
            OffsetType::Live => LIVE_RETENTION_MAX_MS,
            OffsetType::Historical => i64::MAX,
        };
        Self {
            address,
            origin_id,
            routed_id,
            authorization: 0,
            partition,
            default_offset: options.default_offset,
            delta_type: options.delta_type,
            retention_max,
            window_bytes: options.window_bytes,
            backoff: ReconnectBackoff::from_secs(options.reconnect_delay_secs),
            leader_id,
            initial_id: 0,
            reply_id: 0,
            state: StreamState::default(),
            upstream_open: false,
            initial_seq: 0,
            initial_ack: 0,
            initial_max: 0,
            reply_seq: 0,
            reply_ack: 0,
            reply_max: 0,
            partition_offset: OffsetType::HISTORICAL,
            stable_offset: OffsetType::LIVE,
            latest_offset: OffsetType::LIVE,
            writing: None,
            retain_timer: None,
            delete_timer: None,
            compact_timer: None,
            reconnect_timer: None,
            delete_at: i64::MAX,
            compact_at: i64::MAX,
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

    /// Ids of the current upstream stream, once one was opened.
    pub fn upstream_ids(&self) -> Option<(u64, u64)> {
        (self.initial_id != 0).then_some((self.initial_id, self.reply_id))
    }

    /// `(partition_offset, stable_offset, latest_offset)`
    pub fn offsets(&self) -> (i64, i64, i64) {
        (self.partition_offset, self.stable_offset, self.latest_offset)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.backoff.attempt()
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

    pub fn member(&self, initial_id: u64) -> Option<&FetchMember> {
        self.members.iter().find(|m| m.initial_id() == initial_id)
    }

    /// Members removed since the last call.
    pub fn take_detached(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.detached)
    }

    fn topic(&self) -> &str {
        self.partition.topic()
    }

    fn split(&mut self) -> (FanView<'_>, &mut Vec<FetchMember>) {
        let view = FanView {
            partition: self.partition.as_ref(),
            partition_offset: self.partition_offset,
            stable_offset: self.stable_offset,
            latest_offset: self.latest_offset,
        };
        (view, &mut self.members)
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

    /// Keep the open fan-outs gauge in step with the upstream state.
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

    pub fn attach(&mut self, mut member: FetchMember, cx: &mut StreamContext<'_>) {
        if member.leader_id() != self.leader_id {
            info!(
                topic = self.topic(),
                partition = self.partition.id(),
                from = self.leader_id,
                to = member.leader_id(),
                "Partition leader changed"
            );
            self.do_initial_abort_if_necessary(cx);
            self.do_reply_reset_if_necessary(cx);
            cancel_timer(cx.signaler, &mut self.reconnect_timer);

            let error = Some(ErrorCode::NotLeaderOrFollower.as_i16());
            let gauge = MEMBERS_ATTACHED.with_label_values(&[DIRECTION, self.partition.topic()]);
            for mut stale in self.members.drain(..) {
                stale.cleanup(cx, error);
                self.detached.push(stale.initial_id());
                gauge.dec();
            }
            self.leader_id = member.leader_id();
        }

        member.on_initial_begin();
        self.members.push(member);
        MEMBERS_ATTACHED
            .with_label_values(&[DIRECTION, self.partition.topic()])
            .inc();

        self.do_initial_begin_if_necessary(cx);

        let initial_opened = self.state.is_initial_opened();
        let reply_opened = self.state.is_reply_opened();
        let (view, members) = self.split();
        if let Some(member) = members.last_mut() {
            if initial_opened {
                member.do_initial_window(cx);
            }
            if reply_opened {
                member.do_reply_begin_if_necessary(&view, cx);
            }
        }
    }

    fn member_closed(&mut self, index: usize, cx: &mut StreamContext<'_>) {
        let member = self.members.remove(index);
        self.detached.push(member.initial_id());
        MEMBERS_ATTACHED
            .with_label_values(&[DIRECTION, self.partition.topic()])
            .dec();

        if self.members.is_empty() {
            cancel_timer(cx.signaler, &mut self.reconnect_timer);
            self.do_initial_abort_if_necessary(cx);
            self.do_reply_reset_if_necessary(cx);
        }
    }

    fn position(&self, initial_id: u64) -> Option<usize> {
        self.members.iter().position(|m| m.initial_id() == initial_id)
    }

    /// Frames sent by a member's consumer, on either half.
    pub fn on_member_frame(&mut self, initial_id: u64, frame: &Frame, cx: &mut StreamContext<'_>) {
        let Some(index) = self.position(initial_id) else {
            debug!(stream_id = frame.stream_id(), "Frame for detached fetch member");
            return;
        };

        match frame {
            Frame::End(_) => {
                self.members[index].on_initial_end(cx);
                self.member_closed(index, cx);
            }
            Frame::Abort(_) => {
                self.members[index].on_initial_abort(cx);
                self.member_closed(index, cx);
            }
            Frame::Reset(_) => {
                self.members[index].on_reply_reset(cx);
                self.member_closed(index, cx);
            }
            Frame::Window(window) => {
                let (view, members) = self.split();
                if !members[index].on_reply_window(window, &view, cx) {
                    self.member_closed(index, cx);
                }
            }
            Frame::Flush(flush) => {
                if let Some(FlushEx::Fetch(ex)) = &flush.extension {
                    let (view, members) = self.split();
                    members[index].on_initial_flush(ex, &view, cx);
                }
            }
            Frame::Signal(signal) => {
                let (view, members) = self.split();
                members[index].on_signal(signal.signal_id, &view, cx);
            }
            other => {
                warn!(
                    stream_id = other.stream_id(),
                    kind = ?other.kind(),
                    "Unexpected frame from fetch member"
                );
            }
        }
    }

    fn drain_members(&mut self, cx: &mut StreamContext<'_>) {
        let (view, members) = self.split();
        for member in members.iter_mut() {
            member.drain(&view, cx);
        }
    }

    /// Drop the record being written if the upstream never finished it.
    fn abandon_writing(&mut self) {
        if let Some((segment, offset)) = self.writing.take() {
            if self.partition.abandon_entry(segment, offset) {
                debug!(
                    topic = self.topic(),
                    partition = self.partition.id(),
                    offset,
                    "Dropped unfinished upstream record"
                );
            }
        }
    }

    // ---- upstream lifecycle ----

    fn do_initial_begin_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.is_closed() {
            self.state = StreamState::default();
            self.initial_seq = 0;
            self.initial_ack = 0;
            self.initial_max = 0;
            self.reply_seq = 0;
            self.reply_ack = 0;
            self.reply_max = 0;
            self.abandon_writing();
        }

        if !self.state.is_initial_opening() {
            self.do_initial_begin(cx);
        }
    }

    fn do_initial_begin(&mut self, cx: &mut StreamContext<'_>) {
        self.initial_id = cx.ids.supply_initial_id();
        self.reply_id = reply_id(self.initial_id);

        let offset = self.partition.next_offset(self.default_offset);
        self.partition_offset = self.partition_offset.max(offset);

        debug!(
            topic = self.topic(),
            partition = self.partition.id(),
            stream_id = self.initial_id,
            leader = self.leader_id,
            offset,
            "Fetch fan-out connecting"
        );

        let extension = FetchBeginEx::new(self.topic(), PartitionProgress::new(self.partition.id(), offset));
        cx.out.begin(
            self.initial_header(),
            self.leader_id,
            Some(BeginEx::Fetch(extension)),
        );
        self.state.initial_opening();
    }

    fn do_initial_end_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.initial_active() {
            cx.out.end(self.initial_header());
        }
        self.state.initial_closed();
    }

    fn do_initial_abort_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if self.state.initial_active() {
            cx.out.abort(self.initial_header());
        }
        self.state.initial_closed();
    }

    fn do_reply_reset_if_necessary(&mut self, cx: &mut StreamContext<'_>) {
        if !self.state.is_reply_closed() && self.initial_id != 0 {
            cx.out.reset(self.reply_header(), None);
        }
        self.state.reply_closed();
    }

    fn do_reply_window(&mut self, min_no_ack: i64, min_max: i32, cx: &mut StreamContext<'_>) {
        if self.state.is_reply_closed() {
            return;
        }
        let new_ack = (self.reply_seq - min_no_ack).max(self.reply_ack);
        if new_ack > self.reply_ack || min_max > self.reply_max || !self.state.is_reply_opened() {
            self.reply_ack = new_ack;
            self.reply_max = min_max;
            self.state.reply_opened();
            cx.out.window(self.reply_header(), 0, 0, 0);
        }
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
            "Fetch fan-out reconnecting"
        );
        UPSTREAM_RECONNECTS_TOTAL
            .with_label_values(&[DIRECTION, self.partition.topic()])
            .inc();

        self.reconnect_timer = cx.signaler.signal_at(deadline, self.address, SIGNAL_RECONNECT);
    }

    /// Frames arriving from the upstream broker on either half.
    pub fn on_upstream_frame(&mut self, frame: &Frame, cx: &mut StreamContext<'_>) {
        let stream_id = frame.stream_id();
        if self.initial_id == 0 || (stream_id != self.initial_id && stream_id != self.reply_id) {
            debug!(stream_id, "Frame for stale fetch upstream");
            return;
        }

        match frame {
            Frame::Begin(begin) => self.on_reply_begin(begin, cx),
            Frame::Data(data) => self.on_reply_data(data, cx),
            Frame::Flush(flush) => self.on_reply_flush(flush, cx),
            Frame::End(_) => self.on_reply_end(cx),
            Frame::Abort(_) => self.on_reply_abort(cx),
            Frame::Reset(reset) => self.on_initial_reset(reset, cx),
            Frame::Window(window) => self.on_initial_window(window, cx),
            Frame::Signal(_) => {}
        }
    }

    fn update_offsets(&mut self, progress: &PartitionProgress) {
        if progress.partition_offset < self.partition_offset
            || progress.stable_offset < self.stable_offset
            || progress.latest_offset < self.latest_offset
        {
            warn!(
                topic = self.topic(),
                partition = self.partition.id(),
                partition_offset = progress.partition_offset,
                stable_offset = progress.stable_offset,
                latest_offset = progress.latest_offset,
                "Upstream progress moved backwards"
            );
        }

        self.partition_offset = self.partition_offset.max(progress.partition_offset);
        self.latest_offset = self.latest_offset.max(progress.latest_offset);
        self.stable_offset = self
            .stable_offset
            .max(progress.stable_offset)
            .min(self.latest_offset);
    }

    fn on_reply_begin(&mut self, begin: &Begin, cx: &mut StreamContext<'_>) {
        self.state.reply_opening();

        if let Some(BeginEx::Fetch(extension)) = &begin.extension {
            self.update_offsets(&extension.partition);
        }
        if self.partition_offset >= 0 {
            self.roll_head(self.partition_offset, None, 0, 0, cx);
        }

        let (view, members) = self.split();
        for member in members.iter_mut() {
            member.do_reply_begin_if_necessary(&view, cx);
        }

        self.do_reply_window(0, self.window_bytes, cx);
    }

    fn on_reply_data(&mut self, data: &Data, cx: &mut StreamContext<'_>) {
        self.reply_seq = self.reply_seq.max(data.header.sequence) + i64::from(data.reserved);

        let extension = match &data.extension {
            Some(DataEx::Fetch(extension)) => Some(extension),
            _ => None,
        };

        if data.is_init() {
            self.abandon_writing();
            match extension {
                Some(extension) if extension.partition.partition_id == self.partition.id() => {
                    let offset = extension.partition.partition_offset;
                    let value_len = match &data.payload {
                        Some(payload) => value_length(payload.len(), extension.deferred),
                        None => Some(-1),
                    };
                    if offset < self.partition_offset {
                        warn!(
                            topic = self.topic(),
                            partition = self.partition.id(),
                            offset,
                            partition_offset = self.partition_offset,
                            "Upstream record behind partition offset"
                        );
                    } else if let Some(value_len) = value_len {
                        let headers_size_max =
                            (headers_size(&extension.headers) as i32).max(extension.headers_size_max);
                        let key = extension.key.as_ref();
                        let key_hash = compute_hash(key);

                        match self.roll_head(offset, key, value_len, headers_size_max, cx) {
                            Some(segment) => {
                                let ancestor = self.find_and_mark_ancestor(segment, key, key_hash, offset, cx);
                                let flags = if data.is_skip() { entry_flags::ABORTED } else { 0 };
                                let start = EntryStart {
                                    offset,
                                    timestamp: extension.timestamp,
                                    producer_id: extension.producer_id,
                                    key: extension.key.clone(),
                                    key_hash,
                                    value_len,
                                    headers: extension.headers.clone(),
                                    ancestor,
                                    flags,
                                    delta_type: self.delta_type,
                                };
                                match self.partition.write_entry_start(segment, start) {
                                    Ok(()) => self.writing = Some((segment, offset)),
                                    Err(e) => warn!(offset, error = %e, "Failed to cache upstream record"),
                                }
                            }
                            None => warn!(
                                topic = self.topic(),
                                partition = self.partition.id(),
                                offset,
                                value_len,
                                "Upstream record larger than a cache segment"
                            ),
                        }
                    } else {
                        warn!(
                            topic = self.topic(),
                            partition = self.partition.id(),
                            offset,
                            deferred = extension.deferred,
                            "Upstream record length out of range"
                        );
                    }
                }
                _ => warn!(stream_id = self.reply_id, "Upstream record without fetch extension"),
            }
        }

        if let (Some((segment, offset)), Some(payload)) = (self.writing, data.payload.as_ref()) {
            if !payload.is_empty() {
                if let Err(e) = self.partition.write_entry_continue(segment, offset, payload) {
                    warn!(offset, error = %e, "Failed to cache upstream fragment");
                    self.abandon_writing();
                }
            }
        }

        if data.is_fin() {
            if let Some((segment, offset)) = self.writing.take() {
                if let Err(e) = self.partition.write_entry_finish(segment, offset) {
                    warn!(offset, error = %e, "Failed to complete upstream record");
                }
            }
            if let Some(extension) = extension {
                let progress = extension.partition;
                self.update_offsets(&progress);
            }
            self.drain_members(cx);
        }

        self.do_reply_window(0, self.reply_max, cx);
    }

    fn on_reply_flush(&mut self, flush: &Flush, cx: &mut StreamContext<'_>) {
        if let Some(FlushEx::Fetch(extension)) = &flush.extension {
            if let Some(transaction) = extension.transaction {
                let offset = extension.partition.partition_offset;
                self.write_control_entry(offset, transaction.producer_id, transaction.result, cx);

                if transaction.result == TransactionResult::Abort {
                    self.abort_producer(transaction.producer_id);
                }
            }

            let progress = extension.partition;
            self.update_offsets(&progress);
            self.drain_members(cx);
        }

        self.do_reply_window(0, self.reply_max, cx);
    }

    fn write_control_entry(
        &mut self,
        offset: i64,
        producer_id: i64,
        result: TransactionResult,
        cx: &mut StreamContext<'_>,
    ) {
        let Some(segment) = self.roll_head(offset, None, 0, 0, cx) else {
            return;
        };
        let mut flags = entry_flags::CONTROL;
        if result == TransactionResult::Abort {
            flags |= entry_flags::ABORTED;
        }
        let start = EntryStart {
            offset,
            timestamp: cx.now_millis(),
            producer_id,
            key: None,
            key_hash: compute_hash(None),
            value_len: 0,
            headers: Vec::new(),
            ancestor: -1,
            flags,
            delta_type: DeltaType::None,
        };
        let written = self
            .partition
            .write_entry_start(segment, start)
            .and_then(|()| self.partition.write_entry_finish(segment, offset));
        if let Err(e) = written {
            warn!(offset, error = %e, "Failed to cache transaction marker");
        }
    }

    /// Mark the aborted producer's records written since the last stable offset.
    fn abort_producer(&mut self, producer_id: i64) {
        let mut segment = self
            .partition
            .seek_not_after(self.stable_offset)
            .or_else(|| self.partition.first_segment());
        let mut aborted = 0;
        while let Some(current) = segment {
            aborted += self
                .partition
                .find_and_abort_producer_id(current, producer_id, self.stable_offset);
            segment = self.partition.next_segment(current);
        }
        debug!(
            topic = self.topic(),
            partition = self.partition.id(),
            producer_id,
            aborted,
            "Aborted transaction records"
        );
    }

    fn on_reply_end(&mut self, cx: &mut StreamContext<'_>) {
        self.abandon_writing();
        self.state.reply_closed();
        self.do_initial_end_if_necessary(cx);

        if self.backoff.is_enabled() && !self.members.is_empty() {
            self.schedule_reconnect(cx);
        } else {
            debug!(topic = self.topic(), partition = self.partition.id(), "Fetch fan-out disconnected");
            for mut member in self.members.drain(..) {
                member.do_reply_end_if_necessary(cx);
                member.cleanup(cx, None);
                self.detached.push(member.initial_id());
                MEMBERS_ATTACHED
                    .with_label_values(&[DIRECTION, self.partition.topic()])
                    .dec();
            }
        }
    }

    fn on_reply_abort(&mut self, cx: &mut StreamContext<'_>) {
        self.abandon_writing();
        self.state.reply_closed();
        self.do_initial_abort_if_necessary(cx);

        if self.backoff.is_enabled() && !self.members.is_empty() {
            self.schedule_reconnect(cx);
        } else {
            debug!(topic = self.topic(), partition = self.partition.id(), "Fetch fan-out aborted");
            for mut member in self.members.drain(..) {
                member.do_reply_abort_if_necessary(cx);
                member.cleanup(cx, None);
                self.detached.push(member.initial_id());
                MEMBERS_ATTACHED
                    .with_label_values(&[DIRECTION, self.partition.topic()])
                    .dec();
            }
        }
    }

    fn on_initial_reset(&mut self, reset: &Reset, cx: &mut StreamContext<'_>) {
        self.abandon_writing();
        self.state.initial_closed();
        self.do_reply_reset_if_necessary(cx);

        let error = reset.error().unwrap_or(ErrorCode::UnknownServerError.as_i16());
        if self.backoff.is_retryable(error) && !self.members.is_empty() {
            self.schedule_reconnect(cx);
        } else {
            warn!(
                topic = self.topic(),
                partition = self.partition.id(),
                error,
                "Fetch fan-out reset"
            );
            for mut member in self.members.drain(..) {
                member.cleanup(cx, Some(error));
                self.detached.push(member.initial_id());
                MEMBERS_ATTACHED
                    .with_label_values(&[DIRECTION, self.partition.topic()])
                    .dec();
            }
        }
    }

    fn on_initial_window(&mut self, window: &Window, cx: &mut StreamContext<'_>) {
        self.initial_ack = self.initial_ack.max(window.header.acknowledge);
        self.initial_max = window.header.maximum;

        if !self.state.is_initial_opened() {
            self.backoff.reset();
            self.state.initial_opened();
            for member in self.members.iter_mut() {
                member.do_initial_window(cx);
            }
        }
    }

    // ---- segments ----

    /// Head segment for an entry at `offset`, scheduling timers when it rolls.
    fn roll_head(
        &mut self,
        offset: i64,
        key: Option<&bytes::Bytes>,
        value_len: i32,
        headers_size_max: i32,
        cx: &mut StreamContext<'_>,
    ) -> Option<SegmentRef> {
        let head = self.partition.head();
        let next = self
            .partition
            .new_head_if_necessary(offset, key, value_len, headers_size_max, cx.now_millis())?;
        if head != Some(next) {
            self.on_new_head(next, cx);
        }
        Some(next)
    }

    fn on_new_head(&mut self, head: SegmentRef, cx: &mut StreamContext<'_>) {
        cancel_timer(cx.signaler, &mut self.retain_timer);
        let retain_at = self.partition.retain_at(head);
        self.retain_timer = cx.signaler.signal_at(retain_at, self.address, SIGNAL_SEGMENT_RETAIN);

        if self.partition.cleanup_policy().delete() {
            if let Some(previous) = self.partition.previous_segment(head) {
                let delete_at = self.partition.delete_at(previous, self.retention_max);
                self.schedule_delete(delete_at, cx);
            }
        }
    }

    fn schedule_delete(&mut self, delete_at: i64, cx: &mut StreamContext<'_>) {
        if self.delete_timer.is_some() && delete_at < self.delete_at {
            cancel_timer(cx.signaler, &mut self.delete_timer);
        }
        if self.delete_timer.is_none() {
            self.delete_at = delete_at;
            self.delete_timer = cx.signaler.signal_at(delete_at, self.address, SIGNAL_SEGMENT_DELETE);
        }
    }

    fn find_and_mark_ancestor(
        &mut self,
        head: SegmentRef,
        key: Option<&bytes::Bytes>,
        key_hash: u32,
        descendant: i64,
        cx: &mut StreamContext<'_>,
    ) -> i64 {
        if key.is_none() {
            return -1;
        }
        let now = cx.now_millis();
        let mut segment = Some(head);
        while let Some(current) = segment {
            if let AncestorLookup::Found(ancestor) =
                self.partition
                    .find_and_mark_ancestor(current, key, key_hash, descendant, now)
            {
                if self.partition.cleanup_policy().compact() {
                    self.schedule_compact(current, cx);
                }
                return ancestor;
            }
            segment = self.partition.previous_segment(current);
        }
        -1
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

    fn sealed_segments(&self) -> Vec<SegmentRef> {
        let head = self.partition.head();
        let mut segments = Vec::new();
        let mut segment = self.partition.first_segment();
        while let Some(current) = segment {
            if Some(current) == head {
                break;
            }
            segments.push(current);
            segment = self.partition.next_segment(current);
        }
        segments
    }

    pub fn on_signal(&mut self, signal_id: i32, cx: &mut StreamContext<'_>) {
        match signal_id {
            SIGNAL_RECONNECT => {
                self.reconnect_timer = None;
                self.do_initial_begin_if_necessary(cx);
            }
            SIGNAL_SEGMENT_RETAIN => self.on_segment_retain(cx),
            SIGNAL_SEGMENT_DELETE => self.on_segment_delete(cx),
            SIGNAL_SEGMENT_COMPACT => self.on_segment_compact(cx),
            other => debug!(signal_id = other, "Unknown fetch fan-out signal"),
        }
    }

    fn on_segment_retain(&mut self, cx: &mut StreamContext<'_>) {
        self.retain_timer = None;
        let head = self.partition.head();
        let next = self
            .partition
            .append(self.partition_offset.max(-1) + 1, cx.now_millis());
        if head != Some(next) {
            self.on_new_head(next, cx);
        }
    }

    fn on_segment_delete(&mut self, cx: &mut StreamContext<'_>) {
        self.delete_timer = None;
        self.delete_at = i64::MAX;
        let now = cx.now_millis();

        let mut pending = None;
        for segment in self.sealed_segments() {
            let delete_at = self.partition.delete_at(segment, self.retention_max);
            if delete_at > now {
                pending = Some(delete_at);
                break;
            }
            self.partition.remove_segment(segment);
            SEGMENTS_REMOVED_TOTAL
                .with_label_values(&[self.partition.topic(), "retention"])
                .inc();
            debug!(
                topic = self.topic(),
                partition = self.partition.id(),
                base_offset = segment.base_offset(),
                "Deleted cache segment"
            );
        }

        if let Some(delete_at) = pending {
            self.schedule_delete(delete_at, cx);
        }
    }

    fn on_segment_compact(&mut self, cx: &mut StreamContext<'_>) {
        let now = cx.now_millis();
        for segment in self.sealed_segments() {
            if self.partition.clean(segment, now) {
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
    use bytes::Bytes;
    use streamgate_cache::{CacheConfig, MemoryPartition};
    use streamgate_core::frame::{flags, FetchDataEx};
    use streamgate_core::ResetEx;

    fn fan(config: CacheConfig, reconnect_delay_secs: u64) -> FetchFan {
        FetchFan::new(
            1 << 62,
            0,
            1,
            7,
            Box::new(MemoryPartition::new("orders", 0, config)),
            FetchFanOptions {
                default_offset: OffsetType::Historical,
                delta_type: DeltaType::None,
                reconnect_delay_secs,
                window_bytes: 65536,
            },
        )
    }

    fn member(stream_id: u64, leader: i64) -> FetchMember {
        let begin = FetchBeginEx::new("orders", PartitionProgress::new(0, OffsetType::HISTORICAL));
        FetchMember::new(&FrameHeader::new(0, 1, stream_id), leader, &begin)
    }

    fn record(fan: &FetchFan, offset: i64, key: &'static str, value: &'static str) -> Frame {
        let (_, reply_id) = fan.upstream_ids().unwrap();
        Frame::Data(Data {
            header: FrameHeader::new(0, 1, reply_id),
            flags: flags::INIT_FIN,
            budget_id: 0,
            reserved: value.len() as i32,
            payload: Some(Bytes::from_static(value.as_bytes())),
            extension: Some(DataEx::Fetch(FetchDataEx {
                deferred: 0,
                timestamp: 0,
                producer_id: 0,
                headers_size_max: 0,
                filters: 0,
                partition: PartitionProgress::new(0, offset).with_offsets(offset, offset),
                key: Some(Bytes::from_static(key.as_bytes())),
                headers: Vec::new(),
                delta_type: DeltaType::None,
                ancestor_offset: -1,
            })),
        })
    }

    fn open_upstream(fan: &mut FetchFan, harness: &mut TestHarness) {
        let (initial_id, reply_id) = fan.upstream_ids().unwrap();
        let begin = Frame::Begin(Begin {
            header: FrameHeader::new(0, 1, reply_id),
            affinity: 0,
            extension: Some(BeginEx::Fetch(FetchBeginEx::new(
                "orders",
                PartitionProgress::new(0, 0).with_offsets(-1, -1),
            ))),
        });
        fan.on_upstream_frame(&begin, &mut harness.context());
        let window = Frame::Window(Window {
            header: FrameHeader::new(0, 1, initial_id),
            budget_id: 0,
            padding: 0,
            minimum: 0,
        });
        fan.on_upstream_frame(&window, &mut harness.context());
    }

    #[test]
    fn test_attach_opens_upstream_once() {
        let mut harness = TestHarness::new();
        let mut fan = fan(CacheConfig::default(), 0);
        fan.attach(member(11, 7), &mut harness.context());
        fan.attach(member(13, 7), &mut harness.context());

        let begins = harness
            .out
            .frames()
            .iter()
            .filter(|f| matches!(f, Frame::Begin(_)))
            .count();
        assert_eq!(begins, 1);
        assert_eq!(fan.member_count(), 2);
    }

    #[test]
    fn test_offsets_never_regress() {
        let mut harness = TestHarness::new();
        let mut fan = fan(CacheConfig::default(), 0);
        fan.attach(member(11, 7), &mut harness.context());
        open_upstream(&mut fan, &mut harness);

        fan.on_upstream_frame(&record(&fan, 0, "a", "x"), &mut harness.context());
        fan.on_upstream_frame(&record(&fan, 1, "b", "y"), &mut harness.context());
        assert_eq!(fan.offsets(), (1, 1, 1));

        let flush = Frame::Flush(Flush {
            header: FrameHeader::new(0, 1, fan.upstream_ids().unwrap().1),
            budget_id: 0,
            reserved: 0,
            extension: Some(FlushEx::Fetch(streamgate_core::FetchFlushEx {
                partition: PartitionProgress::new(0, 0).with_offsets(5, 3),
                transaction: None,
                filters: Vec::new(),
                evaluation: Default::default(),
            })),
        });
        fan.on_upstream_frame(&flush, &mut harness.context());
        let (partition_offset, stable_offset, latest_offset) = fan.offsets();
        assert_eq!(partition_offset, 1);
        assert_eq!(latest_offset, 3);
        assert_eq!(stable_offset, 3);
    }

    #[test]
    fn test_compaction_scheduled_for_superseded_key() {
        let config = CacheConfig {
            cleanup_policy: streamgate_cache::CleanupPolicy::Compact,
            ..Default::default()
        };
        let mut harness = TestHarness::new();
        let mut fan = fan(config, 0);
        fan.attach(member(11, 7), &mut harness.context());
        open_upstream(&mut fan, &mut harness);

        fan.on_upstream_frame(&record(&fan, 0, "k", "v1"), &mut harness.context());
        fan.on_upstream_frame(&record(&fan, 1, "k", "v2"), &mut harness.context());

        let ancestor = fan.partition().entry(0).unwrap();
        assert_eq!(ancestor.descendant, 1);
        assert!(ancestor.is_dirty());
        assert_eq!(fan.partition().entry(1).unwrap().ancestor, 0);
    }

    #[test]
    fn test_reset_with_other_error_reconnects() {
        let mut harness = TestHarness::new();
        let mut fan = fan(CacheConfig::default(), 5);
        fan.attach(member(11, 7), &mut harness.context());
        let (initial_id, _) = fan.upstream_ids().unwrap();

        let reset = Frame::Reset(Reset {
            header: FrameHeader::new(0, 1, initial_id),
            extension: Some(ResetEx { error: 7 }),
        });
        fan.on_upstream_frame(&reset, &mut harness.context());

        assert_eq!(fan.member_count(), 1);
        assert_eq!(harness.signaler.deadlines(fan.address(), SIGNAL_RECONNECT), vec![1_000_050]);

        harness.signaler.advance(50);
        let signal = harness.wakeups_rx.try_recv().unwrap();
        assert_eq!(signal.stream_id(), fan.address());
        fan.on_signal(SIGNAL_RECONNECT, &mut harness.context());
        assert_ne!(fan.upstream_ids().unwrap().0, initial_id);
    }

    #[test]
    fn test_reset_not_leader_closes_members() {
        let mut harness = TestHarness::new();
        let mut fan = fan(CacheConfig::default(), 5);
        fan.attach(member(11, 7), &mut harness.context());
        let (initial_id, _) = fan.upstream_ids().unwrap();

        let reset = Frame::Reset(Reset {
            header: FrameHeader::new(0, 1, initial_id),
            extension: Some(ResetEx { error: 6 }),
        });
        fan.on_upstream_frame(&reset, &mut harness.context());

        assert_eq!(fan.member_count(), 0);
        assert_eq!(fan.take_detached(), vec![11]);
        let member_reset = harness.out.frames().iter().find_map(|frame| match frame {
            Frame::Reset(reset) if reset.header.stream_id == 11 => reset.error(),
            _ => None,
        });
        assert_eq!(member_reset, Some(6));
    }

    #[test]
    fn test_retain_rolls_head() {
        let config = CacheConfig {
            segment_ms: 100,
            ..Default::default()
        };
        let mut harness = TestHarness::new();
        let mut fan = fan(config, 0);
        fan.attach(member(11, 7), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        fan.on_upstream_frame(&record(&fan, 0, "a", "x"), &mut harness.context());

        assert_eq!(
            harness.signaler.deadlines(fan.address(), SIGNAL_SEGMENT_RETAIN),
            vec![1_000_100]
        );
        harness.signaler.advance(100);
        fan.on_signal(SIGNAL_SEGMENT_RETAIN, &mut harness.context());

        assert_eq!(fan.partition().head().map(|s| s.base_offset()), Some(1));
        assert_eq!(fan.partition().previous_segment(fan.partition().head().unwrap()).map(|s| s.base_offset()), Some(0));
    }

    #[test]
    fn test_delete_removes_expired_segments() {
        let config = CacheConfig {
            segment_ms: 100,
            retention_ms: 500,
            ..Default::default()
        };
        let mut harness = TestHarness::new();
        let mut fan = fan(config, 0);
        fan.attach(member(11, 7), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        fan.on_upstream_frame(&record(&fan, 0, "a", "x"), &mut harness.context());

        harness.signaler.advance(100);
        fan.on_signal(SIGNAL_SEGMENT_RETAIN, &mut harness.context());
        assert_eq!(
            harness.signaler.deadlines(fan.address(), SIGNAL_SEGMENT_DELETE),
            vec![1_000_500]
        );

        harness.signaler.advance(400);
        fan.on_signal(SIGNAL_SEGMENT_DELETE, &mut harness.context());
        assert!(fan.partition().entry(0).is_none());
        assert_eq!(fan.partition().first_segment(), fan.partition().head());
    }

    #[test]
    fn test_earlier_delete_deadline_replaces_armed_timer() {
        let config = CacheConfig {
            segment_ms: 100,
            retention_ms: 500,
            ..Default::default()
        };
        let mut harness = TestHarness::new();
        let mut fan = fan(config, 0);
        fan.attach(member(11, 7), &mut harness.context());
        open_upstream(&mut fan, &mut harness);
        fan.on_upstream_frame(&record(&fan, 0, "a", "x"), &mut harness.context());

        harness.signaler.advance(100);
        fan.on_signal(SIGNAL_SEGMENT_RETAIN, &mut harness.context());
        assert_eq!(
            harness.signaler.deadlines(fan.address(), SIGNAL_SEGMENT_DELETE),
            vec![1_000_500]
        );

        // clock stepped back, so the next sealed segment expires first
        harness.signaler.set_now(999_000);
        fan.on_signal(SIGNAL_SEGMENT_RETAIN, &mut harness.context());
        fan.on_upstream_frame(&record(&fan, 1, "b", "y"), &mut harness.context());
        fan.on_signal(SIGNAL_SEGMENT_RETAIN, &mut harness.context());

        assert_eq!(
            harness.signaler.deadlines(fan.address(), SIGNAL_SEGMENT_DELETE),
            vec![999_500]
        );
    }

    #[test]
    fn test_record_with_oversized_length_not_cached() {
        let mut harness = TestHarness::new();
        let mut fan = fan(CacheConfig::default(), 0);
        fan.attach(member(11, 7), &mut harness.context());
        open_upstream(&mut fan, &mut harness);

        let mut oversized = record(&fan, 0, "a", "x");
        if let Frame::Data(Data {
            flags: data_flags,
            extension: Some(DataEx::Fetch(extension)),
            ..
        }) = &mut oversized
        {
            *data_flags = flags::INIT;
            extension.deferred = i32::MAX;
        }
        fan.on_upstream_frame(&oversized, &mut harness.context());
        assert!(fan.partition().entry(0).is_none());

        fan.on_upstream_frame(&record(&fan, 1, "b", "y"), &mut harness.context());
        assert!(fan.partition().entry(1).is_some_and(|entry| entry.is_completed()));
    }

    #[test]
    fn test_last_member_detach_tears_down_upstream() {
        let mut harness = TestHarness::new();
        let mut fan = fan(CacheConfig::default(), 5);
        fan.attach(member(11, 7), &mut harness.context());
        open_upstream(&mut fan, &mut harness);

        let end = Frame::End(streamgate_core::End {
            header: FrameHeader::new(0, 1, 11),
        });
        fan.on_member_frame(11, &end, &mut harness.context());

        assert_eq!(fan.member_count(), 0);
        assert!(fan.state().is_closed());
        let frames = harness.out.frames();
        let (initial_id, reply_id) = fan.upstream_ids().unwrap();
        assert!(frames.iter().any(|f| matches!(f, Frame::Abort(a) if a.header.stream_id == initial_id)));
        assert!(frames.iter().any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == reply_id)));
    }
}
