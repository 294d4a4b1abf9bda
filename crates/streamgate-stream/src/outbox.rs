//! Frames produced while handling one inbound frame.

use bytes::Bytes;
use streamgate_core::frame::{
    Abort, Begin, BeginEx, Data, DataEx, End, Flush, FlushEx, Frame, FrameHeader, Reset, ResetEx, Window,
};

#[derive(Debug, Default)]
pub struct Outbox {
    frames: Vec<Frame>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn take(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.frames)
    }

    pub fn begin(&mut self, header: FrameHeader, affinity: i64, extension: Option<BeginEx>) {
        self.push(Frame::Begin(Begin {
            header,
            affinity,
            extension,
        }));
    }

    pub fn data(
        &mut self,
        header: FrameHeader,
        flags: u8,
        budget_id: u64,
        reserved: i32,
        payload: Option<Bytes>,
        extension: Option<DataEx>,
    ) {
        self.push(Frame::Data(Data {
            header,
            flags,
            budget_id,
            reserved,
            payload,
            extension,
        }));
    }

    pub fn flush(&mut self, header: FrameHeader, budget_id: u64, reserved: i32, extension: Option<FlushEx>) {
        self.push(Frame::Flush(Flush {
            header,
            budget_id,
            reserved,
            extension,
        }));
    }

    pub fn end(&mut self, header: FrameHeader) {
        self.push(Frame::End(End { header }));
    }

    pub fn abort(&mut self, header: FrameHeader) {
        self.push(Frame::Abort(Abort { header }));
    }

    pub fn reset(&mut self, header: FrameHeader, error: Option<i16>) {
        self.push(Frame::Reset(Reset {
            header,
            extension: error.map(|error| ResetEx { error }),
        }));
    }

    pub fn window(&mut self, header: FrameHeader, budget_id: u64, padding: i32, minimum: i32) {
        self.push(Frame::Window(Window {
            header,
            budget_id,
            padding,
            minimum,
        }));
    }
}
