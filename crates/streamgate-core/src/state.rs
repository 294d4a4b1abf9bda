//! Stream half state machine.
//!
//! ```text
//!   Idle ──▶ Opening ──▶ Opened ──▶ Closing ──▶ Closed
//!     └──────────┴──────────┴──────────┴──────────▲
//!                 reset / abort from either side
//! ```
//!
//! Transitions only move forward. Moving a half to a state it has already
//! passed is a no-op, which makes every cleanup path safe to run twice.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HalfState {
    #[default]
    Idle,
    Opening,
    Opened,
    Closing,
    Closed,
}

impl HalfState {
    fn advance(&mut self, next: HalfState) {
        *self = (*self).max(next);
    }
}

/// State of both halves of one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamState {
    pub initial: HalfState,
    pub reply: HalfState,
}

impl StreamState {
    pub fn initial_opening(&mut self) {
        self.initial.advance(HalfState::Opening);
    }

    pub fn initial_opened(&mut self) {
        self.initial.advance(HalfState::Opened);
    }

    pub fn initial_closing(&mut self) {
        self.initial.advance(HalfState::Closing);
    }

    pub fn initial_closed(&mut self) {
        self.initial.advance(HalfState::Closed);
    }

    pub fn reply_opening(&mut self) {
        self.reply.advance(HalfState::Opening);
    }

    pub fn reply_opened(&mut self) {
        self.reply.advance(HalfState::Opened);
    }

    pub fn reply_closing(&mut self) {
        self.reply.advance(HalfState::Closing);
    }

    pub fn reply_closed(&mut self) {
        self.reply.advance(HalfState::Closed);
    }

    pub fn is_initial_opening(&self) -> bool {
        self.initial >= HalfState::Opening
    }

    pub fn is_initial_opened(&self) -> bool {
        self.initial >= HalfState::Opened
    }

    pub fn is_initial_closing(&self) -> bool {
        self.initial >= HalfState::Closing
    }

    pub fn is_initial_closed(&self) -> bool {
        self.initial == HalfState::Closed
    }

    pub fn is_reply_opening(&self) -> bool {
        self.reply >= HalfState::Opening
    }

    pub fn is_reply_opened(&self) -> bool {
        self.reply >= HalfState::Opened
    }

    pub fn is_reply_closing(&self) -> bool {
        self.reply >= HalfState::Closing
    }

    pub fn is_reply_closed(&self) -> bool {
        self.reply == HalfState::Closed
    }

    /// Both halves closed.
    pub fn is_closed(&self) -> bool {
        self.is_initial_closed() && self.is_reply_closed()
    }

    /// Half was opened by us and not yet closed: eligible for END, ABORT or RESET.
    pub fn initial_active(&self) -> bool {
        self.is_initial_opening() && !self.is_initial_closed()
    }

    pub fn reply_active(&self) -> bool {
        self.is_reply_opening() && !self.is_reply_closed()
    }
}
