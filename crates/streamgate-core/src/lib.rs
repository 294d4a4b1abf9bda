//! StreamGate Core
//!
//! Shared vocabulary of the streamgate data plane: the frame model exchanged
//! with downstream clients and upstream brokers, offset and isolation policy,
//! the per-half stream state machine, filter definitions and error codes.
//!
//! ## Streams
//!
//! Every logical stream has two halves. The *initial* half flows from the
//! stream's opener to its receiver, the *reply* half flows back. Each half
//! is flow controlled on its own with `sequence`, `acknowledge` and `maximum`:
//!
//! ```text
//!   sender                          receiver
//!     │  BEGIN / DATA / FLUSH / END  │
//!     │ ───────────────────────────▶ │   initial half
//!     │ ◀─────────────────────────── │
//!     │        WINDOW / RESET        │
//! ```
//!
//! Initial stream ids are odd and the matching reply id is `initial_id ^ 1`.

pub mod error;
pub mod filter;
pub mod frame;
pub mod offset;
pub mod record;
pub mod state;
pub mod stream_id;

pub use error::{Error, ErrorCode, Result};
pub use filter::{Condition, Filter, ValueMatch};
pub use frame::{
    Abort, Begin, BeginEx, Data, DataEx, End, FetchBeginEx, FetchDataEx, FetchFlushEx, Flush,
    FlushEx, Frame, FrameHeader, FrameKind, ProduceBeginEx, ProduceDataEx, ProduceFlushEx, Reset,
    ResetEx, Signal, Transaction, Window,
};
pub use offset::{
    AckMode, DeltaType, Evaluation, Isolation, OffsetType, PartitionProgress, TransactionResult,
};
pub use record::Header;
pub use state::{HalfState, StreamState};
pub use stream_id::StreamIds;
