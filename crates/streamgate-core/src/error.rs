//! Error Types for StreamGate
//!
//! ## Error Categories
//!
//! ### Frame Errors
//! - `MissingExtension`: a frame arrived without the extension its kind requires
//! - `UnexpectedExtension`: the extension belongs to the other direction (fetch vs produce)
//! - `UnknownStream`: no fan-out or member owns the stream id
//!
//! ### Routing Errors
//! - `UnknownTopic`: the router has no route for the topic
//!
//! ## Broker Error Codes
//!
//! Errors reported to clients travel inside RESET extensions as numeric codes
//! that mirror the upstream broker's taxonomy. [`ErrorCode`] names the subset
//! the data plane produces or reacts to.
//! See: https://kafka.apache.org/protocol#protocol_error_codes

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing {0} extension")]
    MissingExtension(&'static str),

    #[error("Unexpected extension on {0} frame")]
    UnexpectedExtension(&'static str),

    #[error("Unknown stream: {0}")]
    UnknownStream(u64),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Broker error codes carried by RESET extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ErrorCode {
    None = 0,
    UnknownServerError = -1,
    CorruptMessage = 2,
    UnknownTopicOrPartition = 3,
    NotLeaderOrFollower = 6,
    RequestTimedOut = 7,
    RecordListTooLarge = 18,
    InvalidRecord = 87,
}

impl ErrorCode {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Map a raw code back to a known variant; unrecognised codes become
    /// `UnknownServerError`.
    pub fn from_i16(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            2 => ErrorCode::CorruptMessage,
            3 => ErrorCode::UnknownTopicOrPartition,
            6 => ErrorCode::NotLeaderOrFollower,
            7 => ErrorCode::RequestTimedOut,
            18 => ErrorCode::RecordListTooLarge,
            87 => ErrorCode::InvalidRecord,
            _ => ErrorCode::UnknownServerError,
        }
    }
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::UnknownTopic(_) => ErrorCode::UnknownTopicOrPartition,
            Error::MissingExtension(_) | Error::UnexpectedExtension(_) | Error::InvalidFrame(_) => {
                ErrorCode::CorruptMessage
            }
            Error::UnknownStream(_) => ErrorCode::UnknownServerError,
        }
    }
}
