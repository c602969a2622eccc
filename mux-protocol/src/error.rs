use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Violations of the wire protocol. Every one of these is fatal to the
/// session that observed it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("buffer too short")]
    BufferTooShort,

    #[error("unsupported protocol version: {0}")]
    BadVersion(u8),

    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("invalid stream id: {0}")]
    InvalidStreamId(u32),

    #[error("duplicate stream id: {0}")]
    DuplicateStream(u32),

    #[error("flow control violation on stream {stream_id}: {received} bytes against window {window}")]
    FlowControlViolation {
        stream_id: u32,
        received: u32,
        window: u32,
    },

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
}

/// Failure while pulling a frame off a blocking reader.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Reason carried in the length field of a GoAway frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GoAwayCode {
    Normal = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
}

impl GoAwayCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0 => Some(Self::Normal),
            0x1 => Some(Self::ProtocolError),
            0x2 => Some(Self::InternalError),
            _ => None,
        }
    }
}
