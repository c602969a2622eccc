//! Frame header, flags and frame constructors.
//!
//! Every frame starts with a fixed 12-byte header in network byte order:
//!
//! ```text
//! +---------+------+-------+-----------+--------+
//! | version | type | flags | stream id | length |
//! |   u8    |  u8  |  u16  |    u32    |  u32   |
//! +---------+------+-------+-----------+--------+
//! ```
//!
//! Only Data frames carry a payload; for the other types `length` is an
//! opaque value (window delta, ping id, go-away code).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::codec::{write_bytes, write_u16, write_u32, write_u8, Cursor, Decode, Encode};
use crate::error::{GoAwayCode, ProtocolError, Result};

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 0;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 12;

/// Stream id reserved for session-level frames (Ping, GoAway).
pub const SESSION_STREAM_ID: u32 = 0;

/// Window announcement that asks the peer to skip flow control on a stream.
pub const UNBOUNDED_WINDOW: u32 = u32::MAX;

const TYPE_DATA: u8 = 0;
const TYPE_WINDOW_UPDATE: u8 = 1;
const TYPE_PING: u8 = 2;
const TYPE_GO_AWAY: u8 = 3;

// ---------------------------------------------------------------------------
// Frame type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    WindowUpdate,
    Ping,
    GoAway,
    /// A type byte this version does not know. Decoded so the session can
    /// skip it; never produced locally.
    Unknown(u8),
}

impl FrameType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            TYPE_DATA => Self::Data,
            TYPE_WINDOW_UPDATE => Self::WindowUpdate,
            TYPE_PING => Self::Ping,
            TYPE_GO_AWAY => Self::GoAway,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => TYPE_DATA,
            Self::WindowUpdate => TYPE_WINDOW_UPDATE,
            Self::Ping => TYPE_PING,
            Self::GoAway => TYPE_GO_AWAY,
            Self::Unknown(v) => v,
        }
    }

    /// Whether `length` counts payload bytes following the header.
    pub fn has_payload(self) -> bool {
        self == Self::Data
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Header flag bitset. Unknown bits survive a decode/encode cycle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Opens a stream, or marks a Ping as a request.
    pub const SYN: Flags = Flags(0x1);
    /// Acknowledges a stream open, or marks a Ping as a response.
    pub const ACK: Flags = Flags(0x2);
    /// Half-closes the sender's direction of a stream.
    pub const FIN: Flags = Flags(0x4);
    /// Abruptly resets a stream.
    pub const RST: Flags = Flags(0x8);

    pub fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    /// True if any stream lifecycle flag is set.
    pub fn has_lifecycle(self) -> bool {
        self.0 & (Self::SYN.0 | Self::ACK.0 | Self::FIN.0 | Self::RST.0) != 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unknown = self.0 & !0xF;
        if unknown != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{unknown:#x}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn new(frame_type: FrameType, flags: Flags, stream_id: u32, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    /// Reject headers this endpoint must not process. `max_frame_size`
    /// bounds Data payloads only.
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(self.version));
        }
        if self.frame_type.has_payload() && self.length > max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                length: self.length,
                max: max_frame_size,
            });
        }
        Ok(())
    }

    /// Number of payload bytes that follow this header on the wire.
    pub fn payload_len(&self) -> usize {
        if self.frame_type.has_payload() {
            self.length as usize
        } else {
            0
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.frame_type.as_u8();
        out[2..4].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out
    }
}

impl Encode for Header {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u8(buf, self.version);
        write_u8(buf, self.frame_type.as_u8());
        write_u16(buf, self.flags.bits());
        write_u32(buf, self.stream_id);
        write_u32(buf, self.length);
    }
}

impl Decode for Header {
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self> {
        if cursor.remaining() < HEADER_LEN {
            return Err(ProtocolError::BufferTooShort);
        }
        Ok(Self {
            version: cursor.read_u8()?,
            frame_type: FrameType::from_u8(cursor.read_u8()?),
            flags: Flags::from_bits(cursor.read_u16()?),
            stream_id: cursor.read_u32()?,
            length: cursor.read_u32()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A Data frame. `length` is derived from the payload.
    pub fn data(stream_id: u32, flags: Flags, payload: Vec<u8>) -> Self {
        Self {
            header: Header::new(FrameType::Data, flags, stream_id, payload.len() as u32),
            payload,
        }
    }

    pub fn window_update(stream_id: u32, flags: Flags, delta: u32) -> Self {
        Self::control(FrameType::WindowUpdate, flags, stream_id, delta)
    }

    /// A RST for `stream_id`, carried on a WindowUpdate frame with no delta.
    pub fn reset(stream_id: u32) -> Self {
        Self::window_update(stream_id, Flags::RST, 0)
    }

    pub fn ping(id: u32) -> Self {
        Self::control(FrameType::Ping, Flags::SYN, SESSION_STREAM_ID, id)
    }

    pub fn pong(id: u32) -> Self {
        Self::control(FrameType::Ping, Flags::ACK, SESSION_STREAM_ID, id)
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        Self::control(FrameType::GoAway, Flags::NONE, SESSION_STREAM_ID, code.as_u32())
    }

    fn control(frame_type: FrameType, flags: Flags, stream_id: u32, value: u32) -> Self {
        Self {
            header: Header::new(frame_type, flags, stream_id, value),
            payload: Vec::new(),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    /// Total bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Decode one complete frame from the front of `buf`, returning it with
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8], max_frame_size: u32) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(buf);
        let header = Header::decode(&mut cursor)?;
        header.validate(max_frame_size)?;
        let payload = cursor.read_bytes(header.payload_len())?.to_vec();
        Ok((Self { header, payload }, cursor.position()))
    }
}

impl Encode for Frame {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.wire_len());
        self.header.encode(buf);
        write_bytes(buf, &self.payload);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("type", &self.header.frame_type)
            .field("flags", &self.header.flags)
            .field("stream_id", &self.header.stream_id)
            .field("length", &self.header.length)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Incremental parser
// ---------------------------------------------------------------------------

/// Incremental frame parser for callers that receive the connection in
/// arbitrary chunks (HTTP polling, message-oriented carriers).
#[derive(Debug)]
pub struct FrameParser {
    buf: Vec<u8>,
    max_frame_size: u32,
}

impl FrameParser {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Append `data` and return every frame that is now complete. Parsing
    /// stops at the first protocol error, which is returned last. Framing
    /// cannot be recovered after an error, so the buffered bytes are
    /// discarded along with the rest of `data`.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Frame>> {
        self.buf.extend_from_slice(data);
        let mut results = Vec::new();

        loop {
            match Frame::decode(&self.buf, self.max_frame_size) {
                Ok((frame, consumed)) => {
                    self.buf.drain(..consumed);
                    results.push(Ok(frame));
                }
                Err(ProtocolError::BufferTooShort) => break,
                Err(e) => {
                    self.buf.clear();
                    results.push(Err(e));
                    break;
                }
            }
        }

        results
    }

    /// Bytes held while waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
