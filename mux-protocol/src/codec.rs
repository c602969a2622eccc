//! Buffer read/write helpers and Encode/Decode traits for frame parsing.

use crate::error::{ProtocolError, Result};

// ---------------------------------------------------------------------------
// Cursor: zero-copy reader over a byte slice
// ---------------------------------------------------------------------------

/// A cursor for reading big-endian fields from a byte slice.
///
/// Tracks the current read position and ensures bounds checking.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a new cursor over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Remaining unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current read position (bytes consumed so far).
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The unread portion of the buffer.
    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(ProtocolError::BufferTooShort);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Read a big-endian u16 (2 bytes).
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32 (4 bytes).
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read exactly `len` bytes, returning a sub-slice.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::BufferTooShort);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

// ---------------------------------------------------------------------------
// Encode / Decode traits
// ---------------------------------------------------------------------------

/// Trait for types that can be encoded to a byte buffer.
pub trait Encode {
    /// Encode this value, appending bytes to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Convenience: encode to a new `Vec<u8>`.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Trait for types that can be decoded from a byte cursor.
pub trait Decode: Sized {
    /// Decode a value from the cursor, advancing its position.
    fn decode(cursor: &mut Cursor<'_>) -> Result<Self>;
}

// ---------------------------------------------------------------------------
// Buffer write helpers
// ---------------------------------------------------------------------------

/// Write a single byte.
pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

/// Write a big-endian u16.
pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Write a big-endian u32.
pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Write raw bytes.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
}
