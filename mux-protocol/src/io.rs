//! Blocking frame I/O over `std::io` readers and writers.

use std::io::{self, Read, Write};

use crate::codec::{Cursor, Decode, Encode};
use crate::error::{ProtocolError, ReadError};
use crate::frame::{Frame, Header, HEADER_LEN};

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` when the reader reports end-of-stream exactly on a
/// frame boundary. End-of-stream anywhere inside a frame is
/// [`ProtocolError::Truncated`].
pub fn read_frame<R: Read + ?Sized>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<Option<Frame>, ReadError> {
    let mut raw = [0u8; HEADER_LEN];
    match fill(reader, &mut raw)? {
        0 => return Ok(None),
        n if n < HEADER_LEN => return Err(ProtocolError::Truncated.into()),
        _ => {}
    }

    let header = Header::decode(&mut Cursor::new(&raw))?;
    header.validate(max_frame_size)?;

    let mut payload = vec![0u8; header.payload_len()];
    if fill(reader, &mut payload)? < payload.len() {
        return Err(ProtocolError::Truncated.into());
    }

    Ok(Some(Frame { header, payload }))
}

/// Write one frame to `writer` as a single buffer so header and payload are
/// never split across concurrent writers sharing the same sink.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let bytes = frame.encode_to_vec();
    writer.write_all(&bytes)
}

/// Read until `buf` is full or the reader hits end-of-stream. Returns the
/// number of bytes read.
fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
