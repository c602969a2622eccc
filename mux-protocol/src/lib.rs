pub mod codec;
pub mod error;
pub mod frame;
pub mod io;

pub use codec::{Cursor, Decode, Encode};
pub use error::{GoAwayCode, ProtocolError, ReadError, Result};
pub use frame::{
    Flags, Frame, FrameParser, FrameType, Header, HEADER_LEN, PROTOCOL_VERSION,
    SESSION_STREAM_ID, UNBOUNDED_WINDOW,
};
pub use io::{read_frame, write_frame};
