//! Error taxonomy for sessions and streams.

use std::io;
use std::sync::Arc;

use mux_protocol::{ProtocolError, ReadError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    // -- protocol (always fatal to the session) -------------------------------
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // -- stream-local -----------------------------------------------------------
    #[error("stream closed")]
    StreamClosed,

    #[error("stream reset")]
    StreamReset,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("stream ids exhausted")]
    StreamsExhausted,

    #[error("timed out waiting to queue a frame")]
    ConnectionWriteTimeout,

    // -- session-fatal ----------------------------------------------------------
    #[error("keepalive timeout")]
    KeepaliveTimeout,

    #[error("session closed")]
    SessionClosed,

    #[error("remote end sent go away")]
    RemoteGoAway,

    #[error("remote end went away with error code {0:#x}")]
    RemoteGoAwayError(u32),

    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    // -- construction -----------------------------------------------------------
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    /// Whether this error ends the whole session rather than one call or one
    /// stream.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::KeepaliveTimeout
                | Self::SessionClosed
                | Self::RemoteGoAwayError(_)
                | Self::Io(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Protocol(p) => Self::Protocol(p),
            ReadError::Io(io) => Self::Io(Arc::new(io)),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Io(inner) => inner.kind(),
            Error::Timeout | Error::ConnectionWriteTimeout | Error::KeepaliveTimeout => {
                io::ErrorKind::TimedOut
            }
            Error::StreamReset => io::ErrorKind::ConnectionReset,
            Error::StreamClosed => io::ErrorKind::BrokenPipe,
            Error::SessionClosed | Error::RemoteGoAway | Error::RemoteGoAwayError(_) => {
                io::ErrorKind::ConnectionAborted
            }
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Protocol(_) => io::ErrorKind::InvalidData,
            Error::StreamsExhausted | Error::InvalidConfig(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::KeepaliveTimeout.is_session_fatal());
        assert!(Error::Protocol(ProtocolError::Truncated).is_session_fatal());
        assert!(Error::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_session_fatal());
        assert!(!Error::StreamReset.is_session_fatal());
        assert!(!Error::Timeout.is_session_fatal());
        assert!(!Error::RemoteGoAway.is_session_fatal());
    }

    #[test]
    fn io_error_kinds() {
        let e: io::Error = Error::Timeout.into();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);
        let e: io::Error = Error::StreamReset.into();
        assert_eq!(e.kind(), io::ErrorKind::ConnectionReset);
        let e: io::Error = Error::from(io::Error::from(io::ErrorKind::UnexpectedEof)).into();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn read_errors_split_by_kind() {
        let e: Error = ReadError::Protocol(ProtocolError::BadVersion(2)).into();
        assert!(matches!(e, Error::Protocol(ProtocolError::BadVersion(2))));
        let e: Error = ReadError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).into();
        assert!(matches!(e, Error::Io(_)));
    }
}
