//! The boundary to the underlying ordered, reliable byte connection.
//!
//! A session needs three things from its carrier: a read half owned by the
//! reader thread, a write half owned by the writer thread, and a way to
//! tear the connection down that also unblocks a pending read.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// Closes the underlying connection. Must make a blocked `read` on the
/// reader half return.
pub trait TransportCloser: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

impl<F> TransportCloser for F
where
    F: Fn() -> io::Result<()> + Send + Sync,
{
    fn close(&self) -> io::Result<()> {
        self()
    }
}

pub trait Transport: Send + 'static {
    type Reader: Read + Send + 'static;
    type Writer: Write + Send + 'static;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer, Box<dyn TransportCloser>)>;
}

impl Transport for TcpStream {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn split(self) -> io::Result<(TcpStream, TcpStream, Box<dyn TransportCloser>)> {
        // Nagle would hold back small control frames behind unacked data.
        self.set_nodelay(true)?;
        let reader = self.try_clone()?;
        let closer = self.try_clone()?;
        Ok((
            reader,
            self,
            Box::new(move || match closer.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            }),
        ))
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    type Reader = std::os::unix::net::UnixStream;
    type Writer = std::os::unix::net::UnixStream;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer, Box<dyn TransportCloser>)> {
        let reader = self.try_clone()?;
        let closer = self.try_clone()?;
        Ok((
            reader,
            self,
            Box::new(move || match closer.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            }),
        ))
    }
}

/// Pre-split halves for carriers that cannot be cloned (TLS sessions
/// wrapped elsewhere, HTTP polling bridges).
pub struct Halves<R, W> {
    reader: R,
    writer: W,
    closer: Box<dyn TransportCloser>,
}

impl<R, W> Halves<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    pub fn new(reader: R, writer: W, closer: impl TransportCloser + 'static) -> Self {
        Self {
            reader,
            writer,
            closer: Box::new(closer),
        }
    }
}

impl<R, W> Transport for Halves<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    type Reader = R;
    type Writer = W;

    fn split(self) -> io::Result<(R, W, Box<dyn TransportCloser>)> {
        Ok((self.reader, self.writer, self.closer))
    }
}
