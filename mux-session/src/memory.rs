//! In-process duplex pipe, for tests and for bridging sessions inside one
//! process (nested pivots terminating locally).

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::transport::{Transport, TransportCloser};

/// Bytes a pipe direction buffers before writers block.
pub const DEFAULT_PIPE_CAPACITY: usize = 256 * 1024;

/// One direction of a pipe.
struct Channel {
    state: Mutex<ChannelState>,
    cond: Condvar,
    capacity: usize,
}

struct ChannelState {
    buf: VecDeque<u8>,
    closed: bool,
}

impl Channel {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChannelState {
                buf: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        })
    }

    fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        while state.buf.is_empty() {
            if state.closed {
                return Ok(0);
            }
            self.cond.wait(&mut state);
        }
        let n = out.len().min(state.buf.len());
        for (slot, byte) in out.iter_mut().zip(state.buf.drain(..n)) {
            *slot = byte;
        }
        self.cond.notify_all();
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            let room = self.capacity.saturating_sub(state.buf.len());
            if room > 0 {
                let n = room.min(data.len());
                state.buf.extend(&data[..n]);
                self.cond.notify_all();
                return Ok(n);
            }
            self.cond.wait(&mut state);
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// One end of an in-memory duplex pipe.
pub struct Pipe {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
}

/// Create a connected pair of pipe ends.
pub fn pipe() -> (Pipe, Pipe) {
    pipe_with_capacity(DEFAULT_PIPE_CAPACITY)
}

pub fn pipe_with_capacity(capacity: usize) -> (Pipe, Pipe) {
    let a_to_b = Channel::new(capacity.max(1));
    let b_to_a = Channel::new(capacity.max(1));
    (
        Pipe {
            rx: b_to_a.clone(),
            tx: a_to_b.clone(),
        },
        Pipe {
            rx: a_to_b,
            tx: b_to_a,
        },
    )
}

impl Pipe {
    /// Close both directions. Pending and future reads on either end see
    /// end-of-stream once buffered bytes are consumed; writes fail.
    pub fn close(&self) {
        self.tx.close();
        self.rx.close();
    }

    fn closer(&self) -> PipeCloser {
        PipeCloser {
            rx: self.rx.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Arc<Channel>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }
}

pub struct PipeWriter {
    tx: Arc<Channel>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PipeCloser {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
}

impl TransportCloser for PipeCloser {
    fn close(&self) -> io::Result<()> {
        self.tx.close();
        self.rx.close();
        Ok(())
    }
}

impl Transport for Pipe {
    type Reader = PipeReader;
    type Writer = PipeWriter;

    fn split(self) -> io::Result<(PipeReader, PipeWriter, Box<dyn TransportCloser>)> {
        let closer = self.closer();
        Ok((
            PipeReader { rx: self.rx },
            PipeWriter { tx: self.tx },
            Box::new(closer),
        ))
    }
}
