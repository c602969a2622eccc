//! The outbox and the writer thread that drains it.
//!
//! Every outbound frame passes through [`Outbox`], so only the writer thread
//! ever touches the transport's write half and frames never interleave.
//! Two FIFO queues:
//!
//! - control: window updates, pings, pongs, GoAway and RSTs for streams the
//!   session no longer tracks. Drained first, never blocks the caller.
//! - stream: Data frames plus SYN/ACK/FIN/RST for live streams, in the order
//!   the streams produced them. Data is bounded by `write_queue_depth`.

use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mux_protocol::{write_frame, Frame};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::cx::Cx;
use crate::error::{Error, Result};
use crate::session::Shared;

/// Control frames that may pile up before pongs and unsolicited RSTs are
/// dropped.
pub const MAX_PENDING_CONTROL: usize = 64;

pub(crate) struct Outbox {
    inner: Mutex<OutboxInner>,
    /// Signals the writer that there is work.
    ready: Condvar,
    /// Signals blocked senders that the stream queue has room.
    space: Condvar,
    depth: usize,
    write_timeout: Duration,
}

struct OutboxInner {
    control: VecDeque<Frame>,
    frames: VecDeque<Frame>,
    /// Set once no further frames will be written.
    closed: Option<Error>,
    /// Write what is queued, then stop.
    finishing: bool,
    /// Stop after the control queue; the stream queue was discarded.
    aborted: bool,
}

/// What the writer should do next.
pub(crate) enum Pull {
    Frame(Frame),
    Flush,
    Done,
}

impl Outbox {
    pub(crate) fn new(depth: usize, write_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(OutboxInner {
                control: VecDeque::new(),
                frames: VecDeque::new(),
                closed: None,
                finishing: false,
                aborted: false,
            }),
            ready: Condvar::new(),
            space: Condvar::new(),
            depth,
            write_timeout,
        })
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Queue a Data frame, waiting for room in the stream queue.
    ///
    /// Fails with `ConnectionWriteTimeout` once `connection_write_timeout`
    /// passes, or with the caller's own timeout if that comes first.
    pub(crate) fn enqueue_data(self: &Arc<Self>, frame: Frame, cx: &Cx) -> Result<()> {
        let limit = Instant::now() + self.write_timeout;
        let this = Arc::clone(self);
        let _watch = cx.watch(move || {
            let _inner = this.inner.lock();
            this.space.notify_all();
        });

        let mut inner = self.inner.lock();
        loop {
            if let Some(err) = &inner.closed {
                return Err(err.clone());
            }
            if inner.frames.len() < self.depth {
                inner.frames.push_back(frame);
                self.ready.notify_one();
                return Ok(());
            }
            cx.check()?;
            if Instant::now() >= limit {
                return Err(Error::ConnectionWriteTimeout);
            }
            let until = cx.deadline().map_or(limit, |d| d.min(limit));
            self.space.wait_until(&mut inner, until);
        }
    }

    /// Queue a SYN, ACK, FIN or RST for a live stream. Never blocks, so
    /// handshakes and teardown still go out when data has filled the queue.
    pub(crate) fn enqueue_lifecycle(&self, frame: Frame) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        inner.frames.push_back(frame);
        self.ready.notify_one();
        Ok(())
    }

    pub(crate) fn enqueue_control(&self, frame: Frame) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        inner.control.push_back(frame);
        self.ready.notify_one();
        Ok(())
    }

    /// Queue a frame the peer solicited (a pong, a RST for an unknown
    /// stream). Dropped when the control queue is already full, so a peer
    /// flooding us cannot grow it without bound. Returns false if dropped.
    pub(crate) fn enqueue_reply(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return false;
        }
        if inner.control.len() >= MAX_PENDING_CONTROL {
            warn!(frame = ?frame, "control queue full, dropping reply");
            return false;
        }
        inner.control.push_back(frame);
        self.ready.notify_one();
        true
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Let the writer exit once both queues are empty.
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.finishing = true;
        self.ready.notify_all();
    }

    /// Discard queued stream frames and refuse new ones. `last` (a GoAway
    /// explaining the failure) is still written if the transport allows.
    pub(crate) fn abort(&self, err: Error, last: Option<Frame>) {
        let mut inner = self.inner.lock();
        if inner.closed.is_none() {
            inner.closed = Some(err);
        }
        inner.frames.clear();
        inner.control.clear();
        if let Some(frame) = last {
            inner.control.push_back(frame);
        }
        inner.aborted = true;
        inner.finishing = true;
        self.ready.notify_all();
        self.space.notify_all();
    }

    /// Called by the writer on its way out.
    fn close(&self, err: Error) {
        let mut inner = self.inner.lock();
        if inner.closed.is_none() {
            inner.closed = Some(err);
        }
        inner.frames.clear();
        inner.control.clear();
        self.space.notify_all();
    }

    /// Next action for the writer. `flushed` says whether everything written
    /// so far has been flushed; the writer is asked to flush before it idles.
    pub(crate) fn pull(&self, flushed: bool) -> Pull {
        let mut inner = self.inner.lock();
        loop {
            if let Some(frame) = inner.control.pop_front() {
                return Pull::Frame(frame);
            }
            if !inner.aborted {
                if let Some(frame) = inner.frames.pop_front() {
                    self.space.notify_one();
                    return Pull::Frame(frame);
                }
            }
            if !flushed {
                return Pull::Flush;
            }
            if inner.finishing {
                return Pull::Done;
            }
            self.ready.wait(&mut inner);
        }
    }

    #[cfg(test)]
    fn queued(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.control.len(), inner.frames.len())
    }
}

// ---------------------------------------------------------------------------
// Writer thread
// ---------------------------------------------------------------------------

pub(crate) fn run_writer<W: Write>(shared: Arc<Shared>, writer: W) {
    let mut writer = BufWriter::new(writer);
    let mut flushed = true;
    let outcome = loop {
        match shared.outbox.pull(flushed) {
            Pull::Frame(frame) => {
                trace!(?frame, "send");
                if let Err(e) = write_frame(&mut writer, &frame) {
                    break Err(e);
                }
                flushed = false;
            }
            Pull::Flush => {
                if let Err(e) = writer.flush() {
                    break Err(e);
                }
                flushed = true;
            }
            Pull::Done => break Ok(()),
        }
    };

    match outcome {
        Ok(()) => {
            shared.outbox.close(Error::SessionClosed);
            shared.finish();
        }
        // The peer said GoAway and nothing is left to deliver, so it hanging
        // up first is a clean end.
        Err(e) if shared.peer_finished() => {
            debug!(error = %e, "peer hung up after drain");
            shared.outbox.close(Error::SessionClosed);
            shared.finish();
        }
        Err(e) => {
            let err = Error::from(e);
            shared.outbox.close(err.clone());
            shared.terminate(Some(err));
        }
    }
    shared.close_transport();
}
