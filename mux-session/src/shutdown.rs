//! Graceful and forced shutdown.
//!
//! A graceful close sends GoAway once, stops new streams in both
//! directions and lets the live ones finish. When the last stream leaves
//! the table the writer flushes what is queued and closes the transport. A
//! GoAway from the peer triggers the same drain here.

use std::time::Instant;

use mux_protocol::{Frame, GoAwayCode};
use tracing::debug;

use crate::cx::Cx;
use crate::error::Result;
use crate::session::{Session, SessionState, Shared};

impl Shared {
    /// Enter `Draining`. `remote` is set when the peer's GoAway started it.
    ///
    /// Streams still waiting in the accept queue can no longer be accepted,
    /// so they are reset rather than waited for.
    pub(crate) fn begin_drain(&self, remote: bool) {
        let (send_go_away, unaccepted, drained) = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            if remote {
                inner.go_away_received = true;
            }
            let send_go_away = !inner.go_away_sent;
            inner.go_away_sent = true;
            if inner.state == SessionState::Established {
                inner.state = SessionState::Draining;
                inner.drain_deadline = self.config.drain_timeout.map(|t| Instant::now() + t);
                debug!(
                    role = %self.role,
                    remote,
                    streams = inner.streams.len(),
                    "draining session"
                );
            }
            let unaccepted: Vec<_> = inner.accept_queue.drain(..).collect();
            for stream in &unaccepted {
                inner.streams.remove(&stream.id());
                inner.half_closed.remove(&stream.id());
            }
            self.cond.notify_all();
            (send_go_away, unaccepted, inner.streams.is_empty())
        };
        if send_go_away {
            let _ = self
                .outbox
                .enqueue_control(Frame::go_away(GoAwayCode::Normal));
        }
        for stream in unaccepted {
            if stream.reset_local() {
                debug!(role = %self.role, stream_id = stream.id(), "resetting unaccepted stream");
                let _ = self.outbox.enqueue_lifecycle(Frame::reset(stream.id()));
            }
        }
        if drained {
            self.drained();
        }
    }

    /// The last stream of a draining session is gone.
    pub(crate) fn drained(&self) {
        debug!(role = %self.role, "drain complete");
        self.outbox.finish();
    }

    /// The peer sent GoAway and every stream is gone.
    pub(crate) fn peer_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.go_away_received && inner.streams.is_empty()
    }

    fn send_go_away(&self) -> Result<()> {
        let first = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return Err(inner.closed_error());
            }
            let first = !inner.go_away_sent;
            inner.go_away_sent = true;
            first
        };
        if first {
            debug!(role = %self.role, "sending go away");
            self.outbox
                .enqueue_control(Frame::go_away(GoAwayCode::Normal))?;
        }
        Ok(())
    }
}

impl Session {
    /// Start a graceful close and return. Use [`Session::wait_closed`] to
    /// wait for the drain to finish. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shared.begin_drain(false);
        Ok(())
    }

    /// Tell the peer we accept no more streams, without draining. Streams we
    /// open ourselves are unaffected.
    pub fn go_away(&self) -> Result<()> {
        self.shared.send_go_away()
    }

    /// Close now: every stream and blocked call fails with `SessionClosed`
    /// and the transport is closed.
    pub fn shutdown(&self) {
        self.shared.terminate(None);
    }

    /// Wait until the session is closed and its transport shut.
    pub fn wait_closed(&self, cx: &Cx) -> Result<()> {
        let _watch = self.shared.watch(cx);
        let mut inner = self.shared.inner.lock();
        loop {
            if inner.state == SessionState::Closed && self.shared.transport_closed() {
                return Ok(());
            }
            cx.wait(&self.shared.cond, &mut inner)?;
        }
    }
}
