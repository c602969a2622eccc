//! Logical streams.
//!
//! [`StreamCore`] is the pure lifecycle state machine. [`StreamShared`] is the
//! per-stream state the session's reader thread and the caller's [`Stream`]
//! handle both touch, guarded by one mutex and one condition variable.
//! The handle never takes the session lock while holding the stream lock.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use mux_protocol::{Flags, Frame, FrameType, ProtocolError, UNBOUNDED_WINDOW};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::cx::{Cx, Registration};
use crate::error::{Error, Result};
use crate::flow_control::{FlowController, SendCredit};
use crate::session::{Role, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    SynSent,
    SynReceived,
    Established,
    /// We sent FIN; the peer may still send.
    LocalClosed,
    /// The peer sent FIN; we may still send.
    RemoteClosed,
    Closed,
    Reset,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Reset)
    }
}

// ---------------------------------------------------------------------------
// StreamCore
// ---------------------------------------------------------------------------

/// Lifecycle transitions, free of I/O and locking.
///
/// `established` records that the SYN/ACK exchange completed. It is tracked
/// apart from `state` because either side may half-close before the
/// handshake finishes.
#[derive(Debug, Clone)]
pub(crate) struct StreamCore {
    state: StreamState,
    established: bool,
    needs_ack: bool,
}

impl StreamCore {
    pub(crate) fn new() -> Self {
        Self {
            state: StreamState::Idle,
            established: false,
            needs_ack: false,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn is_established(&self) -> bool {
        self.established
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn send_syn(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::SynSent;
        }
    }

    pub(crate) fn recv_syn(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::SynReceived;
            self.needs_ack = true;
        }
    }

    /// Returns true when an ACK is owed to the peer.
    pub(crate) fn send_ack(&mut self) -> bool {
        if !self.needs_ack || self.is_terminal() {
            return false;
        }
        self.needs_ack = false;
        self.established = true;
        if self.state == StreamState::SynReceived {
            self.state = StreamState::Established;
        }
        true
    }

    pub(crate) fn recv_ack(&mut self) {
        match self.state {
            StreamState::SynSent => {
                self.state = StreamState::Established;
                self.established = true;
            }
            StreamState::LocalClosed | StreamState::RemoteClosed if !self.needs_ack => {
                self.established = true;
            }
            _ => {}
        }
    }

    /// Whether our write half is still open.
    pub(crate) fn can_send(&self) -> bool {
        matches!(
            self.state,
            StreamState::SynSent
                | StreamState::SynReceived
                | StreamState::Established
                | StreamState::RemoteClosed
        )
    }

    /// Whether the peer's write half is still open.
    pub(crate) fn can_receive(&self) -> bool {
        matches!(
            self.state,
            StreamState::SynSent
                | StreamState::SynReceived
                | StreamState::Established
                | StreamState::LocalClosed
        )
    }

    /// Local half-close. Returns false if our write half was already shut.
    pub(crate) fn send_fin(&mut self) -> bool {
        self.state = match self.state {
            StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                StreamState::LocalClosed
            }
            StreamState::RemoteClosed => StreamState::Closed,
            _ => return false,
        };
        true
    }

    /// Remote half-close. Duplicate FINs return false and change nothing.
    pub(crate) fn recv_fin(&mut self) -> bool {
        self.state = match self.state {
            StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                StreamState::RemoteClosed
            }
            StreamState::LocalClosed => StreamState::Closed,
            _ => return false,
        };
        true
    }

    pub(crate) fn reset(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = StreamState::Reset;
        self.needs_ack = false;
        true
    }

    /// The session died under the stream. Returns whether the peer's write
    /// half was still open.
    pub(crate) fn fail(&mut self) -> bool {
        let receiving = self.can_receive();
        if !self.is_terminal() {
            self.state = StreamState::Closed;
        }
        self.needs_ack = false;
        receiving
    }
}

// ---------------------------------------------------------------------------
// StreamShared
// ---------------------------------------------------------------------------

struct StreamInner {
    core: StreamCore,
    flow: FlowController,
    inbound: VecDeque<u8>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    /// Writers holding send credit whose frame is not queued yet. A FIN
    /// waits for these so it never overtakes data.
    sending: usize,
    /// Set when the session dies.
    error: Option<Error>,
    /// The peer had already half-closed when the session died, so reads end
    /// with `Ok(0)` rather than the error.
    finished_before_error: bool,
}

pub(crate) struct StreamShared {
    id: u32,
    inner: Mutex<StreamInner>,
    cond: Condvar,
}

impl StreamShared {
    fn with_core(id: u32, core: StreamCore, flow: FlowController) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(StreamInner {
                core,
                flow,
                inbound: VecDeque::new(),
                read_deadline: None,
                write_deadline: None,
                sending: 0,
                error: None,
                finished_before_error: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// A stream we are opening. The caller queues the SYN.
    pub(crate) fn outbound(id: u32, flow: FlowController) -> Arc<Self> {
        let mut core = StreamCore::new();
        core.send_syn();
        Self::with_core(id, core, flow)
    }

    /// A stream the peer opened, waiting in the accept queue.
    pub(crate) fn inbound(id: u32, flow: FlowController) -> Arc<Self> {
        let mut core = StreamCore::new();
        core.recv_syn();
        Self::with_core(id, core, flow)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn state(&self) -> StreamState {
        self.inner.lock().core.state()
    }

    /// Apply a Data or WindowUpdate frame from the peer. Returns true once the
    /// stream has reached a terminal state and can leave the session table.
    pub(crate) fn on_frame(&self, frame: &Frame) -> std::result::Result<bool, ProtocolError> {
        let flags = frame.flags();
        let mut inner = self.inner.lock();

        if flags.contains(Flags::RST) {
            if inner.core.reset() {
                inner.inbound.clear();
                debug!(stream_id = self.id, "stream reset by peer");
            }
            self.cond.notify_all();
            return Ok(true);
        }

        if flags.contains(Flags::ACK) {
            inner.core.recv_ack();
        }

        match frame.frame_type() {
            FrameType::WindowUpdate => {
                let value = frame.header.length;
                if flags.contains(Flags::ACK) {
                    inner.flow.set_peer_window(value);
                } else if !flags.contains(Flags::SYN) {
                    inner.flow.on_window_update(value)?;
                }
            }
            FrameType::Data if !frame.payload.is_empty() => {
                if !inner.core.can_receive() {
                    return Err(ProtocolError::UnexpectedFrame(format!(
                        "data on stream {} after FIN",
                        self.id
                    )));
                }
                inner.flow.on_data_received(frame.payload.len() as u32)?;
                inner.inbound.extend(&frame.payload);
            }
            _ => {}
        }

        if flags.contains(Flags::FIN) && inner.core.recv_fin() {
            debug!(stream_id = self.id, state = ?inner.core.state(), "peer half-closed stream");
        }

        self.cond.notify_all();
        Ok(inner.core.is_terminal())
    }

    /// Complete the handshake for an accepted stream. Returns the ACK to send,
    /// announcing our receive window.
    pub(crate) fn accept(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if !inner.core.send_ack() {
            return None;
        }
        let window = if inner.flow.is_enabled() {
            inner.flow.max_window()
        } else {
            UNBOUNDED_WINDOW
        };
        self.cond.notify_all();
        Some(Frame::window_update(self.id, Flags::ACK, window))
    }

    /// Record a session-fatal error, close the stream and wake every
    /// waiter. Buffered bytes stay readable.
    pub(crate) fn fail(&self, err: Error) {
        let mut inner = self.inner.lock();
        if inner.error.is_none() {
            inner.finished_before_error = !inner.core.fail();
            inner.error = Some(err);
        }
        self.cond.notify_all();
    }

    /// Reset from our side. Returns true if a RST must be sent.
    pub(crate) fn reset_local(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.core.reset() {
            return false;
        }
        inner.inbound.clear();
        self.cond.notify_all();
        true
    }

    fn watch(self: &Arc<Self>, cx: &Cx) -> Option<Registration> {
        let this = Arc::clone(self);
        cx.watch(move || {
            let _inner = this.inner.lock();
            this.cond.notify_all();
        })
    }
}

// ---------------------------------------------------------------------------
// Stream handle
// ---------------------------------------------------------------------------

/// One bidirectional byte pipe inside a session.
///
/// All methods take `&self`, so one thread can read while another writes.
/// Dropping a stream whose write half is still open half-closes it.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Arc<Shared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Arc<Shared>) -> Self {
        Self { shared, session }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn session_role(&self) -> Role {
        self.session.role
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_with(&Cx::new(), buf)
    }

    /// Read into `buf`, blocking until data arrives.
    ///
    /// Returns `Ok(0)` once the peer has half-closed and the buffer is
    /// drained. Buffered bytes are returned before a session failure is
    /// reported; a reset discards them.
    pub fn read_with(&self, cx: &Cx, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let _watch = self.shared.watch(cx);
        let mut inner = self.shared.inner.lock();
        let cx = cx.or_deadline(inner.read_deadline);
        loop {
            if inner.core.state() == StreamState::Reset {
                return Err(Error::StreamReset);
            }
            if !inner.inbound.is_empty() {
                let n = buf.len().min(inner.inbound.len());
                for (dst, byte) in buf.iter_mut().zip(inner.inbound.drain(..n)) {
                    *dst = byte;
                }
                let buffered = u32::try_from(inner.inbound.len()).unwrap_or(u32::MAX);
                let update = inner.flow.on_data_consumed(buffered);
                let open = inner.core.can_receive();
                drop(inner);
                if let (Some(delta), true) = (update, open) {
                    self.session.send_window_update(self.shared.id, delta);
                }
                return Ok(n);
            }
            if let Some(err) = &inner.error {
                if inner.finished_before_error {
                    return Ok(0);
                }
                return Err(err.clone());
            }
            if !inner.core.can_receive() {
                return Ok(0);
            }
            cx.wait(&self.shared.cond, &mut inner)?;
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_with(&Cx::new(), data)
    }

    /// Send all of `data`, blocking while the peer's window is exhausted.
    ///
    /// If a failure interrupts a partially sent buffer, the count sent so far
    /// is returned; the next call reports the failure.
    pub fn write_with(&self, cx: &Cx, data: &[u8]) -> Result<usize> {
        let _watch = self.shared.watch(cx);
        let mut sent = 0;
        while sent < data.len() {
            match self.write_frame(cx, &data[sent..]) {
                Ok(n) => sent += n,
                Err(_) if sent > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Reserve credit for one frame's worth of `data` and queue it.
    fn write_frame(&self, cx: &Cx, data: &[u8]) -> Result<usize> {
        let want = data.len().min(self.session.config.max_frame_size as usize) as u32;
        let mut inner = self.shared.inner.lock();
        let cx = cx.or_deadline(inner.write_deadline);
        let n = loop {
            if inner.core.state() == StreamState::Reset {
                return Err(Error::StreamReset);
            }
            if let Some(err) = &inner.error {
                return Err(err.clone());
            }
            if !inner.core.can_send() {
                return Err(Error::StreamClosed);
            }
            if inner.core.is_established() {
                if let SendCredit::Allowed(n) = inner.flow.consume_send(want) {
                    break n;
                }
            }
            cx.wait(&self.shared.cond, &mut inner)?;
        };
        inner.sending += 1;
        drop(inner);

        let frame = Frame::data(self.shared.id, Flags::NONE, data[..n as usize].to_vec());
        let queued = self.session.outbox.enqueue_data(frame, &cx);

        let mut inner = self.shared.inner.lock();
        inner.sending -= 1;
        if queued.is_err() {
            inner.flow.refund_send(n);
        }
        self.shared.cond.notify_all();
        queued.map(|()| n as usize)
    }

    /// Half-close: no more data will be sent. The stream stays readable
    /// until the peer half-closes too.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        while inner.sending > 0 {
            self.shared.cond.wait(&mut inner);
        }
        if inner.error.is_some() {
            return Ok(());
        }
        if !inner.core.send_fin() {
            return match inner.core.state() {
                StreamState::Reset => Err(Error::StreamReset),
                _ => Ok(()),
            };
        }
        let state = inner.core.state();
        self.shared.cond.notify_all();
        drop(inner);

        debug!(stream_id = self.shared.id, ?state, "stream half-closed");
        let queued = self
            .session
            .outbox
            .enqueue_lifecycle(Frame::data(self.shared.id, Flags::FIN, Vec::new()));
        self.session.on_local_close(self.shared.id, state.is_terminal());
        queued
    }

    /// Abort the stream in both directions and discard buffered data.
    pub fn reset(&self) -> Result<()> {
        if !self.shared.reset_local() {
            return Ok(());
        }
        debug!(stream_id = self.shared.id, "stream reset");
        let queued = self.session.outbox.enqueue_lifecycle(Frame::reset(self.shared.id));
        self.session.remove_stream(self.shared.id);
        queued
    }

    /// Wait for the peer to acknowledge a stream we opened.
    pub fn wait_established(&self, cx: &Cx) -> Result<()> {
        let _watch = self.shared.watch(cx);
        let mut inner = self.shared.inner.lock();
        loop {
            if inner.core.is_established() {
                return Ok(());
            }
            if inner.core.state() == StreamState::Reset {
                return Err(Error::StreamReset);
            }
            if let Some(err) = &inner.error {
                return Err(err.clone());
            }
            cx.wait(&self.shared.cond, &mut inner)?;
        }
    }

    /// Default deadline for reads that carry none of their own. Wakes blocked
    /// readers so they pick up the change.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.shared.inner.lock();
        inner.read_deadline = deadline;
        self.shared.cond.notify_all();
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.shared.inner.lock();
        inner.write_deadline = deadline;
        self.shared.cond.notify_all();
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.shared.inner.lock();
        inner.read_deadline = deadline;
        inner.write_deadline = deadline;
        self.shared.cond.notify_all();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("role", &self.session.role)
            .finish()
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Read for &Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for &Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // === Lifecycle ===

    #[test]
    fn opener_handshake() {
        let mut core = StreamCore::new();
        core.send_syn();
        assert_eq!(core.state(), StreamState::SynSent);
        assert!(!core.is_established());
        core.recv_ack();
        assert_eq!(core.state(), StreamState::Established);
        assert!(core.is_established());
    }

    #[test]
    fn acceptor_handshake() {
        let mut core = StreamCore::new();
        core.recv_syn();
        assert_eq!(core.state(), StreamState::SynReceived);
        assert!(core.send_ack());
        assert_eq!(core.state(), StreamState::Established);
        assert!(!core.send_ack());
    }

    #[test]
    fn local_then_remote_close() {
        let mut core = established();
        assert!(core.send_fin());
        assert_eq!(core.state(), StreamState::LocalClosed);
        assert!(!core.can_send());
        assert!(core.can_receive());
        assert!(!core.send_fin());
        assert!(core.recv_fin());
        assert_eq!(core.state(), StreamState::Closed);
    }

    #[test]
    fn remote_then_local_close() {
        let mut core = established();
        assert!(core.recv_fin());
        assert_eq!(core.state(), StreamState::RemoteClosed);
        assert!(core.can_send());
        assert!(!core.recv_fin());
        assert!(core.send_fin());
        assert_eq!(core.state(), StreamState::Closed);
    }

    #[test]
    fn half_close_before_ack_keeps_pending_ack() {
        let mut core = StreamCore::new();
        core.recv_syn();
        assert!(core.recv_fin());
        assert_eq!(core.state(), StreamState::RemoteClosed);
        assert!(core.send_ack());
        assert_eq!(core.state(), StreamState::RemoteClosed);
        assert!(core.is_established());
    }

    #[test]
    fn opener_may_close_before_ack() {
        let mut core = StreamCore::new();
        core.send_syn();
        assert!(core.send_fin());
        assert_eq!(core.state(), StreamState::LocalClosed);
        core.recv_ack();
        assert!(core.is_established());
        assert_eq!(core.state(), StreamState::LocalClosed);
    }

    // === Reset ===

    #[test]
    fn reset_from_any_live_state() {
        for prep in [StreamCore::new(), established(), local_closed()] {
            let mut core = prep;
            assert!(core.reset());
            assert_eq!(core.state(), StreamState::Reset);
            assert!(!core.reset());
            assert!(!core.can_send());
            assert!(!core.can_receive());
        }
    }

    #[test]
    fn closed_stream_cannot_be_reset() {
        let mut core = local_closed();
        core.recv_fin();
        assert!(!core.reset());
        assert_eq!(core.state(), StreamState::Closed);
    }

    #[test]
    fn failure_closes_live_states() {
        let mut core = established();
        assert!(core.fail());
        assert_eq!(core.state(), StreamState::Closed);
        assert!(!core.can_send());

        let mut core = established();
        core.recv_fin();
        assert!(!core.fail());
        assert_eq!(core.state(), StreamState::Closed);

        let mut core = established();
        core.reset();
        core.fail();
        assert_eq!(core.state(), StreamState::Reset);
    }

    // === Frame application ===

    #[test]
    fn data_then_fin_buffers_and_closes_remote() {
        let stream = StreamShared::inbound(3, FlowController::new(3, 1024, 1024));
        assert!(!stream.on_frame(&Frame::data(3, Flags::NONE, b"abc".to_vec())).unwrap());
        assert!(!stream.on_frame(&Frame::data(3, Flags::FIN, Vec::new())).unwrap());
        assert_eq!(stream.state(), StreamState::RemoteClosed);
        assert_eq!(stream.inner.lock().inbound.len(), 3);
    }

    #[test]
    fn data_after_fin_is_protocol_error() {
        let stream = StreamShared::inbound(3, FlowController::new(3, 1024, 1024));
        stream.on_frame(&Frame::data(3, Flags::FIN, Vec::new())).unwrap();
        assert!(matches!(
            stream.on_frame(&Frame::data(3, Flags::NONE, b"x".to_vec())),
            Err(ProtocolError::UnexpectedFrame(_))
        ));
    }

    #[test]
    fn overrunning_window_is_violation() {
        let stream = StreamShared::inbound(5, FlowController::new(5, 1024, 4));
        assert!(matches!(
            stream.on_frame(&Frame::data(5, Flags::NONE, vec![0; 5])),
            Err(ProtocolError::FlowControlViolation { stream_id: 5, .. })
        ));
    }

    #[test]
    fn ack_seeds_send_window() {
        let stream = StreamShared::outbound(1, FlowController::new(1, 0, 1024));
        stream.on_frame(&Frame::window_update(1, Flags::ACK, 4096)).unwrap();
        let inner = stream.inner.lock();
        assert!(inner.core.is_established());
        assert_eq!(inner.flow.send_window(), 4096);
    }

    #[test]
    fn rst_discards_buffer() {
        let stream = StreamShared::inbound(7, FlowController::new(7, 1024, 1024));
        stream.on_frame(&Frame::data(7, Flags::NONE, b"lost".to_vec())).unwrap();
        assert!(stream.on_frame(&Frame::reset(7)).unwrap());
        assert_eq!(stream.state(), StreamState::Reset);
        assert!(stream.inner.lock().inbound.is_empty());
    }

    #[test]
    fn failed_stream_serves_buffer_then_error() {
        let stream = StreamShared::inbound(9, FlowController::new(9, 1024, 1024));
        stream.on_frame(&Frame::data(9, Flags::NONE, b"kept".to_vec())).unwrap();
        stream.fail(Error::SessionClosed);
        stream.fail(Error::KeepaliveTimeout);

        let inner = stream.inner.lock();
        assert_eq!(inner.core.state(), StreamState::Closed);
        assert_eq!(inner.inbound.len(), 4);
        assert!(matches!(inner.error, Some(Error::SessionClosed)));
        assert!(!inner.finished_before_error);
    }

    #[test]
    fn failure_after_remote_fin_reads_as_end_of_stream() {
        let stream = StreamShared::inbound(11, FlowController::new(11, 1024, 1024));
        stream.on_frame(&Frame::data(11, Flags::FIN, Vec::new())).unwrap();
        stream.fail(Error::SessionClosed);
        assert!(stream.inner.lock().finished_before_error);
    }

    #[test]
    fn accept_announces_window() {
        let stream = StreamShared::inbound(2, FlowController::new(2, 1024, 8192));
        let ack = stream.accept().unwrap();
        assert_eq!(ack.flags(), Flags::ACK);
        assert_eq!(ack.header.length, 8192);
        assert!(stream.accept().is_none());

        let unbounded = StreamShared::inbound(4, FlowController::unbounded(4));
        assert_eq!(unbounded.accept().unwrap().header.length, UNBOUNDED_WINDOW);
    }

    fn established() -> StreamCore {
        let mut core = StreamCore::new();
        core.send_syn();
        core.recv_ack();
        core
    }

    fn local_closed() -> StreamCore {
        let mut core = established();
        core.send_fin();
        core
    }
}
