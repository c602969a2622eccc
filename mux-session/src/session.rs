//! Sessions: one transport carrying many streams.
//!
//! A session runs three threads for its whole life, however many streams it
//! carries: the reader (decode and dispatch), the writer (drain the
//! [`Outbox`]) and the monitor (keepalive and timers). Everything they
//! share lives in [`Shared`] behind one mutex.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mux_protocol::{
    read_frame, Flags, Frame, FrameType, GoAwayCode, ProtocolError, SESSION_STREAM_ID,
    UNBOUNDED_WINDOW,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, debug_span, error, trace, warn};

use crate::config::Config;
use crate::cx::{Cx, Registration};
use crate::error::{Error, Result};
use crate::flow_control::FlowController;
use crate::monitor::run_monitor;
use crate::stream::{Stream, StreamShared};
use crate::transport::{Transport, TransportCloser};
use crate::writer::{run_writer, Outbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opens odd stream ids.
    Client,
    /// Opens even stream ids.
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// Whether `id` belongs to the id space this role opens from.
    pub fn owns(self, id: u32) -> bool {
        id % 2 == self.first_stream_id() % 2
    }

    pub fn peer(self) -> Role {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Established,
    /// GoAway exchanged; existing streams finish, no new ones start.
    Draining,
    Closed,
}

/// Per-stream options for [`Session::open_with`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Window the stream. Without it the peer must allow unbounded streams
    /// or it will refuse the open.
    pub flow_control: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { flow_control: true }
    }
}

struct PingSlot {
    sent: Instant,
    rtt: Option<Duration>,
    /// A caller is blocked in `ping` for this slot; otherwise it is a
    /// keepalive probe and is dropped on answer.
    waiter: bool,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) streams: HashMap<u32, Arc<StreamShared>>,
    next_outbound_id: u64,
    last_inbound_id: u32,
    pub(crate) accept_queue: VecDeque<Arc<StreamShared>>,
    pub(crate) go_away_sent: bool,
    pub(crate) go_away_received: bool,
    pings: HashMap<u32, PingSlot>,
    next_ping_id: u32,
    pub(crate) last_pong: Instant,
    /// When the outstanding keepalive ping went out.
    pub(crate) keepalive_probe: Option<Instant>,
    pub(crate) next_keepalive: Instant,
    /// Locally half-closed streams and when they get reset.
    pub(crate) half_closed: HashMap<u32, Instant>,
    pub(crate) drain_deadline: Option<Instant>,
    /// After termination, when the monitor stops waiting for the writer and
    /// closes the transport itself.
    pub(crate) close_deadline: Option<Instant>,
    pub(crate) error: Option<Error>,
}

impl SessionInner {
    pub(crate) fn closed_error(&self) -> Error {
        self.error.clone().unwrap_or(Error::SessionClosed)
    }

    pub(crate) fn register_ping(&mut self, waiter: bool) -> u32 {
        let mut id = self.next_ping_id;
        while self.pings.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_ping_id = id.wrapping_add(1);
        self.pings.insert(
            id,
            PingSlot {
                sent: Instant::now(),
                rtt: None,
                waiter,
            },
        );
        id
    }
}

pub(crate) struct Shared {
    pub(crate) role: Role,
    pub(crate) config: Config,
    pub(crate) inner: Mutex<SessionInner>,
    pub(crate) cond: Condvar,
    pub(crate) outbox: Arc<Outbox>,
    closer: Box<dyn TransportCloser>,
    transport_closed: AtomicBool,
}

impl Shared {
    pub(crate) fn transport_closed(&self) -> bool {
        self.transport_closed.load(Ordering::SeqCst)
    }

    /// Close the transport exactly once.
    pub(crate) fn close_transport(&self) {
        if self.transport_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.closer.close() {
            debug!(role = %self.role, error = %e, "error closing transport");
        }
        let _inner = self.inner.lock();
        self.cond.notify_all();
    }

    /// Move to `Closed`, recording `cause`. Returns the streams that were
    /// still live, or `None` if the session was already closed.
    fn mark_closed(&self, cause: Option<Error>) -> Option<Vec<Arc<StreamShared>>> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return None;
        }
        inner.state = SessionState::Closed;
        inner.error = cause;
        inner.accept_queue.clear();
        inner.half_closed.clear();
        inner.close_deadline = Some(Instant::now() + self.config.connection_write_timeout);
        self.cond.notify_all();
        Some(inner.streams.drain().map(|(_, s)| s).collect())
    }

    /// End the session now. `None` is a local forced close; `Some` is a
    /// failure every stream and blocked caller will see.
    pub(crate) fn terminate(&self, cause: Option<Error>) {
        let Some(streams) = self.mark_closed(cause.clone()) else {
            return;
        };
        match &cause {
            Some(e) => error!(role = %self.role, error = %e, "session failed"),
            None => debug!(role = %self.role, streams = streams.len(), "session shut down"),
        }
        let err = cause.clone().unwrap_or(Error::SessionClosed);
        for stream in streams {
            stream.fail(err.clone());
        }

        // Tell the peer why before hanging up; the monitor closes the
        // transport if the writer cannot get it out.
        let last = matches!(cause, Some(Error::Protocol(_)))
            .then(|| Frame::go_away(GoAwayCode::ProtocolError));
        let flush = last.is_some();
        self.outbox.abort(err, last);
        if !flush {
            self.close_transport();
        }
    }

    /// Graceful end, once the writer has flushed everything.
    pub(crate) fn finish(&self) {
        if let Some(streams) = self.mark_closed(None) {
            debug!(role = %self.role, "session closed");
            for stream in streams {
                stream.fail(Error::SessionClosed);
            }
        }
    }

    pub(crate) fn remove_stream(&self, id: u32) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.streams.remove(&id).is_none() {
                return;
            }
            inner.accept_queue.retain(|s| s.id() != id);
            inner.half_closed.remove(&id);
            self.cond.notify_all();
            inner.state == SessionState::Draining && inner.streams.is_empty()
        };
        trace!(role = %self.role, stream_id = id, "stream removed");
        if drained {
            self.drained();
        }
    }

    /// A handle half-closed its stream. A stream that is now fully closed
    /// leaves the table; otherwise it gets a close timer.
    pub(crate) fn on_local_close(&self, id: u32, terminal: bool) {
        if terminal {
            self.remove_stream(id);
            return;
        }
        if let Some(timeout) = self.config.stream_close_timeout {
            let mut inner = self.inner.lock();
            if inner.streams.contains_key(&id) {
                inner.half_closed.insert(id, Instant::now() + timeout);
                self.cond.notify_all();
            }
        }
    }

    pub(crate) fn send_window_update(&self, id: u32, delta: u32) {
        trace!(stream_id = id, delta, "window update");
        let _ = self
            .outbox
            .enqueue_control(Frame::window_update(id, Flags::NONE, delta));
    }

    pub(crate) fn watch(self: &Arc<Self>, cx: &Cx) -> Option<Registration> {
        let this = Arc::clone(self);
        cx.watch(move || {
            let _inner = this.inner.lock();
            this.cond.notify_all();
        })
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    fn on_eof(&self) {
        let graceful = {
            let inner = self.inner.lock();
            inner.state == SessionState::Draining && inner.streams.is_empty()
        };
        if graceful {
            self.finish();
            self.outbox.abort(Error::SessionClosed, None);
            self.close_transport();
        } else {
            self.terminate(Some(Error::from(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))));
        }
    }

    fn handle_frame(&self, frame: Frame) -> Result<()> {
        match frame.frame_type() {
            FrameType::Data | FrameType::WindowUpdate => self.handle_stream_frame(frame),
            FrameType::Ping => self.handle_ping(&frame),
            FrameType::GoAway => self.handle_go_away(&frame),
            FrameType::Unknown(kind) => {
                trace!(kind, "ignoring frame of unknown type");
                Ok(())
            }
        }
    }

    fn handle_stream_frame(&self, frame: Frame) -> Result<()> {
        let id = frame.stream_id();
        if id == SESSION_STREAM_ID || id > self.config.max_streams {
            return Err(ProtocolError::InvalidStreamId(id).into());
        }
        if frame.flags().contains(Flags::SYN) && !self.accept_syn(&frame)? {
            return Ok(());
        }

        let stream = self.inner.lock().streams.get(&id).cloned();
        let Some(stream) = stream else {
            if frame.frame_type() == FrameType::Data && !frame.flags().contains(Flags::RST) {
                warn!(role = %self.role, stream_id = id, "data for unknown stream, sending RST");
                self.outbox.enqueue_reply(Frame::reset(id));
            }
            return Ok(());
        };
        if stream.on_frame(&frame)? {
            self.remove_stream(id);
        }
        Ok(())
    }

    /// Register a stream the peer is opening. Returns false if it was
    /// refused with RST.
    fn accept_syn(&self, frame: &Frame) -> Result<bool> {
        let id = frame.stream_id();
        if !self.role.peer().owns(id) {
            return Err(ProtocolError::InvalidStreamId(id).into());
        }
        let announced = match frame.frame_type() {
            FrameType::WindowUpdate => frame.header.length,
            _ => self.config.initial_window_size,
        };

        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Ok(false);
        }
        if inner.streams.contains_key(&id) {
            return Err(ProtocolError::DuplicateStream(id).into());
        }
        if id <= inner.last_inbound_id {
            return Err(ProtocolError::InvalidStreamId(id).into());
        }
        inner.last_inbound_id = id;

        let refusal = if inner.state == SessionState::Draining || inner.go_away_sent {
            Some("going away")
        } else if inner.accept_queue.len() >= self.config.accept_backlog {
            Some("accept backlog full")
        } else if announced == UNBOUNDED_WINDOW && !self.config.allow_unbounded_streams {
            Some("unbounded streams not allowed")
        } else {
            None
        };
        if let Some(reason) = refusal {
            drop(inner);
            warn!(role = %self.role, stream_id = id, reason, "refusing stream");
            self.outbox.enqueue_reply(Frame::reset(id));
            return Ok(false);
        }

        let flow = if announced == UNBOUNDED_WINDOW {
            FlowController::unbounded(id)
        } else {
            FlowController::new(id, announced, self.config.initial_window_size)
        };
        let stream = StreamShared::inbound(id, flow);
        inner.streams.insert(id, Arc::clone(&stream));
        inner.accept_queue.push_back(stream);
        self.cond.notify_all();
        drop(inner);

        debug!(role = %self.role, stream_id = id, window = announced, "inbound stream");
        Ok(true)
    }

    fn handle_ping(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id() != SESSION_STREAM_ID {
            return Err(ProtocolError::InvalidStreamId(frame.stream_id()).into());
        }
        let id = frame.header.length;
        let flags = frame.flags();
        if flags.contains(Flags::SYN) {
            self.outbox.enqueue_reply(Frame::pong(id));
        } else if flags.contains(Flags::ACK) {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let Some(slot) = inner.pings.get_mut(&id) else {
                trace!(ping_id = id, "unsolicited pong");
                return Ok(());
            };
            let rtt = now.saturating_duration_since(slot.sent);
            if slot.waiter {
                slot.rtt = Some(rtt);
            } else {
                inner.pings.remove(&id);
            }
            inner.last_pong = now;
            self.cond.notify_all();
            trace!(ping_id = id, ?rtt, "pong");
        }
        Ok(())
    }

    fn handle_go_away(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id() != SESSION_STREAM_ID {
            return Err(ProtocolError::InvalidStreamId(frame.stream_id()).into());
        }
        let code = frame.header.length;
        match GoAwayCode::from_u32(code) {
            Some(GoAwayCode::Normal) => {
                debug!(role = %self.role, "peer is going away");
                self.begin_drain(true);
                Ok(())
            }
            _ => Err(Error::RemoteGoAwayError(code)),
        }
    }
}

fn run_reader<R: Read>(shared: Arc<Shared>, reader: R) {
    let mut reader = BufReader::new(reader);
    loop {
        let frame = match read_frame(&mut reader, shared.config.max_frame_size) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                shared.on_eof();
                return;
            }
            Err(e) => {
                shared.terminate(Some(e.into()));
                return;
            }
        };
        trace!(?frame, "recv");
        if let Err(e) = shared.handle_frame(frame) {
            shared.terminate(Some(e));
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// A multiplexed connection.
///
/// Dropping the handle starts a graceful close: live streams keep working
/// until they finish, then the transport is closed.
pub struct Session {
    pub(crate) shared: Arc<Shared>,
}

impl Session {
    pub fn client<T: Transport>(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, Role::Client)
    }

    pub fn server<T: Transport>(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, Role::Server)
    }

    pub fn new<T: Transport>(transport: T, config: Config, role: Role) -> Result<Self> {
        config.validate()?;
        let (reader, writer, closer) = transport.split()?;
        let now = Instant::now();
        let shared = Arc::new(Shared {
            role,
            outbox: Outbox::new(config.write_queue_depth, config.connection_write_timeout),
            inner: Mutex::new(SessionInner {
                state: SessionState::Established,
                streams: HashMap::new(),
                next_outbound_id: u64::from(role.first_stream_id()),
                last_inbound_id: 0,
                accept_queue: VecDeque::new(),
                go_away_sent: false,
                go_away_received: false,
                pings: HashMap::new(),
                next_ping_id: 0,
                last_pong: now,
                keepalive_probe: None,
                next_keepalive: now + config.keepalive_interval,
                half_closed: HashMap::new(),
                drain_deadline: None,
                close_deadline: None,
                error: None,
            }),
            cond: Condvar::new(),
            config,
            closer,
            transport_closed: AtomicBool::new(false),
        });

        let spawned = spawn(&shared, "writer", move |s| run_writer(s, writer))
            .and_then(|()| spawn(&shared, "reader", move |s| run_reader(s, reader)))
            .and_then(|()| spawn(&shared, "monitor", run_monitor));
        if let Err(e) = spawned {
            let err = Error::from(e);
            shared.terminate(Some(err.clone()));
            return Err(err);
        }
        debug!(%role, "session started");
        Ok(Self { shared })
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn num_streams(&self) -> usize {
        self.shared.inner.lock().streams.len()
    }

    pub fn local_go_away(&self) -> bool {
        self.shared.inner.lock().go_away_sent
    }

    pub fn remote_go_away(&self) -> bool {
        self.shared.inner.lock().go_away_received
    }

    /// The failure that ended the session, if it did not end cleanly.
    pub fn close_error(&self) -> Option<Error> {
        self.shared.inner.lock().error.clone()
    }

    /// Open a stream and wait for the peer to acknowledge it.
    ///
    /// Without a deadline in `cx`, waits at most `stream_open_timeout`. A
    /// stream whose open timed out is half-closed, not reset, since the
    /// peer's ACK may already be in flight.
    pub fn open(&self, cx: &Cx) -> Result<Stream> {
        self.open_with(cx, OpenOptions::default())
    }

    pub fn open_with(&self, cx: &Cx, options: OpenOptions) -> Result<Stream> {
        let stream = self.open_stream_with(options)?;
        stream.wait_established(&cx.or_timeout(self.shared.config.stream_open_timeout))?;
        Ok(stream)
    }

    /// Open a stream without waiting for the ACK. Writes block until the
    /// peer acknowledges it.
    pub fn open_stream(&self) -> Result<Stream> {
        self.open_stream_with(OpenOptions::default())
    }

    pub fn open_stream_with(&self, options: OpenOptions) -> Result<Stream> {
        let config = &self.shared.config;
        let stream = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                SessionState::Closed => return Err(inner.closed_error()),
                _ if inner.go_away_received => return Err(Error::RemoteGoAway),
                SessionState::Draining => return Err(Error::SessionClosed),
                SessionState::Established => {}
            }
            let id = inner.next_outbound_id;
            if id > u64::from(config.max_streams) {
                return Err(Error::StreamsExhausted);
            }
            inner.next_outbound_id += 2;
            let id = id as u32;

            let (flow, window) = if options.flow_control {
                (
                    FlowController::new(id, 0, config.initial_window_size),
                    config.initial_window_size,
                )
            } else {
                (FlowController::unbounded(id), UNBOUNDED_WINDOW)
            };
            // Queued under the session lock so SYNs reach the wire in id
            // order. The outbox lock is a leaf.
            self.shared
                .outbox
                .enqueue_lifecycle(Frame::window_update(id, Flags::SYN, window))?;
            let stream = StreamShared::outbound(id, flow);
            inner.streams.insert(id, Arc::clone(&stream));
            debug!(role = %self.shared.role, stream_id = id, window, "opening stream");
            stream
        };
        Ok(Stream::new(stream, Arc::clone(&self.shared)))
    }

    /// Take the next stream the peer opened, acknowledging it.
    pub fn accept(&self, cx: &Cx) -> Result<Stream> {
        let _watch = self.shared.watch(cx);
        let stream = {
            let mut inner = self.shared.inner.lock();
            loop {
                if let Some(stream) = inner.accept_queue.pop_front() {
                    break stream;
                }
                match inner.state {
                    SessionState::Closed => return Err(inner.closed_error()),
                    SessionState::Draining if inner.go_away_received => {
                        return Err(Error::RemoteGoAway)
                    }
                    SessionState::Draining => return Err(Error::SessionClosed),
                    SessionState::Established => {}
                }
                cx.wait(&self.shared.cond, &mut inner)?;
            }
        };
        if let Some(ack) = stream.accept() {
            self.shared.outbox.enqueue_lifecycle(ack)?;
        }
        debug!(role = %self.shared.role, stream_id = stream.id(), "accepted stream");
        Ok(Stream::new(stream, Arc::clone(&self.shared)))
    }

    /// Measure one round trip. Without a deadline in `cx`, waits at most
    /// `keepalive_timeout`.
    pub fn ping(&self, cx: &Cx) -> Result<Duration> {
        let cx = cx.or_timeout(self.shared.config.keepalive_timeout);
        let _watch = self.shared.watch(&cx);
        let id = {
            let mut inner = self.shared.inner.lock();
            if inner.state == SessionState::Closed {
                return Err(inner.closed_error());
            }
            inner.register_ping(true)
        };
        if let Err(e) = self.shared.outbox.enqueue_control(Frame::ping(id)) {
            self.shared.inner.lock().pings.remove(&id);
            return Err(e);
        }

        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(rtt) = inner.pings.get(&id).and_then(|slot| slot.rtt) {
                inner.pings.remove(&id);
                return Ok(rtt);
            }
            if inner.state == SessionState::Closed {
                inner.pings.remove(&id);
                return Err(inner.closed_error());
            }
            if let Err(e) = cx.wait(&self.shared.cond, &mut inner) {
                inner.pings.remove(&id);
                return Err(e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.begin_drain(false);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("state", &inner.state)
            .field("streams", &inner.streams.len())
            .finish()
    }
}

fn spawn(
    shared: &Arc<Shared>,
    name: &'static str,
    body: impl FnOnce(Arc<Shared>) + Send + 'static,
) -> std::io::Result<()> {
    let shared = Arc::clone(shared);
    let span = debug_span!("mux", role = %shared.role, thread = name);
    thread::Builder::new()
        .name(format!("mux-{}-{name}", shared.role))
        .spawn(move || {
            let _enter = span.enter();
            body(shared);
        })?;
    Ok(())
}
