//! Shared helpers for mux-session integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use mux_protocol::{read_frame, write_frame, Frame, FrameType};
use mux_session::memory::{self, PipeWriter};
use mux_session::{Config, Cx, Role, Session, Stream, Transport, TransportCloser};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Generous bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Route `tracing` output through the test harness so it shows up only for
/// failing tests.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_thread_names(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Defaults with keepalive off, so idle tests see no background pings.
pub fn quiet_config() -> Config {
    Config {
        enable_keepalive: false,
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Session pairs
// ---------------------------------------------------------------------------

/// Client and server sessions joined by an in-memory pipe.
pub fn pipe_pair(client: Config, server: Config) -> (Session, Session) {
    init_test_logging();
    let (a, b) = memory::pipe();
    (
        Session::client(a, client).unwrap(),
        Session::server(b, server).unwrap(),
    )
}

pub fn quiet_pair() -> (Session, Session) {
    pipe_pair(quiet_config(), quiet_config())
}

/// Open a stream on `client` and accept it on `server`, returning both
/// ends once the handshake is done.
pub fn stream_pair(client: &Session, server: &Session) -> (Stream, Stream) {
    let local = client.open_stream().unwrap();
    let remote = server.accept(&Cx::timeout(PATIENCE)).unwrap();
    local.wait_established(&Cx::timeout(PATIENCE)).unwrap();
    (local, remote)
}

/// Client and server sessions over loopback TCP.
pub fn tcp_pair(config: Config) -> (Session, Session) {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let dial = thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (server_conn, _) = listener.accept().unwrap();
    let client_conn = dial.join().unwrap();
    (
        Session::client(client_conn, config.clone()).unwrap(),
        Session::server(server_conn, config).unwrap(),
    )
}

// ---------------------------------------------------------------------------
// Raw frame peer
// ---------------------------------------------------------------------------

/// The far end of a session, driven frame by frame.
pub struct RawPeer {
    writer: PipeWriter,
    frames: Receiver<Frame>,
    closer: Box<dyn TransportCloser>,
}

/// A session under test facing a raw peer. `role` is the session's role.
pub fn raw_peer(role: Role, config: Config) -> (Session, RawPeer) {
    init_test_logging();
    let (a, b) = memory::pipe();
    let session = Session::new(a, config, role).unwrap();

    let (mut reader, writer, closer) = b.split().unwrap();
    let (tx, frames) = mpsc::channel();
    thread::spawn(move || {
        while let Ok(Some(frame)) = read_frame(&mut reader, u32::MAX) {
            if tx.send(frame).is_err() {
                break;
            }
        }
    });
    (
        session,
        RawPeer {
            writer,
            frames,
            closer,
        },
    )
}

impl RawPeer {
    pub fn send(&mut self, frame: &Frame) {
        write_frame(&mut self.writer, frame).unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    /// Next frame from the session, or `None` if nothing arrives in `wait`.
    pub fn recv_within(&self, wait: Duration) -> Option<Frame> {
        self.frames.recv_timeout(wait).ok()
    }

    pub fn recv(&self) -> Frame {
        self.recv_within(PATIENCE).expect("no frame from session")
    }

    /// Skip frames until one of `kind` arrives.
    pub fn recv_kind(&self, kind: FrameType) -> Frame {
        let deadline = Instant::now() + PATIENCE;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let frame = self.recv_within(left).expect("expected frame never came");
            if frame.frame_type() == kind {
                return frame;
            }
        }
    }

    /// Whether the session hung up within `wait`, after draining any frames
    /// it sent first.
    pub fn hung_up_within(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.frames.recv_timeout(left) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }

    pub fn close(&self) {
        self.closer.close().unwrap();
    }
}
