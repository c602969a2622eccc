mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use mux_protocol::{Flags, Frame, FrameType, GoAwayCode, Header, ProtocolError};
use mux_session::*;

const WINDOW: u32 = 256 * 1024;

fn syn(id: u32) -> Frame {
    Frame::window_update(id, Flags::SYN, WINDOW)
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// Ping and keepalive
// ---------------------------------------------------------------------------

#[test]
fn ping_measures_round_trip() {
    let (client, server) = quiet_pair();
    let rtt = client.ping(&Cx::new()).unwrap();
    assert!(rtt > Duration::ZERO);
    assert!(rtt < client.config().keepalive_timeout);
    assert!(server.ping(&Cx::new()).is_ok());
}

#[test]
fn keepalive_holds_healthy_session_open() {
    let config = Config {
        keepalive_interval: Duration::from_millis(20),
        keepalive_timeout: Duration::from_millis(500),
        ..Config::default()
    };
    let (client, server) = pipe_pair(config.clone(), config);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(client.state(), SessionState::Established);
    assert_eq!(server.state(), SessionState::Established);
}

#[test]
fn silent_peer_trips_keepalive() {
    let config = Config {
        keepalive_interval: Duration::from_millis(50),
        keepalive_timeout: Duration::from_millis(100),
        ..Config::default()
    };
    let started = Instant::now();
    let (session, peer) = raw_peer(Role::Client, config);

    let ping = peer.recv_kind(FrameType::Ping);
    assert!(ping.flags().contains(Flags::SYN));

    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(matches!(session.close_error(), Some(Error::KeepaliveTimeout)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(peer.hung_up_within(PATIENCE));
    assert!(matches!(session.open_stream(), Err(Error::KeepaliveTimeout)));
}

#[test]
fn ping_without_pong_times_out() {
    let (session, peer) = raw_peer(Role::Client, quiet_config());
    let err = session
        .ping(&Cx::timeout(Duration::from_millis(30)))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(peer.recv().frame_type(), FrameType::Ping);
    assert_eq!(session.state(), SessionState::Established);
}

#[test]
fn answers_peer_pings() {
    let (_session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&Frame::ping(0xfeed));
    assert_eq!(peer.recv(), Frame::pong(0xfeed));
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

#[test]
fn data_for_unknown_stream_is_answered_with_rst() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&Frame::data(42, Flags::NONE, b"who?".to_vec()));
    assert_eq!(peer.recv(), Frame::reset(42));

    // Still healthy.
    peer.send(&Frame::ping(1));
    assert_eq!(peer.recv(), Frame::pong(1));
    assert_eq!(session.state(), SessionState::Established);
}

#[test]
fn rst_for_unknown_stream_is_not_answered() {
    let (_session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&Frame::data(9, Flags::RST, Vec::new()));
    peer.send(&Frame::window_update(11, Flags::NONE, 100));
    peer.send(&Frame::ping(2));
    assert_eq!(peer.recv(), Frame::pong(2));
}

#[test]
fn unknown_frame_types_are_ignored() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    let header = Header::new(FrameType::Unknown(0x7), Flags::NONE, 0, 12345);
    peer.send_raw(&header.to_bytes());
    peer.send(&Frame::ping(3));
    assert_eq!(peer.recv(), Frame::pong(3));
    assert_eq!(session.state(), SessionState::Established);
}

#[test]
fn accept_announces_window_and_backlog_overflow_is_refused() {
    let config = Config {
        accept_backlog: 2,
        ..quiet_config()
    };
    let (session, mut peer) = raw_peer(Role::Server, config);
    peer.send(&syn(1));
    peer.send(&syn(3));
    peer.send(&syn(5));
    assert_eq!(peer.recv(), Frame::reset(5));

    let first = session.accept(&Cx::new()).unwrap();
    assert_eq!(first.id(), 1);
    assert_eq!(
        peer.recv(),
        Frame::window_update(1, Flags::ACK, session.config().initial_window_size)
    );
    assert_eq!(session.accept(&Cx::new()).unwrap().id(), 3);
    assert!(peer.recv().flags().contains(Flags::ACK));
    assert!(matches!(
        session.accept(&Cx::timeout(Duration::from_millis(20))),
        Err(Error::Timeout)
    ));
}

#[test]
fn peer_data_reaches_accepted_stream() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&syn(1));
    peer.send(&Frame::data(1, Flags::NONE, b"early".to_vec()));
    peer.send(&Frame::data(1, Flags::FIN, b" bird".to_vec()));

    let stream = session.accept(&Cx::new()).unwrap();
    let mut got = Vec::new();
    let mut buf = [0u8; 3];
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"early bird");
    assert_eq!(stream.state(), StreamState::RemoteClosed);
}

// ---------------------------------------------------------------------------
// Fatal errors
// ---------------------------------------------------------------------------

#[test]
fn window_overrun_is_fatal_and_announced() {
    let config = Config {
        initial_window_size: 1024,
        ..quiet_config()
    };
    let (session, mut peer) = raw_peer(Role::Server, config);
    peer.send(&syn(1));
    let stream = session.accept(&Cx::new()).unwrap();
    peer.send(&Frame::data(1, Flags::NONE, vec![0; 2048]));

    let go_away = peer.recv_kind(FrameType::GoAway);
    assert_eq!(go_away.header.length, GoAwayCode::ProtocolError.as_u32());
    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(matches!(
        session.close_error(),
        Some(Error::Protocol(ProtocolError::FlowControlViolation { stream_id: 1, .. }))
    ));
    let mut buf = [0u8; 8];
    assert!(matches!(stream.read(&mut buf), Err(Error::Protocol(_))));
    assert!(peer.hung_up_within(PATIENCE));
}

#[test]
fn bad_version_is_fatal() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    let mut header = Frame::ping(1).header;
    header.version = 1;
    peer.send_raw(&header.to_bytes());
    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(matches!(
        session.close_error(),
        Some(Error::Protocol(ProtocolError::BadVersion(1)))
    ));
}

#[test]
fn syn_with_own_parity_is_fatal() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&syn(2));
    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(matches!(
        session.close_error(),
        Some(Error::Protocol(ProtocolError::InvalidStreamId(2)))
    ));
}

#[test]
fn reused_stream_id_is_fatal() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&syn(3));
    peer.send(&syn(1));
    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(matches!(
        session.close_error(),
        Some(Error::Protocol(ProtocolError::InvalidStreamId(1)))
    ));
}

#[test]
fn stream_frames_on_session_id_are_fatal() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&Frame::window_update(0, Flags::NONE, 10));
    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(matches!(
        session.close_error(),
        Some(Error::Protocol(ProtocolError::InvalidStreamId(0)))
    ));
}

#[test]
fn ids_beyond_max_streams_are_fatal() {
    let config = Config {
        max_streams: 8,
        ..quiet_config()
    };
    let (session, mut peer) = raw_peer(Role::Server, config);
    peer.send(&syn(9));
    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(matches!(
        session.close_error(),
        Some(Error::Protocol(ProtocolError::InvalidStreamId(9)))
    ));
}

#[test]
fn go_away_with_error_code_is_fatal() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&Frame::go_away(GoAwayCode::InternalError));
    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(matches!(
        session.close_error(),
        Some(Error::RemoteGoAwayError(2))
    ));
}

#[test]
fn lost_transport_fails_streams_after_buffered_data() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&syn(1));
    let stream = session.accept(&Cx::new()).unwrap();
    peer.send(&Frame::data(1, Flags::NONE, b"partial".to_vec()));
    // The pong proves the data frame was handled.
    peer.send(&Frame::ping(4));
    assert_eq!(peer.recv_kind(FrameType::Ping), Frame::pong(4));
    peer.close();

    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    let mut buf = [0u8; 64];
    assert_eq!(stream.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"partial");
    assert!(matches!(stream.read(&mut buf), Err(Error::Io(_))));
    assert!(matches!(stream.write(b"x"), Err(Error::Io(_))));
    assert!(stream.close().is_ok());
    assert_eq!(stream.state(), StreamState::Closed);
}

#[test]
fn failure_after_peer_fin_reads_as_end_of_stream() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&syn(1));
    let stream = session.accept(&Cx::new()).unwrap();
    peer.send(&Frame::data(1, Flags::FIN, b"done".to_vec()));
    peer.send(&Frame::ping(5));
    assert_eq!(peer.recv_kind(FrameType::Ping), Frame::pong(5));
    peer.close();

    session.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 4);
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Stream limits
// ---------------------------------------------------------------------------

#[test]
fn stream_ids_run_out() {
    let client_config = Config {
        max_streams: 4,
        ..quiet_config()
    };
    let (client, _server) = pipe_pair(client_config, quiet_config());
    assert_eq!(client.open_stream().unwrap().id(), 1);
    assert_eq!(client.open_stream().unwrap().id(), 3);
    assert!(matches!(client.open_stream(), Err(Error::StreamsExhausted)));
}

#[test]
fn server_opens_even_ids() {
    let (client, server) = quiet_pair();
    let stream = server.open_stream().unwrap();
    assert_eq!(stream.id(), 2);
    assert_eq!(stream.session_role(), Role::Server);
    let remote = client.accept(&Cx::timeout(PATIENCE)).unwrap();
    assert_eq!(remote.id(), 2);
}

#[test]
fn half_closed_stream_is_reset_after_close_timeout() {
    let client_config = Config {
        stream_close_timeout: Some(Duration::from_millis(50)),
        ..quiet_config()
    };
    let (client, server) = pipe_pair(client_config, quiet_config());
    let (stream, remote) = stream_pair(&client, &server);
    stream.close().unwrap();

    wait_for("close timeout reset", || remote.state() == StreamState::Reset);
    assert_eq!(stream.state(), StreamState::Reset);
    assert!(matches!(remote.write(b"too late"), Err(Error::StreamReset)));
    wait_for("stream removal", || client.num_streams() == 0);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[test]
fn go_away_drains_active_streams() {
    let (client, server) = quiet_pair();
    let (stream, remote) = stream_pair(&client, &server);

    server.close().unwrap();
    assert!(server.local_go_away());
    assert_eq!(server.state(), SessionState::Draining);
    wait_for("go away to reach client", || client.remote_go_away());
    assert!(matches!(client.open_stream(), Err(Error::RemoteGoAway)));
    // The client mirrors the GoAway, so the server may already have seen it.
    assert!(matches!(
        server.open_stream(),
        Err(Error::SessionClosed | Error::RemoteGoAway)
    ));
    assert!(matches!(
        server.accept(&Cx::new()),
        Err(Error::SessionClosed | Error::RemoteGoAway)
    ));

    // The existing stream still carries data both ways.
    stream.write(b"still here").unwrap();
    stream.close().unwrap();
    let mut buf = [0u8; 10];
    (&remote).read_exact_into(&mut buf);
    assert_eq!(&buf, b"still here");
    remote.write(b"bye").unwrap();
    remote.close().unwrap();

    server.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    client.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(server.close_error().is_none());
    assert!(client.close_error().is_none());
    let mut tail = [0u8; 3];
    (&stream).read_exact_into(&mut tail);
    assert_eq!(&tail, b"bye");
}

#[test]
fn close_with_no_streams_finishes_immediately() {
    let (client, server) = quiet_pair();
    client.close().unwrap();
    client.close().unwrap();
    client.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    server.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(server.remote_go_away());
    assert!(server.close_error().is_none());
}

#[test]
fn dropping_session_resets_unaccepted_streams() {
    let (session, mut peer) = raw_peer(Role::Server, quiet_config());
    peer.send(&syn(1));
    peer.send(&Frame::ping(6));
    assert_eq!(peer.recv(), Frame::pong(6));

    drop(session);
    let go_away = peer.recv();
    assert_eq!(go_away.frame_type(), FrameType::GoAway);
    assert_eq!(go_away.header.length, GoAwayCode::Normal.as_u32());
    assert_eq!(peer.recv(), Frame::reset(1));
    assert!(peer.hung_up_within(PATIENCE));
}

#[test]
fn close_finishes_with_pending_inbound_streams() {
    let (client, server) = quiet_pair();
    let (stream, remote) = stream_pair(&client, &server);
    let pending = client.open_stream().unwrap();
    wait_for("second stream to queue", || server.num_streams() == 2);

    server.close().unwrap();
    wait_for("unaccepted stream reset", || pending.state() == StreamState::Reset);
    assert_eq!(server.num_streams(), 1);
    assert!(matches!(pending.write(b"x"), Err(Error::StreamReset)));

    // The accepted stream still has to finish before the drain completes.
    assert_eq!(server.state(), SessionState::Draining);
    stream.close().unwrap();
    remote.close().unwrap();
    server.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    client.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(server.close_error().is_none());
}

#[test]
fn drain_timeout_forces_close() {
    let server_config = Config {
        drain_timeout: Some(Duration::from_millis(50)),
        ..quiet_config()
    };
    let (client, server) = pipe_pair(quiet_config(), server_config);
    let (_stream, remote) = stream_pair(&client, &server);

    server.close().unwrap();
    server.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert!(server.close_error().is_none());
    let mut buf = [0u8; 1];
    assert!(matches!(remote.read(&mut buf), Err(Error::SessionClosed)));
    client.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
}

#[test]
fn shutdown_wakes_blocked_callers() {
    let (client, server) = quiet_pair();
    let server = Arc::new(server);
    let (stream, _remote) = stream_pair(&client, &server);

    let acceptor = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.accept(&Cx::new()))
    };
    thread::sleep(Duration::from_millis(20));
    server.shutdown();
    assert!(matches!(acceptor.join().unwrap(), Err(Error::SessionClosed)));
    assert!(server.is_closed());
    assert!(matches!(server.ping(&Cx::new()), Err(Error::SessionClosed)));

    client.wait_closed(&Cx::timeout(PATIENCE)).unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    let mut buf = [0u8; 1];
    assert!(matches!(stream.read(&mut buf), Err(Error::Io(_))));
}

#[test]
fn invalid_config_rejected_up_front() {
    let (a, _b) = memory::pipe();
    let config = Config {
        initial_window_size: 0,
        ..Config::default()
    };
    assert!(matches!(
        Session::client(a, config),
        Err(Error::InvalidConfig(_))
    ));
}

trait ReadExactInto {
    fn read_exact_into(self, buf: &mut [u8]);
}

impl ReadExactInto for &Stream {
    fn read_exact_into(self, buf: &mut [u8]) {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_with(&Cx::timeout(PATIENCE), &mut buf[filled..]).unwrap();
            assert!(n > 0, "stream ended early");
            filled += n;
        }
    }
}
