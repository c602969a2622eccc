//! The per-session monitor thread: keepalive pings, the drain deadline and
//! the half-close timeout.
//!
//! All timers live in the session state, so the monitor sleeps on the
//! session's condition variable until the earliest one is due or something
//! changes.

use std::sync::Arc;
use std::time::Instant;

use mux_protocol::Frame;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::session::{SessionState, Shared};
use crate::stream::StreamShared;

#[derive(Default)]
struct Due {
    keepalive_failed: bool,
    ping: Option<u32>,
    drain_expired: bool,
    stale: Vec<Arc<StreamShared>>,
}

impl Due {
    fn is_empty(&self) -> bool {
        !self.keepalive_failed && self.ping.is_none() && !self.drain_expired && self.stale.is_empty()
    }
}

fn earliest(a: Option<Instant>, b: Instant) -> Option<Instant> {
    Some(a.map_or(b, |a| a.min(b)))
}

pub(crate) fn run_monitor(shared: Arc<Shared>) {
    let config = &shared.config;
    let mut inner = shared.inner.lock();
    loop {
        let now = Instant::now();

        if inner.state == SessionState::Closed {
            if shared.transport_closed() {
                return;
            }
            match inner.close_deadline {
                Some(at) if now >= at => {
                    drop(inner);
                    warn!(role = %shared.role, "writer stalled on shutdown, closing transport");
                    shared.close_transport();
                    return;
                }
                Some(at) => {
                    shared.cond.wait_until(&mut inner, at);
                }
                None => shared.cond.wait(&mut inner),
            }
            continue;
        }

        let mut due = Due::default();
        let mut wake = None;

        if config.enable_keepalive {
            if let Some(sent) = inner.keepalive_probe {
                if inner.last_pong >= sent {
                    inner.keepalive_probe = None;
                } else if now >= sent + config.keepalive_timeout {
                    due.keepalive_failed = true;
                } else {
                    wake = earliest(wake, sent + config.keepalive_timeout);
                }
            }
            if inner.keepalive_probe.is_none() && !due.keepalive_failed {
                if now >= inner.next_keepalive {
                    due.ping = Some(inner.register_ping(false));
                    inner.keepalive_probe = Some(now);
                    inner.next_keepalive = now + config.keepalive_interval;
                    wake = earliest(wake, now + config.keepalive_timeout);
                } else {
                    wake = earliest(wake, inner.next_keepalive);
                }
            }
        }

        if inner.state == SessionState::Draining {
            if let Some(at) = inner.drain_deadline {
                if now >= at {
                    due.drain_expired = true;
                } else {
                    wake = earliest(wake, at);
                }
            }
        }

        let expired: Vec<u32> = inner
            .half_closed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            inner.half_closed.remove(&id);
            if let Some(stream) = inner.streams.get(&id) {
                due.stale.push(Arc::clone(stream));
            }
        }
        if let Some(at) = inner.half_closed.values().min() {
            wake = earliest(wake, *at);
        }

        if due.is_empty() {
            match wake {
                Some(at) => {
                    shared.cond.wait_until(&mut inner, at);
                }
                None => shared.cond.wait(&mut inner),
            }
            continue;
        }

        drop(inner);
        if due.keepalive_failed {
            shared.terminate(Some(Error::KeepaliveTimeout));
        }
        if let Some(id) = due.ping {
            trace!(ping_id = id, "keepalive");
            let _ = shared.outbox.enqueue_control(Frame::ping(id));
        }
        if due.drain_expired {
            warn!(role = %shared.role, "drain timed out, forcing close");
            shared.terminate(None);
        }
        for stream in due.stale {
            if stream.reset_local() {
                debug!(stream_id = stream.id(), "half-closed stream timed out, resetting");
                let _ = shared.outbox.enqueue_lifecycle(Frame::reset(stream.id()));
                shared.remove_stream(stream.id());
            }
        }
        inner = shared.inner.lock();
    }
}
