//! Per-stream flow-control windows.
//!
//! The send window counts bytes we may still transmit before the peer grants
//! more; the receive window counts bytes the peer may still send us. Window
//! updates are batched: the reader only re-opens the window once at least
//! `max_window / WINDOW_UPDATE_THRESHOLD_DIVISOR` bytes can be returned, and
//! then restores it to the full `max_window`.

use mux_protocol::{ProtocolError, UNBOUNDED_WINDOW};

/// Emit a window update once the returnable credit reaches
/// `max_window / WINDOW_UPDATE_THRESHOLD_DIVISOR`.
pub const WINDOW_UPDATE_THRESHOLD_DIVISOR: u32 = 2;

/// Outcome of asking to send `n` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCredit {
    /// Send this many bytes now (never more than asked for).
    Allowed(u32),
    /// The window is exhausted; wait for a window update.
    MustWait,
}

#[derive(Debug, Clone)]
pub struct FlowController {
    stream_id: u32,
    send_window: u32,
    recv_window: u32,
    max_window: u32,
    enabled: bool,
}

impl FlowController {
    /// `peer_window` is what the peer announced for its receive side; it
    /// seeds our send window. `local_window` is our configured receive window.
    pub fn new(stream_id: u32, peer_window: u32, local_window: u32) -> Self {
        Self {
            stream_id,
            send_window: peer_window,
            recv_window: local_window,
            max_window: local_window,
            enabled: true,
        }
    }

    /// A stream that skips windowing in both directions.
    pub fn unbounded(stream_id: u32) -> Self {
        Self {
            stream_id,
            send_window: UNBOUNDED_WINDOW,
            recv_window: UNBOUNDED_WINDOW,
            max_window: UNBOUNDED_WINDOW,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    pub fn max_window(&self) -> u32 {
        self.max_window
    }

    /// Seed the send window from the peer's announcement (carried on the
    /// ACK of a stream we opened).
    pub fn set_peer_window(&mut self, window: u32) {
        if self.enabled {
            self.send_window = window;
        }
    }

    /// Reserve up to `n` bytes of send credit.
    pub fn consume_send(&mut self, n: u32) -> SendCredit {
        if !self.enabled {
            return SendCredit::Allowed(n);
        }
        if self.send_window == 0 {
            return SendCredit::MustWait;
        }
        let m = n.min(self.send_window);
        self.send_window -= m;
        SendCredit::Allowed(m)
    }

    /// Give back credit reserved by `consume_send` for bytes that were never
    /// queued.
    pub fn refund_send(&mut self, n: u32) {
        if self.enabled {
            self.send_window = self.send_window.saturating_add(n);
        }
    }

    /// Apply a WINDOW_UPDATE delta from the peer.
    pub fn on_window_update(&mut self, delta: u32) -> Result<(), ProtocolError> {
        if !self.enabled {
            return Ok(());
        }
        self.send_window = self.send_window.checked_add(delta).ok_or_else(|| {
            ProtocolError::FlowControlViolation {
                stream_id: self.stream_id,
                received: delta,
                window: self.send_window,
            }
        })?;
        Ok(())
    }

    /// Account for `n` payload bytes arriving from the peer.
    pub fn on_data_received(&mut self, n: u32) -> Result<(), ProtocolError> {
        if !self.enabled {
            return Ok(());
        }
        if n > self.recv_window {
            return Err(ProtocolError::FlowControlViolation {
                stream_id: self.stream_id,
                received: n,
                window: self.recv_window,
            });
        }
        self.recv_window -= n;
        Ok(())
    }

    /// Called after the reader drains the inbound buffer down to `buffered`
    /// bytes. Returns the delta to announce, if a window update is due.
    pub fn on_data_consumed(&mut self, buffered: u32) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let outstanding = self.recv_window.saturating_add(buffered);
        let delta = self.max_window.saturating_sub(outstanding);
        if delta == 0 || delta < self.max_window / WINDOW_UPDATE_THRESHOLD_DIVISOR {
            return None;
        }
        self.recv_window += delta;
        Some(delta)
    }
}
