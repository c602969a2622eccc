use std::time::Duration;

use crate::error::{Error, Result};

/// Default per-stream receive window.
pub const DEFAULT_WINDOW_SIZE: u32 = 256 * 1024;

/// Default largest Data payload sent or accepted.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Inbound streams that may wait for `accept` before new SYNs are refused.
    pub accept_backlog: usize,
    /// Receive window announced for every stream, in bytes.
    pub initial_window_size: u32,
    /// Largest Data payload this endpoint sends or accepts.
    pub max_frame_size: u32,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub enable_keepalive: bool,
    /// Highest stream id either side may use.
    pub max_streams: u32,
    /// How long a writer waits for room in the outbound queue.
    pub connection_write_timeout: Duration,
    /// Default ACK wait for `open` when the caller supplies no deadline.
    pub stream_open_timeout: Duration,
    /// Streams half-closed locally for longer than this are reset.
    pub stream_close_timeout: Option<Duration>,
    /// Upper bound on a graceful drain before the session is forced shut.
    pub drain_timeout: Option<Duration>,
    /// Frames the stream queue holds before writers block.
    pub write_queue_depth: usize,
    /// Honour peers that ask to open streams without flow control.
    pub allow_unbounded_streams: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_backlog: 256,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(30),
            enable_keepalive: true,
            max_streams: u32::MAX,
            connection_write_timeout: Duration::from_secs(10),
            stream_open_timeout: Duration::from_secs(75),
            stream_close_timeout: Some(Duration::from_secs(300)),
            drain_timeout: None,
            write_queue_depth: 64,
            allow_unbounded_streams: false,
        }
    }
}

impl Config {
    /// Check the options for values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.accept_backlog == 0 {
            return Err(Error::InvalidConfig("accept_backlog must be positive"));
        }
        if self.initial_window_size == 0 {
            return Err(Error::InvalidConfig("initial_window_size must be positive"));
        }
        if self.max_frame_size == 0 {
            return Err(Error::InvalidConfig("max_frame_size must be positive"));
        }
        if self.enable_keepalive {
            if self.keepalive_interval.is_zero() {
                return Err(Error::InvalidConfig("keepalive_interval must be positive"));
            }
            if self.keepalive_timeout.is_zero() {
                return Err(Error::InvalidConfig("keepalive_timeout must be positive"));
            }
        }
        if self.max_streams < 2 {
            return Err(Error::InvalidConfig("max_streams must allow both roles an id"));
        }
        if self.write_queue_depth == 0 {
            return Err(Error::InvalidConfig("write_queue_depth must be positive"));
        }
        Ok(())
    }
}
