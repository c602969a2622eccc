pub mod config;
pub mod cx;
pub mod error;
pub mod flow_control;
pub mod memory;
mod monitor;
pub mod session;
mod shutdown;
pub mod stream;
pub mod transport;
mod writer;

pub use config::Config;
pub use cx::{CancelToken, Cx};
pub use error::{Error, Result};
pub use session::{OpenOptions, Role, Session, SessionState};
pub use stream::{Stream, StreamState};
pub use transport::{Halves, Transport, TransportCloser};
pub use writer::MAX_PENDING_CONTROL;
