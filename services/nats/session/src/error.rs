//! Session error types.

use nats_wire::WireError;
use std::time::Duration;
use thiserror::Error;

/// Errors that end a session or fail a client operation
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An outbound operation was rejected before it was written
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A protocol error closed the session
    #[error("connection closed on protocol error: {0}")]
    Protocol(WireError),

    /// Too many PINGs went unanswered
    #[error("stale connection: {0} PINGs unanswered")]
    StaleConnection(usize),

    /// The session task is gone
    #[error("session closed")]
    Closed,

    /// A request got no reply in time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server reported no subscribers for a request
    #[error("no responders for {0}")]
    NoResponders(String),
}
