//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
///
/// Decode-time errors travel inside the frame stream as
/// [`RawFrame::ProtocolError`](crate::RawFrame::ProtocolError), so they are
/// cheap to clone and compare.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Server reported an error with `-ERR`
    #[error("server error: {0}")]
    Server(String),

    /// Control line carried a command this client does not know
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Control line had the wrong shape for its command
    #[error("malformed {command} line ({reason}): {line}")]
    Malformed {
        /// Command token of the offending line
        command: String,
        /// What was wrong with it
        reason: String,
        /// The raw line, for diagnostics
        line: String,
    },

    /// INFO payload was not valid JSON
    #[error("invalid INFO payload: {0}")]
    InvalidInfo(String),

    /// Payload was not followed by CRLF
    #[error("missing CRLF after {command} payload for subject {subject}")]
    MissingTerminator {
        /// MSG or HMSG
        command: &'static str,
        /// Subject of the dropped frame
        subject: String,
    },

    /// Buffered bytes exceeded the control line limit without a CRLF
    #[error("control line exceeds {0} bytes")]
    ControlLineTooLong(usize),

    /// Declared size exceeds the configured limit
    #[error("size limit exceeded: {size} (max {max})")]
    Size {
        /// Declared size
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Subject or filter failed validation
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    /// Queue group name failed validation
    #[error("invalid queue group: {0:?}")]
    InvalidQueueGroup(String),

    /// Header block could not be parsed or encoded
    #[error("invalid header block: {0}")]
    Header(String),
}

impl WireError {
    pub(crate) fn malformed(command: &str, reason: impl Into<String>, line: &[u8]) -> Self {
        Self::Malformed {
            command: command.to_string(),
            reason: reason.into(),
            line: String::from_utf8_lossy(line).into_owned(),
        }
    }

    /// Whether the server closes the connection after sending this error
    ///
    /// The server follows these `-ERR` messages with a disconnect, so there
    /// is nothing to gain from keeping the session alive.
    pub fn is_fatal_server_error(&self) -> bool {
        match self {
            Self::Server(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.starts_with("stale connection")
                    || msg.starts_with("authorization violation")
                    || msg.starts_with("authentication timeout")
                    || msg.starts_with("maximum connections exceeded")
                    || msg.starts_with("maximum payload violation")
                    || msg.starts_with("unknown protocol operation")
                    || msg.starts_with("secure connection")
            }
            _ => false,
        }
    }
}
