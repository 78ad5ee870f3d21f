//! NATS wire protocol: frame decoding, outbound encoding, header blocks and
//! subject matching.
//!
//! This crate has no I/O. [`FrameDecoder`] turns an arbitrarily chunked
//! inbound byte stream into [`RawFrame`]s, [`ClientOp`] encodes outbound
//! operations, and [`subject`] implements wildcard matching.
//!
//! ## Wire Format
//!
//! ```text
//! INFO <json>\r\n
//! MSG <subject> <sid> [reply-to] <payload-size>\r\n<payload>\r\n
//! HMSG <subject> <sid> [reply-to] <headers-size> <payload-size>\r\n<headers><payload>\r\n
//! PING\r\n | PONG\r\n | +OK\r\n | -ERR <message>\r\n
//!
//! CONNECT <json>\r\n                                  (outbound)
//! PUB <subject> [reply-to] <payload-size>\r\n<payload>\r\n
//! HPUB <subject> [reply-to] <headers-size> <total-size>\r\n<headers><payload>\r\n
//! SUB <subject> [queue-group] <sid>\r\n
//! UNSUB <sid> [max-msgs]\r\n
//! ```
//!
//! Payload sizes are authoritative: a payload may contain `\r\n` and is
//! never searched for it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod info;
pub mod subject;

// Re-export main types
pub use codec::{ClientOp, PING, PONG};
pub use error::WireError;
pub use frame::{
    DecoderConfig, FrameDecoder, HMsgFrame, HmsgSize, MsgFrame, RawFrame, CRLF,
    DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD,
};
pub use header::{HeaderMap, HEADER_VERSION, STATUS_NO_RESPONDERS};
pub use info::ServerInfo;
pub use subject::{matches, matches_tokens, validate_subject, SubjectFilter};
