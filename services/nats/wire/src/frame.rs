//! Inbound frame decoding.
//!
//! [`FrameDecoder`] owns the byte accumulator for one connection. Bytes are
//! appended with [`FrameDecoder::feed`], which returns every frame those bytes
//! complete. Control lines are CRLF-terminated; MSG and HMSG bodies are
//! bounded only by their declared sizes and are never scanned for CRLF.
//!
//! The decoder is a state machine:
//!
//! ```text
//! AwaitingLine ──MSG/HMSG line──▶ AwaitingPayload(pending) ──body + CRLF──▶ AwaitingLine
//! AwaitingLine ──body > max_payload──▶ DiscardingBody ──body + CRLF──▶ AwaitingLine
//! AwaitingLine ──line > max_control_line──▶ DiscardingLine ──CRLF──▶ AwaitingLine
//! ```
//!
//! Once a MSG/HMSG control line is parsed it is kept as `pending` state, so a
//! body that arrives over many reads never causes the line to be re-parsed.
//! Limit violations are reported once and the offending bytes are skipped, so
//! the frames produced never depend on how the stream was split.

use crate::error::WireError;
use crate::info::ServerInfo;
use bytes::{Buf, Bytes, BytesMut};
use smallvec::SmallVec;
use tracing::{trace, warn};

/// Line terminator
pub const CRLF: &[u8] = b"\r\n";

/// Default payload limit (64 MiB) until the server advertises its own
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Default control line limit (64 KiB); INFO lines can be long
pub const DEFAULT_MAX_CONTROL_LINE: usize = 64 * 1024;

/// Meaning of the last size argument of HMSG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HmsgSize {
    /// `HMSG <subject> <sid> [reply] <hdr_len> <payload_len>`
    #[default]
    Payload,
    /// `HMSG <subject> <sid> [reply] <hdr_len> <total_len>` as nats-server sends it
    Total,
}

/// Decoder limits and dialect
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Largest MSG/HMSG body accepted
    pub max_payload: usize,
    /// Largest control line accepted
    pub max_control_line: usize,
    /// How HMSG sizes are declared
    pub hmsg_size: HmsgSize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_control_line: DEFAULT_MAX_CONTROL_LINE,
            hmsg_size: HmsgSize::Payload,
        }
    }
}

/// Message delivered with `MSG`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgFrame {
    /// Subject the message was published on
    pub subject: String,
    /// Subscription the server matched
    pub sid: u64,
    /// Reply subject, if the publisher set one
    pub reply_to: Option<String>,
    /// Exactly the declared number of payload bytes
    pub payload: Bytes,
}

/// Message delivered with `HMSG`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HMsgFrame {
    /// Subject the message was published on
    pub subject: String,
    /// Subscription the server matched
    pub sid: u64,
    /// Reply subject, if the publisher set one
    pub reply_to: Option<String>,
    /// Raw header block, including its terminating blank line
    pub header_block: Bytes,
    /// Exactly the declared number of payload bytes
    pub payload: Bytes,
}

/// One decoded protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    /// `INFO <json>`
    Info(Box<ServerInfo>),
    /// `MSG ...` plus payload
    Msg(MsgFrame),
    /// `HMSG ...` plus header block and payload
    HMsg(HMsgFrame),
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
    /// `+OK`
    Ok,
    /// `-ERR`, or a line this decoder could not use
    ProtocolError(WireError),
}

impl RawFrame {
    /// Command name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            RawFrame::Info(_) => "INFO",
            RawFrame::Msg(_) => "MSG",
            RawFrame::HMsg(_) => "HMSG",
            RawFrame::Ping => "PING",
            RawFrame::Pong => "PONG",
            RawFrame::Ok => "+OK",
            RawFrame::ProtocolError(_) => "-ERR",
        }
    }
}

/// MSG/HMSG control line waiting for its body
#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: u64,
    reply_to: Option<String>,
    header_len: Option<usize>,
    payload_len: usize,
}

impl PendingMsg {
    fn body_len(&self) -> usize {
        self.header_len.unwrap_or(0) + self.payload_len
    }

    fn command(&self) -> &'static str {
        if self.header_len.is_some() {
            "HMSG"
        } else {
            "MSG"
        }
    }
}

#[derive(Debug)]
enum DecodeState {
    /// Looking for CRLF; bytes before `scanned` are known not to contain one
    AwaitingLine { scanned: usize },
    /// Control line consumed; waiting for body plus trailing CRLF
    AwaitingPayload(PendingMsg),
    /// Dropping the rest of an over-long control line up to its CRLF
    DiscardingLine,
    /// Dropping the body and CRLF of a MSG/HMSG over `max_payload`
    DiscardingBody { remaining: usize },
}

impl DecodeState {
    const fn line() -> Self {
        DecodeState::AwaitingLine { scanned: 0 }
    }
}

/// Result of parsing one control line
enum Line {
    Frame(RawFrame),
    Payload(PendingMsg),
    Oversized { err: WireError, skip: usize },
    Empty,
}

/// Stateful stream decoder for one connection
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    state: DecodeState,
    config: DecoderConfig,
}

impl FrameDecoder {
    /// Create a decoder with default limits
    pub fn new() -> Self {
        Self::with_config(DecoderConfig::default())
    }

    /// Create a decoder with explicit limits
    pub fn with_config(config: DecoderConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            state: DecodeState::line(),
            config,
        }
    }

    /// Current configuration
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Change the payload limit, e.g. to the server's `max_payload`
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.config.max_payload = max_payload;
    }

    /// Bytes held for a frame that is not complete yet
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Whether a MSG/HMSG control line is waiting for its body
    pub fn is_awaiting_payload(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingPayload(_))
    }

    /// Drop buffered bytes and any frame in progress
    ///
    /// Used when the connection closes; the partial frame is discarded
    /// without producing anything.
    pub fn reset(&mut self) {
        if !self.buf.is_empty() || self.is_awaiting_payload() {
            trace!("Discarding {} buffered bytes", self.buf.len());
        }
        self.buf.clear();
        self.state = DecodeState::line();
    }

    /// Append `chunk` and decode every frame it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buf.extend_from_slice(chunk);
        trace!(
            "Fed {} bytes, buffer now has {} bytes",
            chunk.len(),
            self.buf.len()
        );

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Decode one frame from already buffered bytes
    ///
    /// Returns `None` when the buffer holds no complete frame.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::line()) {
                DecodeState::AwaitingPayload(pending) => {
                    if self.buf.len() < pending.body_len() + CRLF.len() {
                        self.state = DecodeState::AwaitingPayload(pending);
                        return None;
                    }
                    return Some(self.take_body(pending));
                }
                DecodeState::DiscardingBody { remaining } => {
                    let n = remaining.min(self.buf.len());
                    self.buf.advance(n);
                    if n < remaining {
                        self.state = DecodeState::DiscardingBody {
                            remaining: remaining - n,
                        };
                        return None;
                    }
                }
                DecodeState::DiscardingLine => match find_crlf(&self.buf, 0) {
                    Some(end) => self.buf.advance(end + CRLF.len()),
                    None => {
                        self.discard_partial_line();
                        self.state = DecodeState::DiscardingLine;
                        return None;
                    }
                },
                DecodeState::AwaitingLine { scanned } => {
                    let Some(end) = find_crlf(&self.buf, scanned) else {
                        // a trailing CR may belong to a CRLF split across reads
                        let line_len = self.buf.len() - usize::from(self.buf.ends_with(b"\r"));
                        if line_len > self.config.max_control_line {
                            warn!("Discarding {} bytes without a line terminator", line_len);
                            self.discard_partial_line();
                            self.state = DecodeState::DiscardingLine;
                            return Some(RawFrame::ProtocolError(WireError::ControlLineTooLong(
                                self.config.max_control_line,
                            )));
                        }
                        // keep the last byte in range: it may be the CR of a split CRLF
                        self.state = DecodeState::AwaitingLine {
                            scanned: self.buf.len().saturating_sub(1),
                        };
                        return None;
                    };

                    let line = self.buf.split_to(end);
                    self.buf.advance(CRLF.len());

                    if line.len() > self.config.max_control_line {
                        return Some(RawFrame::ProtocolError(WireError::ControlLineTooLong(
                            self.config.max_control_line,
                        )));
                    }

                    match self.parse_line(&line) {
                        Ok(Line::Frame(frame)) => return Some(frame),
                        Ok(Line::Payload(pending)) => {
                            self.state = DecodeState::AwaitingPayload(pending);
                        }
                        Ok(Line::Oversized { err, skip }) => {
                            self.state = DecodeState::DiscardingBody { remaining: skip };
                            return Some(RawFrame::ProtocolError(err));
                        }
                        Ok(Line::Empty) => {}
                        Err(err) => return Some(RawFrame::ProtocolError(err)),
                    }
                }
            }
        }
    }

    /// Drop buffered bytes of an unterminated line, keeping a trailing CR
    fn discard_partial_line(&mut self) {
        let keep = usize::from(self.buf.ends_with(b"\r"));
        self.buf.advance(self.buf.len() - keep);
    }

    /// Split the body off the buffer once `body_len + 2` bytes are present
    fn take_body(&mut self, pending: PendingMsg) -> RawFrame {
        let header_block = pending.header_len.map(|n| self.buf.split_to(n).freeze());
        let payload = self.buf.split_to(pending.payload_len).freeze();
        let terminator = self.buf.split_to(CRLF.len());

        if &terminator[..] != CRLF {
            return RawFrame::ProtocolError(WireError::MissingTerminator {
                command: pending.command(),
                subject: pending.subject,
            });
        }

        match header_block {
            Some(header_block) => RawFrame::HMsg(HMsgFrame {
                subject: pending.subject,
                sid: pending.sid,
                reply_to: pending.reply_to,
                header_block,
                payload,
            }),
            None => RawFrame::Msg(MsgFrame {
                subject: pending.subject,
                sid: pending.sid,
                reply_to: pending.reply_to,
                payload,
            }),
        }
    }

    fn parse_line(&self, line: &[u8]) -> Result<Line, WireError> {
        let (command, rest) = split_command(line);
        if command.is_empty() {
            return Ok(Line::Empty);
        }

        let args: SmallVec<[&[u8]; 6]> = rest
            .split(u8::is_ascii_whitespace)
            .filter(|t| !t.is_empty())
            .collect();

        match command.to_ascii_uppercase().as_slice() {
            b"MSG" => self.parse_msg(&args, line).map(|p| self.expect_body(p)),
            b"HMSG" => self.parse_hmsg(&args, line).map(|p| self.expect_body(p)),
            b"PING" => Ok(Line::Frame(RawFrame::Ping)),
            b"PONG" => Ok(Line::Frame(RawFrame::Pong)),
            b"+OK" => Ok(Line::Frame(RawFrame::Ok)),
            b"-ERR" => {
                let text = String::from_utf8_lossy(rest);
                let text = text.trim();
                let text = text
                    .strip_prefix('\'')
                    .and_then(|t| t.strip_suffix('\''))
                    .unwrap_or(text);
                Ok(Line::Frame(RawFrame::ProtocolError(WireError::Server(
                    text.to_string(),
                ))))
            }
            b"INFO" => {
                let info = ServerInfo::from_json(rest)?;
                Ok(Line::Frame(RawFrame::Info(Box::new(info))))
            }
            _ => Err(WireError::UnknownCommand(
                String::from_utf8_lossy(line).into_owned(),
            )),
        }
    }

    fn parse_msg(&self, args: &[&[u8]], line: &[u8]) -> Result<PendingMsg, WireError> {
        let (subject, sid, reply_to, size) = match *args {
            [subject, sid, size] => (subject, sid, None, size),
            [subject, sid, reply_to, size] => (subject, sid, Some(reply_to), size),
            _ => {
                return Err(WireError::malformed(
                    "MSG",
                    format!("expected 3 or 4 arguments, got {}", args.len()),
                    line,
                ))
            }
        };

        Ok(PendingMsg {
            subject: parse_text("MSG", subject, line)?,
            sid: parse_number("MSG", sid, line)?,
            reply_to: reply_to.map(|r| parse_text("MSG", r, line)).transpose()?,
            header_len: None,
            payload_len: parse_number("MSG", size, line)?,
        })
    }

    fn parse_hmsg(&self, args: &[&[u8]], line: &[u8]) -> Result<PendingMsg, WireError> {
        let (subject, sid, reply_to, header_size, size) = match *args {
            [subject, sid, header_size, size] => (subject, sid, None, header_size, size),
            [subject, sid, reply_to, header_size, size] => {
                (subject, sid, Some(reply_to), header_size, size)
            }
            _ => {
                return Err(WireError::malformed(
                    "HMSG",
                    format!("expected 4 or 5 arguments, got {}", args.len()),
                    line,
                ))
            }
        };

        let header_len: usize = parse_number("HMSG", header_size, line)?;
        let size: usize = parse_number("HMSG", size, line)?;

        let payload_len = match self.config.hmsg_size {
            HmsgSize::Payload => size,
            HmsgSize::Total => size.checked_sub(header_len).ok_or_else(|| {
                WireError::malformed("HMSG", "header size exceeds total size", line)
            })?,
        };
        header_len
            .checked_add(payload_len)
            .ok_or_else(|| WireError::malformed("HMSG", "size overflow", line))?;

        Ok(PendingMsg {
            subject: parse_text("HMSG", subject, line)?,
            sid: parse_number("HMSG", sid, line)?,
            reply_to: reply_to.map(|r| parse_text("HMSG", r, line)).transpose()?,
            header_len: Some(header_len),
            payload_len,
        })
    }

    /// Wait for the body, or skip it unparsed when it is over the limit
    fn expect_body(&self, pending: PendingMsg) -> Line {
        let size = pending.body_len();
        if size <= self.config.max_payload {
            return Line::Payload(pending);
        }
        warn!(
            "Skipping {} body of {} bytes on {}",
            pending.command(),
            size,
            pending.subject
        );
        Line::Oversized {
            err: WireError::Size {
                size,
                max: self.config.max_payload,
            },
            skip: size.saturating_add(CRLF.len()),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the first CRLF at or after `from`
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(CRLF.len())
        .position(|w| w == CRLF)
        .map(|pos| pos + from)
}

/// Split a control line into its command token and the raw remainder
fn split_command(line: &[u8]) -> (&[u8], &[u8]) {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let line = &line[start..];
    let end = line
        .iter()
        .position(u8::is_ascii_whitespace)
        .unwrap_or(line.len());
    (&line[..end], &line[end..])
}

/// Parse a decimal size or sid; only ASCII digits are accepted
fn parse_number<T: std::str::FromStr>(
    command: &str,
    token: &[u8],
    line: &[u8],
) -> Result<T, WireError> {
    if token.is_empty() || !token.iter().all(u8::is_ascii_digit) {
        return Err(WireError::malformed(
            command,
            format!("not a number: {}", String::from_utf8_lossy(token)),
            line,
        ));
    }
    // digits only, so this is valid UTF-8; parse can still overflow
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WireError::malformed(command, "number out of range", line))
}

fn parse_text(command: &str, token: &[u8], line: &[u8]) -> Result<String, WireError> {
    String::from_utf8(token.to_vec())
        .map_err(|_| WireError::malformed(command, "subject is not valid UTF-8", line))
}
