//! Routes decoded frames to their consumers.
//!
//! The dispatcher runs synchronously inside the session's read path. Every
//! reply it owes the server (PONG, CONNECT) is enqueued on the outbound
//! before `handle` returns, so it precedes any later frame of the batch.

use crate::handshake::{build_connect, ConnectOptions};
use crate::keepalive::{build_pong, Keepalive};
use crate::registry::{Delivery, Message, SubscriptionRegistry};
use bytes::Bytes;
use nats_wire::{HMsgFrame, HeaderMap, MsgFrame, RawFrame, ServerInfo, WireError};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Sink for bytes headed to the server
pub trait Outbound {
    /// Queue bytes for writing, in order
    fn enqueue(&mut self, bytes: Bytes);
}

impl Outbound for Vec<Bytes> {
    fn enqueue(&mut self, bytes: Bytes) {
        self.push(bytes);
    }
}

impl Outbound for mpsc::UnboundedSender<Bytes> {
    fn enqueue(&mut self, bytes: Bytes) {
        if self.send(bytes).is_err() {
            debug!("Outbound channel closed, dropping write");
        }
    }
}

/// What to do with a non-fatal protocol error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Report it and keep going
    #[default]
    Skip,
    /// Report it and close the connection
    Close,
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "close" => Ok(Self::Close),
            other => Err(format!("unknown error policy {other:?} (expected skip or close)")),
        }
    }
}

/// Connection-level notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Server sent INFO
    Info(Box<ServerInfo>),
    /// Server answered a client PING
    Pong {
        /// Round trip, if the PONG matched an outstanding PING
        rtt: Option<Duration>,
    },
    /// Server acknowledged an operation in verbose mode
    Ok,
    /// Protocol error, from the decoder or the server
    Error(WireError),
}

/// Whether the session should keep reading
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Keep going
    Continue,
    /// Close the connection with this error
    Close(WireError),
}

/// Counters kept by the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages handed to a subscription handler
    pub messages_delivered: u64,
    /// Messages for an unknown sid
    pub messages_dropped: u64,
    /// Server PINGs answered
    pub pings_answered: u64,
    /// Protocol errors seen
    pub protocol_errors: u64,
}

/// Frame dispatcher for one connection
pub struct Dispatcher<O: Outbound> {
    registry: SubscriptionRegistry,
    outbound: O,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
    connect: ConnectOptions,
    policy: ErrorPolicy,
    keepalive: Keepalive,
    server_info: Option<Box<ServerInfo>>,
    stats: DispatchStats,
}

impl<O: Outbound> Dispatcher<O> {
    /// Create a dispatcher writing to `outbound`
    pub fn new(registry: SubscriptionRegistry, outbound: O, connect: ConnectOptions) -> Self {
        Self {
            registry,
            outbound,
            events: None,
            connect,
            policy: ErrorPolicy::default(),
            keepalive: Keepalive::new(),
            server_info: None,
            stats: DispatchStats::default(),
        }
    }

    /// Emit [`ClientEvent`]s on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the protocol error policy
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Handle one frame
    pub fn handle(&mut self, frame: RawFrame) -> Flow {
        trace!("Dispatching {}", frame.name());
        match frame {
            RawFrame::Info(info) => self.on_info(info),
            RawFrame::Msg(msg) => {
                self.on_msg(msg);
                Flow::Continue
            }
            RawFrame::HMsg(hmsg) => self.on_hmsg(hmsg),
            RawFrame::Ping => {
                self.outbound.enqueue(build_pong());
                self.stats.pings_answered += 1;
                debug!("Answered server PING");
                Flow::Continue
            }
            RawFrame::Pong => {
                let rtt = self.keepalive.process_pong(Instant::now());
                match rtt {
                    Some(rtt) => debug!("Received PONG (rtt: {:?})", rtt),
                    None => debug!("Received unsolicited PONG"),
                }
                self.emit(ClientEvent::Pong { rtt });
                Flow::Continue
            }
            RawFrame::Ok => {
                self.emit(ClientEvent::Ok);
                Flow::Continue
            }
            RawFrame::ProtocolError(err) => self.on_error(err),
        }
    }

    /// Handle frames in order, stopping at the first close
    pub fn handle_all(&mut self, frames: impl IntoIterator<Item = RawFrame>) -> Flow {
        for frame in frames {
            if let Flow::Close(err) = self.handle(frame) {
                return Flow::Close(err);
            }
        }
        Flow::Continue
    }

    fn on_info(&mut self, info: Box<ServerInfo>) -> Flow {
        // Later INFOs are cluster updates and need no CONNECT
        if self.server_info.is_none() {
            info!(
                "Connected to server {} (version {}, max_payload {})",
                info.server_id, info.version, info.max_payload
            );
            match build_connect(&info, &self.connect) {
                Ok(line) => self.outbound.enqueue(line),
                Err(e) => return self.on_error(e),
            }
        } else {
            debug!("Received INFO update from {}", info.server_id);
        }
        self.emit(ClientEvent::Info(info.clone()));
        self.server_info = Some(info);
        Flow::Continue
    }

    fn on_msg(&mut self, msg: MsgFrame) {
        self.deliver(Message {
            subject: msg.subject,
            sid: msg.sid,
            reply_to: msg.reply_to,
            headers: None,
            payload: msg.payload,
        });
    }

    fn on_hmsg(&mut self, hmsg: HMsgFrame) -> Flow {
        let headers = match HeaderMap::decode(&hmsg.header_block) {
            Ok(headers) => headers,
            Err(e) => return self.on_error(e),
        };
        self.deliver(Message {
            subject: hmsg.subject,
            sid: hmsg.sid,
            reply_to: hmsg.reply_to,
            headers: Some(headers),
            payload: hmsg.payload,
        });
        Flow::Continue
    }

    fn deliver(&mut self, message: Message) {
        let sid = message.sid;
        match self.registry.deliver(message) {
            Delivery::Delivered => self.stats.messages_delivered += 1,
            Delivery::Completed(sub) => {
                self.stats.messages_delivered += 1;
                debug!("Subscription {} on {} reached its limit", sub.sid, sub.filter);
            }
            Delivery::NotFound => {
                self.stats.messages_dropped += 1;
                debug!("Dropping message for unknown sid {}", sid);
            }
        }
    }

    fn on_error(&mut self, err: WireError) -> Flow {
        self.stats.protocol_errors += 1;
        warn!("Protocol error: {}", err);
        self.emit(ClientEvent::Error(err.clone()));
        if err.is_fatal_server_error() || self.policy == ErrorPolicy::Close {
            Flow::Close(err)
        } else {
            Flow::Continue
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine
            let _ = events.send(event);
        }
    }

    /// Outbound sink
    pub fn outbound(&self) -> &O {
        &self.outbound
    }

    /// Outbound sink, mutably
    pub fn outbound_mut(&mut self) -> &mut O {
        &mut self.outbound
    }

    /// Keepalive tracker
    pub fn keepalive(&self) -> &Keepalive {
        &self.keepalive
    }

    /// Keepalive tracker, mutably
    pub fn keepalive_mut(&mut self) -> &mut Keepalive {
        &mut self.keepalive
    }

    /// INFO from the server, once received
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_deref()
    }

    /// Counters
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Subscription registry
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }
}
