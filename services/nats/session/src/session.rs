//! Core session loop for one server connection.
//!
//! The session owns the decoder and the dispatcher. Reads are fed to the
//! decoder, decoded frames are dispatched in order, and whatever the
//! dispatcher and the client queued is written before the next read.

use crate::dispatcher::{ClientEvent, Dispatcher, ErrorPolicy, Flow};
use crate::error::SessionError;
use crate::handshake::ConnectOptions;
use crate::keepalive::build_ping;
use crate::registry::SubscriptionRegistry;
use bytes::{Bytes, BytesMut};
use nats_wire::{DecoderConfig, FrameDecoder};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Configuration for a session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Interval between client PINGs; zero disables them
    pub ping_interval: Duration,
    /// Unanswered PINGs tolerated before the connection is considered stale
    pub max_pings_outstanding: usize,
    /// What to do with non-fatal protocol errors
    pub error_policy: ErrorPolicy,
    /// CONNECT options
    pub connect: ConnectOptions,
    /// Decoder limits
    pub decoder: DecoderConfig,
    /// Initial read buffer capacity
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(120),
            max_pings_outstanding: 2,
            error_policy: ErrorPolicy::Skip,
            connect: ConnectOptions::default(),
            decoder: DecoderConfig::default(),
            read_buffer_size: 64 * 1024,
        }
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Timestamp of last read
    pub last_frame_in: Option<Instant>,
    /// Timestamp of last write
    pub last_frame_out: Option<Instant>,
    /// Most recent RTT measurement
    pub last_rtt: Option<Duration>,
    /// Number of frames decoded
    pub frames_received: u64,
    /// Number of outbound writes
    pub frames_sent: u64,
    /// Messages handed to subscriptions
    pub messages_delivered: u64,
    /// Messages for unknown sids
    pub messages_dropped: u64,
    /// Protocol errors seen
    pub protocol_errors: u64,
}

/// Requests from a client handle to its session
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Write pre-encoded bytes
    Write(Bytes),
    /// Send a PING and track its PONG
    Ping,
    /// Close the connection
    Close,
}

/// Main session implementation
pub struct Session;

impl Session {
    /// Run a session over `stream` until it closes
    ///
    /// Returns the session statistics when the server or the client closes
    /// the connection cleanly.
    pub async fn run<S>(
        config: SessionConfig,
        stream: S,
        registry: SubscriptionRegistry,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<SessionStats, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::with_config(config.decoder.clone());
        let mut dispatcher = Dispatcher::new(registry, Vec::<Bytes>::new(), config.connect.clone())
            .with_events(events)
            .with_policy(config.error_policy);
        let mut read_buffer = BytesMut::with_capacity(config.read_buffer_size);
        let mut stats = SessionStats::default();

        let pings_enabled = !config.ping_interval.is_zero();
        let period = if pings_enabled {
            config.ping_interval
        } else {
            Duration::from_secs(3600)
        };
        let mut ping_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Starting session");

        let outcome = loop {
            // Client operations and PINGs wait until CONNECT is queued
            let connected = dispatcher.server_info().is_some();
            tokio::select! {
                biased;

                read = reader.read_buf(&mut read_buffer) => {
                    match read {
                        Ok(0) => {
                            info!("Server closed the connection");
                            break Ok(());
                        }
                        Ok(n) => {
                            stats.bytes_in += n as u64;
                            stats.last_frame_in = Some(Instant::now());
                            trace!("Read {} bytes", n);

                            let frames = decoder.feed(&read_buffer);
                            read_buffer.clear();
                            stats.frames_received += frames.len() as u64;

                            let flow = dispatcher.handle_all(frames);
                            if let Some(max) = dispatcher.server_info().map(|i| i.max_payload as usize) {
                                if max > decoder.config().max_payload {
                                    debug!("Raising max payload to {}", max);
                                    decoder.set_max_payload(max);
                                }
                            }
                            if let Flow::Close(err) = flow {
                                break Err(SessionError::Protocol(err));
                            }
                        }
                        Err(e) => {
                            error!("Read error: {}", e);
                            break Err(e.into());
                        }
                    }
                }

                command = commands.recv(), if connected => {
                    let Some(first) = command else {
                        debug!("All client handles dropped, closing session");
                        break Ok(());
                    };
                    let mut next = Some(first);
                    let mut close = false;
                    // Drain whatever else is queued into the same write
                    while let Some(command) = next {
                        match command {
                            SessionCommand::Write(bytes) => dispatcher.outbound_mut().push(bytes),
                            SessionCommand::Ping => {
                                dispatcher.keepalive_mut().record_ping(Instant::now());
                                dispatcher.outbound_mut().push(build_ping());
                            }
                            SessionCommand::Close => {
                                close = true;
                                break;
                            }
                        }
                        next = commands.try_recv().ok();
                    }
                    if close {
                        info!("Client requested close");
                        break Ok(());
                    }
                }

                _ = ping_interval.tick(), if pings_enabled && connected => {
                    let outstanding = dispatcher.keepalive().outstanding();
                    if outstanding >= config.max_pings_outstanding {
                        warn!("{} PINGs unanswered, connection is stale", outstanding);
                        break Err(SessionError::StaleConnection(outstanding));
                    }
                    dispatcher.keepalive_mut().record_ping(Instant::now());
                    dispatcher.outbound_mut().push(build_ping());
                    debug!("Sent PING ({} outstanding)", outstanding + 1);
                }
            }

            if let Err(e) = flush(&mut writer, dispatcher.outbound_mut(), &mut stats).await {
                error!("Write error: {}", e);
                break Err(e);
            }
        };

        // Writes queued alongside a close request
        if outcome.is_ok() {
            let _ = flush(&mut writer, dispatcher.outbound_mut(), &mut stats).await;
        }
        let _ = writer.shutdown().await;

        decoder.reset();
        dispatcher.keepalive_mut().reset();

        let dispatched = dispatcher.stats();
        stats.messages_delivered = dispatched.messages_delivered;
        stats.messages_dropped = dispatched.messages_dropped;
        stats.protocol_errors = dispatched.protocol_errors;
        stats.last_rtt = dispatcher.keepalive().last_rtt();

        info!(
            "Session closed ({} bytes in, {} bytes out, {} messages delivered)",
            stats.bytes_in, stats.bytes_out, stats.messages_delivered
        );
        outcome.map(|()| stats)
    }
}

async fn flush<W>(
    writer: &mut W,
    pending: &mut Vec<Bytes>,
    stats: &mut SessionStats,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    if pending.is_empty() {
        return Ok(());
    }
    for bytes in pending.drain(..) {
        writer.write_all(&bytes).await?;
        stats.bytes_out += bytes.len() as u64;
        stats.frames_sent += 1;
    }
    writer.flush().await?;
    stats.last_frame_out = Some(Instant::now());
    Ok(())
}
