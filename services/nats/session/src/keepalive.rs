//! Keepalive protocol with PING/PONG and RTT measurement.
//!
//! PONGs carry no correlation id, and the server answers PINGs in order, so
//! outstanding PINGs are tracked as a FIFO of send times.

use bytes::Bytes;
use nats_wire::{PING, PONG};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Build a PING line
pub fn build_ping() -> Bytes {
    Bytes::from_static(PING)
}

/// Build a PONG line in response to a PING
pub fn build_pong() -> Bytes {
    Bytes::from_static(PONG)
}

/// Outstanding client PINGs
#[derive(Debug, Default)]
pub struct Keepalive {
    outstanding: VecDeque<Instant>,
    last_rtt: Option<Duration>,
}

impl Keepalive {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a PING sent at `now`
    pub fn record_ping(&mut self, now: Instant) {
        self.outstanding.push_back(now);
    }

    /// Match a PONG against the oldest outstanding PING
    ///
    /// Returns `None` for an unsolicited PONG.
    pub fn process_pong(&mut self, now: Instant) -> Option<Duration> {
        let sent = self.outstanding.pop_front()?;
        let rtt = now.saturating_duration_since(sent);
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    /// Number of PINGs without a PONG
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Most recent round trip
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Forget outstanding PINGs
    pub fn reset(&mut self) {
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nats_wire::{FrameDecoder, RawFrame};

    #[test]
    fn test_ping_pong_frames() {
        let mut decoder = FrameDecoder::new();
        let mut wire = build_ping().to_vec();
        wire.extend_from_slice(&build_pong());

        assert_eq!(decoder.feed(&wire), vec![RawFrame::Ping, RawFrame::Pong]);
    }

    #[test]
    fn test_rtt_is_fifo() {
        let start = Instant::now();
        let mut keepalive = Keepalive::new();
        keepalive.record_ping(start);
        keepalive.record_ping(start + Duration::from_millis(10));
        assert_eq!(keepalive.outstanding(), 2);

        let first = keepalive.process_pong(start + Duration::from_millis(15));
        assert_eq!(first, Some(Duration::from_millis(15)));
        let second = keepalive.process_pong(start + Duration::from_millis(15));
        assert_eq!(second, Some(Duration::from_millis(5)));
        assert_eq!(keepalive.last_rtt(), Some(Duration::from_millis(5)));
        assert_eq!(keepalive.outstanding(), 0);
    }

    #[test]
    fn test_unsolicited_pong() {
        let mut keepalive = Keepalive::new();
        assert_eq!(keepalive.process_pong(Instant::now()), None);
        assert_eq!(keepalive.last_rtt(), None);
    }

    #[test]
    fn test_reset_forgets_outstanding() {
        let now = Instant::now();
        let mut keepalive = Keepalive::new();
        keepalive.record_ping(now);
        keepalive.record_ping(now);
        keepalive.reset();

        assert_eq!(keepalive.outstanding(), 0);
        assert_eq!(keepalive.process_pong(now), None);
    }
}
