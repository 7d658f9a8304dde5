//! Bounded jitter buffer for encoded packets
//!
//! Absorbs bursty packet arrival ahead of the decoder. The buffer is
//! bounded: when full, the OLDEST packet is evicted so playback favors
//! recency over completeness.

use std::collections::VecDeque;
use std::time::Instant;

use super::types::Packet;

/// Jitter buffer configuration
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Maximum number of packets to buffer
    pub max_depth: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self { max_depth: 256 }
    }
}

/// Bounded arrival-order packet buffer
///
/// Packets arrive already ordered per source (the connection enforces
/// non-decreasing timestamps), so no reordering window is needed, only
/// bounded depth and drop accounting.
pub struct JitterBuffer {
    buffer: VecDeque<Packet>,
    config: JitterConfig,
    /// Set when the buffer hit capacity, cleared when it drains below it
    full_since: Option<Instant>,
    packets_received: u64,
    packets_dropped: u64,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            buffer: VecDeque::with_capacity(config.max_depth),
            config,
            full_since: None,
            packets_received: 0,
            packets_dropped: 0,
        }
    }

    /// Insert a packet, evicting the oldest one if the buffer is full.
    /// Returns the evicted packet, if any.
    pub fn push(&mut self, packet: Packet) -> Option<Packet> {
        self.packets_received += 1;

        let evicted = if self.buffer.len() >= self.config.max_depth {
            self.packets_dropped += 1;
            if self.full_since.is_none() {
                self.full_since = Some(Instant::now());
            }
            self.buffer.pop_front()
        } else {
            None
        };

        self.buffer.push_back(packet);
        evicted
    }

    /// Look at the oldest buffered packet without taking it
    pub fn peek(&self) -> Option<&Packet> {
        self.buffer.front()
    }

    /// Take the oldest buffered packet
    pub fn pop(&mut self) -> Option<Packet> {
        let packet = self.buffer.pop_front();
        if self.buffer.len() < self.config.max_depth {
            self.full_since = None;
        }
        packet
    }

    /// How long the buffer has been continuously at capacity
    pub fn full_for(&self) -> Option<std::time::Duration> {
        self.full_since.map(|since| since.elapsed())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard all buffered packets (resync)
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.full_since = None;
    }

    /// (received, dropped, buffered)
    pub fn stats(&self) -> (u64, u64, usize) {
        (self.packets_received, self.packets_dropped, self.buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Timestamp;
    use bytes::Bytes;

    fn make_packet(pts_us: i64) -> Packet {
        Packet::audio(Bytes::from_static(&[0u8; 4]), Timestamp::from_micros(pts_us))
    }

    #[test]
    fn test_fifo_order() {
        let mut jb = JitterBuffer::new(JitterConfig::default());
        jb.push(make_packet(1));
        jb.push(make_packet(2));
        jb.push(make_packet(3));

        assert_eq!(jb.pop().unwrap().pts.micros, 1);
        assert_eq!(jb.pop().unwrap().pts.micros, 2);
        assert_eq!(jb.pop().unwrap().pts.micros, 3);
        assert!(jb.pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut jb = JitterBuffer::new(JitterConfig { max_depth: 2 });
        assert!(jb.push(make_packet(1)).is_none());
        assert!(jb.push(make_packet(2)).is_none());

        let evicted = jb.push(make_packet(3)).expect("oldest must be evicted");
        assert_eq!(evicted.pts.micros, 1);

        // Newest survives
        assert_eq!(jb.pop().unwrap().pts.micros, 2);
        assert_eq!(jb.pop().unwrap().pts.micros, 3);

        let (received, dropped, buffered) = jb.stats();
        assert_eq!(received, 3);
        assert_eq!(dropped, 1);
        assert_eq!(buffered, 0);
    }

    #[test]
    fn test_full_dwell_tracking() {
        let mut jb = JitterBuffer::new(JitterConfig { max_depth: 1 });
        jb.push(make_packet(1));
        assert!(jb.full_for().is_none());

        jb.push(make_packet(2));
        assert!(jb.full_for().is_some());

        // Draining below capacity clears the dwell marker
        jb.pop();
        assert!(jb.full_for().is_none());
    }

    #[test]
    fn test_clear() {
        let mut jb = JitterBuffer::new(JitterConfig { max_depth: 4 });
        jb.push(make_packet(1));
        jb.push(make_packet(2));
        jb.clear();
        assert!(jb.is_empty());
        assert!(jb.pop().is_none());
    }
}
