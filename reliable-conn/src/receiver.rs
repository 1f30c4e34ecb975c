//! Inbound data acceptance for one connection.
//!
//! The [`Receiver`] decides what happens to a data packet *after* it passed
//! the connection's endpoint check and *before* the application reads it:
//! - A packet newer than the last one delivered is accepted and queued.
//! - A packet at or behind the last one delivered is a duplicate (its ACK was
//!   probably lost) and is dropped.
//!
//! Either way the caller acknowledges the packet.  Sequence numbers are
//! compared in wrap-around space.

use std::collections::VecDeque;

/// `true` when `a` precedes `b` in wrap-around sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    let diff = b.wrapping_sub(a);
    diff != 0 && diff <= u32::MAX / 2
}

#[derive(Debug)]
pub struct Receiver {
    /// Sequence number of the newest packet accepted from the peer.
    last_seq: u32,
    /// Accepted payloads not yet read by the application.
    app_buffer: VecDeque<Vec<u8>>,
}

impl Receiver {
    /// `peer_isn` is the sequence number of the peer's handshake packet;
    /// every later packet from the peer carries a newer one.
    pub fn new(peer_isn: u32) -> Self {
        Self {
            last_seq: peer_isn,
            app_buffer: VecDeque::new(),
        }
    }

    /// Process an inbound data packet.  Returns `true` if it was new and
    /// queued for the application.
    pub fn on_data(&mut self, seq: u32, payload: &[u8]) -> bool {
        if seq_lt(self.last_seq, seq) {
            self.last_seq = seq;
            self.app_buffer.push_back(payload.to_vec());
            true
        } else {
            false
        }
    }

    /// Next unread payload, oldest first.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        self.app_buffer.pop_front()
    }

    #[cfg(test)]
    fn last_seq(&self) -> u32 {
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_packet_is_accepted() {
        let mut r = Receiver::new(100);
        assert!(r.on_data(101, b"hello"));
        assert_eq!(r.last_seq(), 101);
        assert_eq!(r.read().as_deref(), Some(&b"hello"[..]));
        assert!(r.read().is_none());
    }

    #[test]
    fn gaps_are_fine() {
        // The peer's ACKs consume sequence numbers too.
        let mut r = Receiver::new(100);
        assert!(r.on_data(104, b"a"));
        assert!(r.on_data(107, b"b"));
        assert_eq!(r.last_seq(), 107);
    }

    #[test]
    fn duplicate_is_dropped() {
        let mut r = Receiver::new(100);
        assert!(r.on_data(101, b"once"));
        assert!(!r.on_data(101, b"once"));
        assert!(r.read().is_some());
        assert_eq!(r.read(), None);
    }

    #[test]
    fn stale_packet_is_dropped() {
        let mut r = Receiver::new(100);
        assert!(r.on_data(110, b"new"));
        assert!(!r.on_data(105, b"old"));
        assert_eq!(r.last_seq(), 110);
    }

    #[test]
    fn handshake_sequence_is_not_data() {
        let mut r = Receiver::new(100);
        assert!(!r.on_data(100, b"syn-echo"));
    }

    #[test]
    fn seq_wrap_around() {
        let mut r = Receiver::new(u32::MAX - 1);
        assert!(r.on_data(u32::MAX, b"a"));
        assert!(r.on_data(2, b"b"));
        assert!(!r.on_data(u32::MAX, b"a"));
        assert!(seq_lt(u32::MAX, 0));
        assert!(!seq_lt(0, u32::MAX));
    }

    #[test]
    fn reads_preserve_order() {
        let mut r = Receiver::new(0);
        r.on_data(1, b"first");
        r.on_data(2, b"second");
        assert_eq!(r.read().unwrap(), b"first");
        assert_eq!(r.read().unwrap(), b"second");
    }
}
