//! Stop-and-wait retransmission state.
//!
//! [`Retransmitter`] tracks the single in-flight packet of a connection, how
//! often it has been transmitted and when its acknowledgement is due.  It does
//! **not** touch the transport; [`crate::connection::Connection`] owns the
//! send/receive loop and consults this state:
//!
//! 1. [`record_sent`](Retransmitter::record_sent) after the first transmission;
//! 2. wait for a packet until [`deadline`](Retransmitter::deadline);
//! 3. offer every inbound packet to [`on_ack`](Retransmitter::on_ack);
//! 4. on timeout, [`on_timeout`](Retransmitter::on_timeout) either hands back
//!    the identical packet to resend or reports [`LinkBroken`].
//!
//! Only an ACK naming the in-flight sequence number clears the slot; a
//! duplicate ACK for an earlier packet changes nothing.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::ConnectionConfig;
use crate::packet::Packet;

/// Every transmission of a packet went unacknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("link broken: seq {seq} unacknowledged after {attempts} transmissions")]
pub struct LinkBroken {
    pub seq: u32,
    pub attempts: u32,
}

/// A packet that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    pub packet: Packet,
    /// How many times this packet has been transmitted (1 = first send).
    pub tx_count: u32,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
}

#[derive(Debug)]
pub struct Retransmitter {
    ack_timeout: Duration,
    max_attempts: u32,
    unacked: Option<RetransmitEntry>,
}

impl Retransmitter {
    pub fn new(ack_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            ack_timeout,
            max_attempts: max_attempts.max(1),
            unacked: None,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.ack_timeout, config.max_attempts)
    }

    /// Move `packet` into the in-flight slot (first transmission).
    ///
    /// Whatever was in flight before is abandoned.
    pub fn record_sent(&mut self, packet: Packet) {
        if let Some(old) = &self.unacked {
            log::debug!("[rtx] abandoning seq={} for seq={}", old.packet.seq, packet.seq);
        }
        self.unacked = Some(RetransmitEntry {
            packet,
            tx_count: 1,
            sent_at: Instant::now(),
        });
    }

    /// When the in-flight packet should be retransmitted, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.unacked.as_ref().map(|e| e.sent_at + self.ack_timeout)
    }

    /// Offer an inbound packet.  Returns `true` if it acknowledges the
    /// in-flight packet, which clears the slot.
    pub fn on_ack(&mut self, packet: &Packet) -> bool {
        match &self.unacked {
            Some(entry) if packet.acknowledges(entry.packet.seq) => {
                log::debug!(
                    "[rtx] seq={} acknowledged after {} transmission(s)",
                    entry.packet.seq,
                    entry.tx_count
                );
                self.unacked = None;
                true
            }
            _ => false,
        }
    }

    /// The acknowledgement deadline passed.
    ///
    /// Returns the packet to send again, or [`LinkBroken`] once
    /// `max_attempts` transmissions have gone unanswered (the slot is then
    /// cleared).
    pub fn on_timeout(&mut self) -> Result<&Packet, LinkBroken> {
        match self.unacked.take() {
            None => Err(LinkBroken {
                seq: 0,
                attempts: 0,
            }),
            Some(entry) if entry.tx_count >= self.max_attempts => Err(LinkBroken {
                seq: entry.packet.seq,
                attempts: entry.tx_count,
            }),
            Some(mut entry) => {
                entry.tx_count += 1;
                entry.sent_at = Instant::now();
                Ok(&self.unacked.insert(entry).packet)
            }
        }
    }

    /// Transmissions of the in-flight packet so far, `0` when idle.
    pub fn transmissions(&self) -> u32 {
        self.unacked.as_ref().map_or(0, |e| e.tx_count)
    }

    #[cfg(test)]
    fn has_unacked(&self) -> bool {
        self.unacked.is_some()
    }

    /// Drop the in-flight packet without waiting for its ACK.
    pub fn abandon(&mut self) {
        self.unacked = None;
    }
}
