//! Wire-format definitions for protocol packets.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Building well-formed control (SYN / ACK / FIN) and data packets.
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed, truncated or corrupted input.
//!
//! No I/O happens here; this is pure data transformation.  Sequence numbers
//! are handed in by the caller; the connection owns the counters.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flag      |              Source Address ...               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... (cont.)  |          Source Port          |  Dest Addr ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        ... Dest Address (cont.)               |   Dest Port ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   ... (cont.)  |        Payload Length         |   Checksum ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   ... (cont.)  |                Payload ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 25 bytes.
//! seq(4) + ack(4) + flag(1) + src(4+2) + dst(4+2) + payload_len(2) + checksum(2)

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 25;

/// Largest UDP payload an IPv4 datagram can carry.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Largest payload a single packet can carry; header and payload must fit
/// one datagram.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM_LEN - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAG: usize = 8;
const OFF_SRC_ADDR: usize = 9;
const OFF_SRC_PORT: usize = 13;
const OFF_DST_ADDR: usize = 15;
const OFF_DST_PORT: usize = 19;
const OFF_PAYLOAD_LEN: usize = 21;
const OFF_CHECKSUM: usize = 23;

/// The single flag a packet carries.  Flags are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    /// Plain data packet.
    None = 0,
    /// Handshake initiation.
    Syn = 1,
    /// Acknowledgement; `ack` names the acknowledged sequence number.
    Ack = 2,
    /// Teardown initiation.
    Fin = 3,
}

impl TryFrom<u8> for Flag {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Flag::None),
            1 => Ok(Flag::Syn),
            2 => Ok(Flag::Ack),
            3 => Ok(Flag::Fin),
            other => Err(PacketError::UnknownFlag(other)),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Flag::None => "DATA",
            Flag::Syn => "SYN",
            Flag::Ack => "ACK",
            Flag::Fin => "FIN",
        };
        f.write_str(name)
    }
}

/// A complete protocol datagram: addressing, flag, sequence numbers, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flag: Flag,
    /// Sequence number drawn from the sender's counter.
    pub seq: u32,
    /// For [`Flag::Ack`] packets: the `seq` being acknowledged.  Zero otherwise.
    pub ack: u32,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    /// Application bytes.  Always empty on control packets.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a payload-less control packet (`SYN`, `ACK` or `FIN`).
    pub fn control(flag: Flag, seq: u32, src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        debug_assert!(flag != Flag::None, "control packet built with the data flag");
        Self {
            flag,
            seq,
            ack: 0,
            src,
            dst,
            payload: Vec::new(),
        }
    }

    /// Build a data packet carrying `payload`.
    pub fn data(seq: u32, src: SocketAddrV4, dst: SocketAddrV4, payload: Vec<u8>) -> Self {
        Self {
            flag: Flag::None,
            seq,
            ack: 0,
            src,
            dst,
            payload,
        }
    }

    /// Build the acknowledgement of `acked`, sent from `src` back to its source.
    pub fn ack_of(acked: &Packet, seq: u32, src: SocketAddrV4) -> Self {
        Self {
            ack: acked.seq,
            ..Self::control(Flag::Ack, seq, src, acked.src)
        }
    }

    /// `true` when this is an ACK for the packet carrying sequence number `seq`.
    pub fn acknowledges(&self, seq: u32) -> bool {
        self.flag == Flag::Ack && self.ack == seq
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The payload length and checksum are computed here.  Fails only when the
    /// packet would not fit one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_FLAG] = self.flag as u8;
        buf[OFF_SRC_ADDR..OFF_SRC_ADDR + 4].copy_from_slice(&self.src.ip().octets());
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.src.port().to_be_bytes());
        buf[OFF_DST_ADDR..OFF_DST_ADDR + 4].copy_from_slice(&self.dst.ip().octets());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.dst.port().to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        // Checksum field stays zero while computing the checksum.

        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the payload length field disagrees with `buf.len()`,
    /// - the checksum does not verify, or
    /// - the flag byte is not a known [`Flag`], or a control packet carries a payload.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }

        let payload_len = usize::from(read_u16(buf, OFF_PAYLOAD_LEN));
        if buf.len() != HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch);
        }

        // Verify checksum: zero the stored field, recompute, compare.
        let checksum = read_u16(buf, OFF_CHECKSUM);
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].fill(0);
        if internet_checksum(&scratch) != checksum {
            return Err(PacketError::ChecksumFailed);
        }

        let flag = Flag::try_from(buf[OFF_FLAG])?;
        if flag != Flag::None && payload_len != 0 {
            return Err(PacketError::ControlWithPayload(flag));
        }

        Ok(Packet {
            flag,
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            src: SocketAddrV4::new(read_ipv4(buf, OFF_SRC_ADDR), read_u16(buf, OFF_SRC_PORT)),
            dst: SocketAddrV4::new(read_ipv4(buf, OFF_DST_ADDR), read_u16(buf, OFF_DST_PORT)),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq={}", self.flag, self.seq)?;
        if self.flag == Flag::Ack {
            write!(f, " ack={}", self.ack)?;
        }
        write!(f, " {} -> {} len={}", self.src, self.dst, self.payload.len())
    }
}

/// Errors that can arise when building or parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("unknown flag byte {0:#04x}")]
    UnknownFlag(u8),
    #[error("{0} packet carries a payload")]
    ControlWithPayload(Flag),
    #[error("payload of {0} bytes does not fit one datagram")]
    PayloadTooLarge(usize),
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_ipv4(buf: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3])
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// The caller must zero any checksum field within `data` before calling.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte, padded with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
