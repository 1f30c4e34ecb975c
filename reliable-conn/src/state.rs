//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy.  Transitions themselves live in [`crate::connection`]; the
//! predicates here are what the connection consults before acting.
//!
//! ```text
//!  CLOSED ──connect()──▶ SYN_SENT ──ACK──────────────▶ ESTABLISHED
//!    │                                                   │      │
//!    └──accept() (new conn)──▶ SYN_RECEIVED ──ACK──▶ ────┘      │
//!                                                               │
//!        close(), no peer FIN            peer FIN observed      │
//!   ESTABLISHED ──────────▶ CLOSING    ESTABLISHED ─────▶ CLOSE_WAIT
//!                              │                                │
//!                 peer FIN     │                     close()    │
//!                              ▼                                ▼
//!                         TERMINATED ◀──────────────────────────┘
//! ```
//!
//! A connection is never reused once it reaches `Terminated`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Bound to a local port only; initial state and the listener's state.
    #[default]
    Closed,
    /// SYN sent; waiting for its acknowledgement.
    SynSent,
    /// SYN received and acknowledged; waiting for the confirming ACK.
    SynReceived,
    /// Handshake complete; data transfer in progress.
    Established,
    /// Local FIN acknowledged; waiting for the peer's FIN.
    Closing,
    /// Peer's FIN received and acknowledged; local close pending.
    CloseWait,
    /// Teardown finished.
    Terminated,
}

impl ConnectionState {
    /// `true` once a remote endpoint is bound and the session is usable or
    /// being torn down.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Established | Self::Closing | Self::CloseWait
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::Closing => "CLOSING",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}
