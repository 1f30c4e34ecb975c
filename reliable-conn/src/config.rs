//! Timeout and retry parameters for a connection.
//!
//! Every wait in the protocol is bounded by one of these values, except the
//! optional ones which default to waiting indefinitely.

use std::time::Duration;

/// Transmissions per packet before the link is declared broken.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Per-connection protocol timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How long to wait for an acknowledgement before retransmitting.
    pub ack_timeout: Duration,
    /// Total transmissions of one packet (first send included).
    pub max_attempts: u32,
    /// Bound on how long `accept()` waits for a SYN.  `None` waits forever.
    pub accept_timeout: Option<Duration>,
    /// Bound on how long `receive()` waits for data.  `None` waits forever.
    pub receive_timeout: Option<Duration>,
    /// How long the closing side waits for the peer's FIN before giving up.
    pub fin_wait_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            accept_timeout: None,
            receive_timeout: None,
            fin_wait_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Clamped to at least one transmission.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn with_fin_wait_timeout(mut self, timeout: Duration) -> Self {
        self.fin_wait_timeout = timeout;
        self
    }

    /// Longest a single reliable exchange can take: every attempt timing out.
    pub fn exchange_budget(&self) -> Duration {
        self.ack_timeout * self.max_attempts
    }
}
