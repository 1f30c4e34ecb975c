//! `reliable-conn`: a connection-oriented, reliable message transport over an
//! unreliable datagram service.
//!
//! # Architecture
//!
//! ```text
//!  Application ── connect / accept / send / receive / close
//!       │                      (or via a Session task)
//!  ┌────▼──────────────────────────────────────┐
//!  │              Connection                   │
//!  │  state machine · sequence counter         │
//!  │  Retransmitter (one packet in flight)     │
//!  │  Receiver (duplicate filter, app buffer)  │
//!  └────┬──────────────────────────▲───────────┘
//!       │ Packet                   │ per-port Mailbox
//!  ┌────▼──────────────────────────┴───────────┐
//!  │     Transport  (+ Demux by dest port)     │  UdpTransport │ SimHost
//!  └───────────────────────────────────────────┘
//!          PortRegistry shared by all connections
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]:      packet construction and wire format
//! - [`ports`]:       process-wide port registry and allocator
//! - [`retransmit`]:  stop-and-wait retransmission state
//! - [`receiver`]:    inbound duplicate filtering and buffering
//! - [`connection`]:  handshake, data transfer and teardown
//! - [`session`]:     task-per-connection driver with lifecycle events
//! - [`state`]:       finite-state-machine types
//! - [`config`]:      timeouts and retry limits
//! - [`transport`]:   datagram service trait and port demultiplexer
//! - [`socket`]:      UDP transport
//! - [`simulator`]:   in-memory lossy network for testing

pub mod config;
pub mod connection;
pub mod packet;
pub mod ports;
pub mod receiver;
pub mod retransmit;
pub mod session;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::{ConnError, Connection};
pub use packet::{Flag, Packet};
pub use ports::PortRegistry;
pub use session::{Session, SessionEvent};
pub use state::ConnectionState;
pub use transport::Transport;
