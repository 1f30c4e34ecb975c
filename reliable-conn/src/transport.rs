//! The unreliable datagram service the connection layer runs on.
//!
//! A [`Transport`] moves single [`Packet`]s between `address:port` pairs with
//! no delivery guarantee.  Inbound packets are demultiplexed by destination
//! port into per-port [`Mailbox`]es by a [`Demux`]; each
//! [`crate::connection::Connection`] reads only its own mailbox.
//!
//! Two implementations ship with the crate:
//! - [`crate::socket::UdpTransport`]:   real UDP via tokio.
//! - [`crate::simulator::SimHost`]:     in-memory lossy network for tests.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::packet::{Packet, PacketError};

/// Receive side of a bound port.
pub type Mailbox = mpsc::UnboundedReceiver<Packet>;

/// Errors surfaced by a transport.  None of these are timeouts: waiting is
/// the connection's business.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot encode packet: {0}")]
    Packet(#[from] PacketError),
    #[error("port {0} is already bound on this transport")]
    PortBound(u16),
    #[error("transport has shut down")]
    Closed,
}

/// An unreliable, connectionless packet service.
///
/// Implementations must be safe to share between connections running on
/// different tasks.
pub trait Transport: Send + Sync + 'static {
    /// Address stamped as the source of outbound packets.
    fn local_ip(&self) -> Ipv4Addr;

    /// Routing table feeding inbound packets to mailboxes.
    fn demux(&self) -> &Demux;

    /// Hand one packet to the network.  Success means "sent", not "delivered".
    fn send(&self, packet: &Packet) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Start receiving packets addressed to `port`.
    fn bind(&self, port: u16) -> Result<Mailbox, TransportError> {
        self.demux().bind(port)
    }

    /// Divert traffic from `peer` addressed to `listen_port` into `to_port`.
    fn route(&self, listen_port: u16, peer: SocketAddrV4, to_port: u16) {
        self.demux().route(listen_port, peer, to_port);
    }

    /// Stop receiving on `port` and forget routes that lead to it.
    fn unbind(&self, port: u16) {
        self.demux().unbind(port);
    }
}

/// Port → mailbox table plus per-peer session routes.
///
/// Session routes take precedence: once `accept()` hands a peer over to a
/// freshly allocated port, that peer's packets to the listening port land in
/// the new connection's mailbox while other peers still reach the listener.
#[derive(Debug, Default)]
pub struct Demux {
    inner: RwLock<DemuxInner>,
}

#[derive(Debug, Default)]
struct DemuxInner {
    ports: HashMap<u16, mpsc::UnboundedSender<Packet>>,
    sessions: HashMap<(u16, SocketAddrV4), u16>,
    shut_down: bool,
}

impl Demux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `port`.  A port whose previous mailbox was dropped can be
    /// bound again.
    pub fn bind(&self, port: u16) -> Result<Mailbox, TransportError> {
        let mut inner = self.write();
        if inner.shut_down {
            return Err(TransportError::Closed);
        }
        if inner.ports.get(&port).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::PortBound(port));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.ports.insert(port, tx);
        Ok(rx)
    }

    pub fn route(&self, listen_port: u16, peer: SocketAddrV4, to_port: u16) {
        log::debug!("[demux] {peer} -> :{listen_port} now routed to :{to_port}");
        self.write().sessions.insert((listen_port, peer), to_port);
    }

    pub fn unbind(&self, port: u16) {
        let mut inner = self.write();
        inner.ports.remove(&port);
        inner.sessions.retain(|_, target| *target != port);
    }

    /// Push `packet` into the mailbox it is addressed to.
    ///
    /// Returns `false` when nobody is listening; the packet is dropped, as a
    /// real network would.
    pub fn deliver(&self, packet: Packet) -> bool {
        let inner = self.read();
        let dst_port = packet.dst.port();
        let port = inner
            .sessions
            .get(&(dst_port, packet.src))
            .copied()
            .unwrap_or(dst_port);

        match inner.ports.get(&port) {
            Some(tx) => match tx.send(packet) {
                Ok(()) => true,
                Err(mpsc::error::SendError(packet)) => {
                    log::debug!("[demux] :{port} closed, dropping {packet}");
                    false
                }
            },
            None => {
                log::debug!("[demux] nothing bound on :{port}, dropping {packet}");
                false
            }
        }
    }

    /// Drop every mailbox sender.  Waiting connections see their mailbox
    /// close and fail with [`TransportError::Closed`]; later binds fail too.
    pub fn shutdown(&self) {
        let mut inner = self.write();
        inner.shut_down = true;
        inner.ports.clear();
        inner.sessions.clear();
        log::debug!("[demux] shut down");
    }

    /// `true` when `peer`'s traffic for `listen_port` is already diverted.
    pub fn is_routed(&self, listen_port: u16, peer: SocketAddrV4) -> bool {
        self.read().sessions.contains_key(&(listen_port, peer))
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.read().ports.get(&port).is_some_and(|tx| !tx.is_closed())
    }

    fn read(&self) -> RwLockReadGuard<'_, DemuxInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DemuxInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
