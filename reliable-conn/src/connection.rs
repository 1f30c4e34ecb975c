//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one endpoint of a logical
//! session.  Its responsibilities are:
//! - Driving the finite-state machine (see [`crate::state`]).
//! - Owning the sequence counter and building every outbound packet.
//! - Delivering packets reliably through [`crate::retransmit`].
//! - Filtering and dispatching inbound packets from its mailbox.
//!
//! # Handshake
//!
//! ```text
//!   connect() side                       accept() side (listening on L)
//!   ──────────────                       ──────────────────────────────
//!   SYN seq=x          ───────────────▶  allocate fresh port P,
//!   (sent once)                          route peer's traffic for L to P
//!                      ◀───────────────  ACK ack=x seq=y  (retransmitted)
//!   ACK ack=y          ───────────────▶  ESTABLISHED, accept() returns
//!   ESTABLISHED                          the new connection on P
//! ```
//!
//! The SYN goes through the plain transport, not the
//! retransmission engine: a lost SYN makes `connect()` time out.  The
//! accepting side retransmits its reply, and the connecting side answers
//! every copy, so loss after the SYN is recovered.
//!
//! The connection returned by `accept()` is registered under `P` but keeps
//! speaking as `L` on the wire: the connecting side bound `L` as its remote
//! port before the handshake finished.
//!
//! # Teardown
//!
//! `close()` without a recorded peer FIN sends FIN reliably, then waits for
//! the peer's FIN and acknowledges it.  With a recorded peer FIN it
//! acknowledges that FIN, sends its own reliably and is done.

use std::net::SocketAddrV4;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::{timeout_at, Instant};

use crate::config::ConnectionConfig;
use crate::packet::{Flag, Packet};
use crate::ports::{PortError, PortRegistry};
use crate::receiver::Receiver;
use crate::retransmit::{LinkBroken, Retransmitter};
use crate::state::ConnectionState;
use crate::transport::{Mailbox, Transport, TransportError};

/// Errors returned by connection operations.
#[derive(Debug, Error)]
pub enum ConnError {
    /// A bounded wait expired where no retry applies.
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error(transparent)]
    LinkBroken(#[from] LinkBroken),
    /// The operation needs an established connection.
    #[error("not connected (state {0})")]
    NotConnected(ConnectionState),
    /// `connect()` / `accept()` on a connection that is not `Closed`.
    #[error("operation not allowed in state {0}")]
    BadState(ConnectionState),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What an inbound packet turned out to be, after it was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    /// New data queued for the application.
    Data,
    /// Peer's FIN, acknowledged and recorded.
    Fin,
    /// Duplicates, stray ACKs, repeated handshake replies.
    Other,
}

/// One endpoint of a reliable session over a [`Transport`].
pub struct Connection<T: Transport> {
    transport: Arc<T>,
    ports: Arc<PortRegistry>,
    config: ConnectionConfig,
    mailbox: Mailbox,

    /// Port this connection is registered and bound under.
    local_port: u16,
    /// Source port on outbound packets; the listening port for accepted
    /// connections, `local_port` otherwise.
    wire_port: u16,
    remote: Option<SocketAddrV4>,
    state: ConnectionState,

    /// Sequence number for the next packet this side builds.
    next_seq: u32,
    /// Our SYN's sequence number, to recognise repeated handshake replies.
    syn_seq: Option<u32>,
    retransmit: Retransmitter,
    receiver: Receiver,
    /// Peer FIN received while this side was still active.
    pending_disconnect: Option<Packet>,
}

impl<T: Transport> Connection<T> {
    /// Create a connection in the `Closed` state bound to `port`.
    ///
    /// The port is claimed in `ports`; fails if another connection holds it.
    pub fn new(
        transport: Arc<T>,
        ports: Arc<PortRegistry>,
        port: u16,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        ports.claim(port)?;
        Self::bind_claimed(transport, ports, port, config)
    }

    /// Bind a port that is already reserved in `ports`.
    fn bind_claimed(
        transport: Arc<T>,
        ports: Arc<PortRegistry>,
        port: u16,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        let mailbox = transport.bind(port)?;
        let isn: u32 = rand::random();
        Ok(Self {
            retransmit: Retransmitter::from_config(&config),
            receiver: Receiver::new(0),
            transport,
            ports,
            config,
            mailbox,
            local_port: port,
            wire_port: port,
            remote: None,
            state: ConnectionState::Closed,
            next_seq: isn,
            syn_seq: None,
            pending_disconnect: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Address and port this connection puts in the source field.
    pub fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.transport.local_ip(), self.wire_port)
    }

    pub fn remote(&self) -> Option<SocketAddrV4> {
        self.remote
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// `true` when the peer has started teardown and is waiting for our FIN.
    pub fn peer_closed(&self) -> bool {
        self.pending_disconnect.is_some()
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Establish a session with the listener at `remote`.
    pub async fn connect(&mut self, remote: SocketAddrV4) -> Result<(), ConnError> {
        if self.state != ConnectionState::Closed {
            return Err(ConnError::BadState(self.state));
        }

        let syn = self.make_control_packet(Flag::Syn, remote);
        // Bound before the reply arrives: the reply is validated against it.
        self.remote = Some(remote);
        self.syn_seq = Some(syn.seq);
        self.state = ConnectionState::SynSent;
        log::info!("[conn:{}] connecting to {remote}", self.local_port);
        self.transport.send(&syn).await?;
        log::debug!("[conn:{}] → {syn}", self.local_port);

        let deadline = Instant::now() + self.config.exchange_budget();
        loop {
            let Some(pkt) = self.next_packet(Some(deadline)).await? else {
                log::warn!("[conn:{}] no reply to SYN from {remote}", self.local_port);
                self.state = ConnectionState::Closed;
                self.remote = None;
                self.syn_seq = None;
                return Err(ConnError::Timeout);
            };
            if !self.is_valid(&pkt) || !pkt.acknowledges(syn.seq) {
                log::debug!("[conn:{}] ignoring {pkt} during handshake", self.local_port);
                continue;
            }

            self.send_ack(&pkt).await?;
            self.receiver = Receiver::new(pkt.seq);
            self.state = ConnectionState::Established;
            log::info!("[conn:{}] established with {remote}", self.local_port);
            return Ok(());
        }
    }

    /// Wait for a peer's SYN and hand the peer to a new connection on a
    /// freshly allocated port.
    ///
    /// `self` stays `Closed` and can accept again.
    pub async fn accept(&mut self) -> Result<Connection<T>, ConnError> {
        if self.state != ConnectionState::Closed {
            return Err(ConnError::BadState(self.state));
        }

        let deadline = self.config.accept_timeout.map(|t| Instant::now() + t);
        let syn = loop {
            match self.next_packet(deadline).await? {
                None => return Err(ConnError::Timeout),
                Some(pkt) if pkt.flag == Flag::Syn && pkt.dst.port() == self.wire_port => {
                    // A copy queued before the peer was handed over.
                    if self.transport.demux().is_routed(self.wire_port, pkt.src) {
                        log::debug!("[listen:{}] duplicate SYN from {}", self.local_port, pkt.src);
                        continue;
                    }
                    break pkt;
                }
                Some(pkt) => log::debug!("[listen:{}] ignoring {pkt}", self.local_port),
            }
        };
        log::debug!("[listen:{}] ← {syn}", self.local_port);

        let port = self.ports.allocate()?;
        let mut conn = Connection::bind_claimed(
            Arc::clone(&self.transport),
            Arc::clone(&self.ports),
            port,
            self.config.clone(),
        )?;
        conn.wire_port = self.wire_port;
        conn.remote = Some(syn.src);
        conn.receiver = Receiver::new(syn.seq);
        conn.state = ConnectionState::SynReceived;
        self.transport.route(self.wire_port, syn.src, port);

        let reply = conn.make_ack(&syn);
        // The confirming ACK answers `reply`, so the engine waits for it.
        conn.send_with_retransmit(reply).await?;
        // A FIN that overtook the confirming ACK already moved it to CloseWait.
        if conn.state == ConnectionState::SynReceived {
            conn.state = ConnectionState::Established;
        }
        log::info!(
            "[listen:{}] accepted {} on port {port}",
            self.local_port,
            syn.src
        );
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Deliver one text message; returns once the peer acknowledged it.
    pub async fn send(&mut self, msg: &str) -> Result<(), ConnError> {
        self.send_bytes(msg.as_bytes()).await
    }

    /// Deliver one message; returns once the peer acknowledged it.
    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<(), ConnError> {
        let remote = self.require_established()?;
        let pkt = self.make_data_packet(payload.to_vec(), remote);
        self.send_with_retransmit(pkt).await?;
        Ok(())
    }

    /// Wait for the next message from the peer, as text.
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub async fn receive(&mut self) -> Result<String, ConnError> {
        let bytes = self.receive_bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Wait for the next message from the peer.
    ///
    /// Returns [`ConnError::PeerClosed`] once the peer's FIN has been seen and
    /// everything before it was read.
    pub async fn receive_bytes(&mut self) -> Result<Vec<u8>, ConnError> {
        match self.state {
            ConnectionState::Established | ConnectionState::CloseWait => {}
            other => return Err(ConnError::NotConnected(other)),
        }

        let deadline = self.config.receive_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(payload) = self.receiver.read() {
                return Ok(payload);
            }
            if self.state == ConnectionState::CloseWait {
                return Err(ConnError::PeerClosed);
            }

            let Some(pkt) = self.next_packet(deadline).await? else {
                return Err(ConnError::Timeout);
            };
            if !self.is_valid(&pkt) {
                log::debug!("[conn:{}] discarding invalid {pkt}", self.local_port);
                continue;
            }
            self.on_inbound(pkt).await?;
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tear the session down.  The connection is `Terminated` afterwards,
    /// whether or not the exchange succeeded.
    pub async fn close(&mut self) -> Result<(), ConnError> {
        let result = match self.state {
            ConnectionState::Terminated => return Ok(()),
            // A listener or never-connected endpoint has nobody to tell.
            ConnectionState::Closed => Ok(()),
            state if state.is_connected() => self.disconnect().await,
            other => Err(ConnError::NotConnected(other)),
        };
        self.state = ConnectionState::Terminated;
        self.retransmit.abandon();
        log::info!("[conn:{}] terminated", self.local_port);
        result
    }

    async fn disconnect(&mut self) -> Result<(), ConnError> {
        let remote = self
            .remote
            .ok_or(ConnError::NotConnected(self.state))?;

        if let Some(peer_fin) = self.pending_disconnect.clone() {
            // Peer went first: confirm its FIN again, then send ours.
            self.send_ack(&peer_fin).await?;
            let fin = self.make_control_packet(Flag::Fin, remote);
            self.send_with_retransmit(fin).await?;
            return Ok(());
        }

        self.state = ConnectionState::Closing;
        let fin = self.make_control_packet(Flag::Fin, remote);
        self.send_with_retransmit(fin).await?;

        // The peer's FIN may have crossed ours and already been acknowledged.
        if self.pending_disconnect.is_some() {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.fin_wait_timeout;
        loop {
            let Some(pkt) = self.next_packet(Some(deadline)).await? else {
                log::warn!(
                    "[conn:{}] peer {remote} never sent FIN; force-closing",
                    self.local_port
                );
                return Ok(());
            };
            if !self.is_valid(&pkt) {
                continue;
            }
            if self.on_inbound(pkt).await? == Inbound::Fin {
                return Ok(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Packet construction
    // -----------------------------------------------------------------------

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        seq
    }

    /// A payload-less packet with a fresh sequence number.
    pub fn make_control_packet(&mut self, flag: Flag, dest: SocketAddrV4) -> Packet {
        let seq = self.take_seq();
        Packet::control(flag, seq, self.local_addr(), dest)
    }

    /// A data packet with a fresh sequence number.
    pub fn make_data_packet(&mut self, payload: Vec<u8>, dest: SocketAddrV4) -> Packet {
        let seq = self.take_seq();
        Packet::data(seq, self.local_addr(), dest, payload)
    }

    fn make_ack(&mut self, acked: &Packet) -> Packet {
        let seq = self.take_seq();
        Packet::ack_of(acked, seq, self.local_addr())
    }

    async fn send_ack(&mut self, acked: &Packet) -> Result<(), ConnError> {
        let ack = self.make_ack(acked);
        self.transport.send(&ack).await?;
        log::debug!("[conn:{}] → {ack}", self.local_port);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reliable delivery
    // -----------------------------------------------------------------------

    /// Send `packet` and wait for its ACK, retransmitting on timeout.
    ///
    /// Other packets arriving meanwhile are handled as usual.  A peer FIN
    /// while data is outstanding aborts with [`ConnError::PeerClosed`], since
    /// a closing peer no longer acknowledges data.
    async fn send_with_retransmit(&mut self, packet: Packet) -> Result<Packet, ConnError> {
        let carries_data = packet.flag == Flag::None;
        self.transport.send(&packet).await?;
        log::debug!("[conn:{}] → {packet}", self.local_port);
        self.retransmit.record_sent(packet);

        loop {
            let deadline = self.retransmit.deadline();
            let Some(pkt) = self.next_packet(deadline).await? else {
                let again = match self.retransmit.on_timeout() {
                    Ok(again) => again.clone(),
                    Err(broken) => {
                        log::warn!("[conn:{}] {broken}", self.local_port);
                        self.state = ConnectionState::Terminated;
                        return Err(broken.into());
                    }
                };
                log::debug!(
                    "[conn:{}] timeout, retransmitting {again} (attempt {})",
                    self.local_port,
                    self.retransmit.transmissions()
                );
                self.transport.send(&again).await?;
                continue;
            };

            if !self.is_valid(&pkt) {
                log::debug!("[conn:{}] discarding invalid {pkt}", self.local_port);
                continue;
            }
            if self.retransmit.on_ack(&pkt) {
                log::debug!("[conn:{}] ← {pkt}", self.local_port);
                return Ok(pkt);
            }
            if self.on_inbound(pkt).await? == Inbound::Fin && carries_data {
                self.retransmit.abandon();
                return Err(ConnError::PeerClosed);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Next packet from the mailbox; `Ok(None)` once `deadline` passes.
    async fn next_packet(&mut self, deadline: Option<Instant>) -> Result<Option<Packet>, ConnError> {
        let received = match deadline {
            Some(at) => match timeout_at(at, self.mailbox.recv()).await {
                Ok(received) => received,
                Err(_elapsed) => return Ok(None),
            },
            None => self.mailbox.recv().await,
        };
        received
            .map(Some)
            .ok_or(ConnError::Transport(TransportError::Closed))
    }

    /// Whether `packet` belongs to this session.
    ///
    /// It must come from the bound remote endpoint and be addressed to our
    /// wire port.  Corrupted datagrams never get this far: the codec rejects
    /// them on checksum.  Duplicate data is filtered later by the
    /// [`Receiver`], because it still has to be acknowledged.
    pub fn is_valid(&self, packet: &Packet) -> bool {
        match self.remote {
            Some(remote) => packet.src == remote && packet.dst.port() == self.wire_port,
            None => false,
        }
    }

    /// Handle a valid packet that is not the ACK currently awaited.
    async fn on_inbound(&mut self, pkt: Packet) -> Result<Inbound, ConnError> {
        log::debug!("[conn:{}] ← {pkt}", self.local_port);
        match pkt.flag {
            Flag::None => {
                let fresh = self.receiver.on_data(pkt.seq, &pkt.payload);
                if !fresh {
                    log::debug!("[conn:{}] duplicate seq={}, re-acking", self.local_port, pkt.seq);
                }
                self.send_ack(&pkt).await?;
                Ok(if fresh { Inbound::Data } else { Inbound::Other })
            }
            Flag::Fin => {
                self.send_ack(&pkt).await?;
                if matches!(
                    self.state,
                    ConnectionState::Established | ConnectionState::SynReceived
                ) {
                    self.state = ConnectionState::CloseWait;
                }
                if self.pending_disconnect.is_none() {
                    log::info!("[conn:{}] peer requested disconnect", self.local_port);
                }
                self.pending_disconnect = Some(pkt);
                Ok(Inbound::Fin)
            }
            Flag::Ack if self.syn_seq.is_some_and(|s| pkt.acknowledges(s)) => {
                // Our handshake confirmation was lost; the acceptor repeated
                // its reply.
                self.send_ack(&pkt).await?;
                Ok(Inbound::Other)
            }
            Flag::Ack | Flag::Syn => Ok(Inbound::Other),
        }
    }

    fn require_established(&self) -> Result<SocketAddrV4, ConnError> {
        match (self.state, self.remote) {
            (ConnectionState::Established, Some(remote)) => Ok(remote),
            (ConnectionState::CloseWait, _) => Err(ConnError::PeerClosed),
            (state, _) => Err(ConnError::NotConnected(state)),
        }
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.transport.unbind(self.local_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{Network, SimHost};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn endpoint(port: u16) -> (Arc<SimHost>, Connection<SimHost>) {
        let host = Network::reliable().attach(HOST);
        let conn = Connection::new(
            Arc::clone(&host),
            Arc::new(PortRegistry::new()),
            port,
            ConnectionConfig::default().with_ack_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        (host, conn)
    }

    #[tokio::test]
    async fn new_connection_is_closed_and_bound() {
        let (host, conn) = endpoint(5000);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.local_port(), 5000);
        assert_eq!(conn.remote(), None);
        assert!(host.demux().is_bound(5000));
    }

    #[tokio::test]
    async fn same_port_cannot_be_claimed_twice() {
        let host = Network::reliable().attach(HOST);
        let ports = Arc::new(PortRegistry::new());
        let _first = Connection::new(
            Arc::clone(&host),
            Arc::clone(&ports),
            5000,
            ConnectionConfig::default(),
        )
        .unwrap();
        let second = Connection::new(host, ports, 5000, ConnectionConfig::default());
        assert!(matches!(second, Err(ConnError::Port(PortError::InUse(5000)))));
    }

    #[tokio::test]
    async fn sequence_numbers_are_fresh_per_packet() {
        let (_host, mut conn) = endpoint(5000);
        let dest = SocketAddrV4::new(HOST, 6000);
        let syn = conn.make_control_packet(Flag::Syn, dest);
        let data = conn.make_data_packet(b"x".to_vec(), dest);
        assert_eq!(data.seq, syn.seq.wrapping_add(1));
        assert_eq!(syn.src, SocketAddrV4::new(HOST, 5000));
        assert!(syn.payload.is_empty());
        assert_eq!(data.flag, Flag::None);
    }

    #[tokio::test]
    async fn send_and_receive_require_a_session() {
        let (_host, mut conn) = endpoint(5000);
        assert!(matches!(
            conn.send("too early").await,
            Err(ConnError::NotConnected(ConnectionState::Closed))
        ));
        assert!(matches!(
            conn.receive().await,
            Err(ConnError::NotConnected(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    async fn validity_checks_endpoints() {
        let (_host, mut conn) = endpoint(5000);
        let peer = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 7000);
        let stranger = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), 7000);
        let me = conn.local_addr();

        let from_peer = Packet::data(1, peer, me, b"hi".to_vec());
        assert!(!conn.is_valid(&from_peer), "nothing is valid before a remote is bound");

        conn.remote = Some(peer);
        assert!(conn.is_valid(&from_peer));
        assert!(!conn.is_valid(&Packet::data(1, stranger, me, b"hi".to_vec())));
        let wrong_port = SocketAddrV4::new(*me.ip(), 5001);
        assert!(!conn.is_valid(&Packet::data(1, peer, wrong_port, b"hi".to_vec())));
    }

    #[tokio::test]
    async fn closing_an_unconnected_endpoint_terminates() {
        let (_host, mut conn) = endpoint(5000);
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Terminated);
        assert!(matches!(conn.connect(SocketAddrV4::new(HOST, 1)).await, Err(ConnError::BadState(_))));
    }

    #[tokio::test]
    async fn transport_shutdown_wakes_a_waiting_listener() {
        let (host, mut conn) = endpoint(5000);
        let waiting = tokio::spawn(async move { conn.accept().await.map(|_| ()) });
        tokio::task::yield_now().await;
        host.demux().shutdown();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(ConnError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn drop_unbinds_the_port() {
        let (host, conn) = endpoint(5000);
        drop(conn);
        assert!(!host.demux().is_bound(5000));
    }
}
