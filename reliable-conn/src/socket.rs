//! UDP-backed [`Transport`].
//!
//! [`UdpTransport`] owns one `tokio::net::UdpSocket` per host, bound to the
//! *substrate port*.  Logical connection ports live in the packet header, so
//! any number of connections share the socket; a background task decodes
//! every datagram and hands it to the [`Demux`].
//!
//! All hosts taking part must use the same substrate port: a packet for
//! `dst_addr:dst_port` is sent as a UDP datagram to `dst_addr:substrate_port`.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::packet::Packet;
use crate::transport::{Demux, Transport, TransportError};

/// Default UDP port carrying the protocol.
pub const DEFAULT_SUBSTRATE_PORT: u16 = 9000;

/// Maximum UDP payload size.
const MAX_DATAGRAM: usize = 65_535;

/// A packet-oriented transport over a single UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    /// Resolved socket address (the OS fills in an ephemeral port if asked).
    local: SocketAddrV4,
    demux: Arc<Demux>,
    reader: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind the substrate socket to `local` and start the receive task.
    ///
    /// Passing port 0 lets the OS pick the substrate port; that is only useful
    /// when every connection lives in this process (loopback tests).
    pub async fn bind(local: SocketAddrV4) -> Result<Arc<Self>, TransportError> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let local = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(std::io::Error::new(
                    ErrorKind::Unsupported,
                    format!("bound to IPv6 address {addr}"),
                )
                .into())
            }
        };
        let demux = Arc::new(Demux::new());
        let reader = tokio::spawn(read_loop(Arc::clone(&socket), Arc::clone(&demux)));
        log::info!("[udp] substrate bound on {local}");
        Ok(Arc::new(Self {
            socket,
            local,
            demux,
            reader,
        }))
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }
}

impl Transport for UdpTransport {
    fn local_ip(&self) -> Ipv4Addr {
        match *self.local.ip() {
            // An unspecified bind still needs a routable source in the header.
            ip if ip.is_unspecified() => Ipv4Addr::LOCALHOST,
            ip => ip,
        }
    }

    fn demux(&self) -> &Demux {
        &self.demux
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let bytes = packet.encode()?;
        let dest = SocketAddrV4::new(*packet.dst.ip(), self.local.port());
        self.socket.send_to(&bytes, dest).await?;
        Ok(())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Receive datagrams forever, feeding decodable ones to `demux`.
async fn read_loop(socket: Arc<UdpSocket>, demux: Arc<Demux>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) if is_transient(&e) => {
                log::debug!("[udp] transient receive error: {e}");
                continue;
            }
            Err(e) => {
                log::warn!("[udp] receive failed, stopping reader: {e}");
                demux.shutdown();
                return;
            }
        };
        match Packet::decode(&buf[..n]) {
            Ok(packet) => {
                log::trace!("[udp] ← {packet} (from {from})");
                demux.deliver(packet);
            }
            Err(e) => log::debug!("[udp] dropping datagram from {from}: {e}"),
        }
    }
}

/// Errors after which the socket is still usable.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
