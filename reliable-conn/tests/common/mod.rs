//! Shared setup for the simulator-backed integration tests.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use reliable_conn::simulator::{Network, SimHost, SimulatorConfig};
use reliable_conn::{Connection, ConnectionConfig, Flag, Packet, PortRegistry};

pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const LISTEN_PORT: u16 = 5000;
pub const CLIENT_PORT: u16 = 4000;

pub const ACK_TIMEOUT: Duration = Duration::from_millis(100);

pub fn config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_ack_timeout(ACK_TIMEOUT)
        .with_fin_wait_timeout(Duration::from_secs(2))
}

pub fn listen_addr() -> SocketAddrV4 {
    SocketAddrV4::new(SERVER_IP, LISTEN_PORT)
}

pub fn client_addr() -> SocketAddrV4 {
    SocketAddrV4::new(CLIENT_IP, CLIENT_PORT)
}

/// Two hosts on one simulated network, each with its own port registry.
pub struct Testbed {
    pub net: Arc<Network>,
    pub server: Arc<SimHost>,
    pub client: Arc<SimHost>,
    pub server_ports: Arc<PortRegistry>,
    pub client_ports: Arc<PortRegistry>,
}

impl Testbed {
    pub fn new() -> Self {
        Self::with_faults(SimulatorConfig::default())
    }

    pub fn with_faults(faults: SimulatorConfig) -> Self {
        let net = Network::new(faults);
        Self {
            server: net.attach(SERVER_IP),
            client: net.attach(CLIENT_IP),
            server_ports: Arc::new(PortRegistry::new()),
            client_ports: Arc::new(PortRegistry::new()),
            net,
        }
    }

    pub fn listener(&self, config: ConnectionConfig) -> Connection<SimHost> {
        Connection::new(
            Arc::clone(&self.server),
            Arc::clone(&self.server_ports),
            LISTEN_PORT,
            config,
        )
        .expect("listener port")
    }

    pub fn client(&self, port: u16, config: ConnectionConfig) -> Connection<SimHost> {
        Connection::new(
            Arc::clone(&self.client),
            Arc::clone(&self.client_ports),
            port,
            config,
        )
        .expect("client port")
    }

    /// Run a full handshake and return `(listener, accepted, client)`.
    pub async fn establish(
        &self,
    ) -> (Connection<SimHost>, Connection<SimHost>, Connection<SimHost>) {
        let mut listener = self.listener(config());
        let mut client = self.client(CLIENT_PORT, config());

        let server = tokio::spawn(async move {
            let accepted = listener.accept().await.expect("accept");
            (listener, accepted)
        });
        client.connect(listen_addr()).await.expect("connect");
        let (listener, accepted) = server.await.expect("server task");
        (listener, accepted, client)
    }
}

pub fn is_data(p: &Packet) -> bool {
    p.flag == Flag::None
}

/// ACKs sent by the server host, which before the handshake completes are
/// exactly the SYN-ACK replies.
pub fn is_server_ack(p: &Packet) -> bool {
    p.flag == Flag::Ack && *p.src.ip() == SERVER_IP
}

pub fn is_client_ack(p: &Packet) -> bool {
    p.flag == Flag::Ack && *p.src.ip() == CLIENT_IP
}
