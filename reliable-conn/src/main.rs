//! Entry point for `reliable-conn`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, argument parsing, configuration).
//!
//! Every host binds the same substrate UDP port.  To try both ends on one
//! machine, give them different loopback addresses:
//!
//! ```text
//! reliable-conn server --bind 127.0.0.1:9000 --port 5000
//! reliable-conn client --bind 127.0.0.2:9000 --server 127.0.0.1:5000 hello world
//! ```

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use reliable_conn::socket::{UdpTransport, DEFAULT_SUBSTRATE_PORT};
use reliable_conn::{ConnError, Connection, ConnectionConfig, PortRegistry};

/// Reliable, connection-oriented messaging over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    timing: Timing,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct Timing {
    /// Milliseconds to wait for an acknowledgement before retransmitting.
    #[arg(long, global = true, default_value_t = 500)]
    ack_timeout_ms: u64,

    /// Transmissions per packet before the link is considered broken.
    #[arg(long, global = true, default_value_t = 5)]
    attempts: u32,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and echo every message back.
    Server {
        /// Local substrate address (UDP).
        #[arg(short, long, default_value_t = SocketAddrV4::new([127, 0, 0, 1].into(), DEFAULT_SUBSTRATE_PORT))]
        bind: SocketAddrV4,
        /// Logical port to listen on.
        #[arg(short, long, default_value_t = 5000)]
        port: u16,
    },
    /// Connect, send each message, print the echoes, close.
    Client {
        /// Local substrate address (UDP).
        #[arg(short, long, default_value_t = SocketAddrV4::new([127, 0, 0, 2].into(), DEFAULT_SUBSTRATE_PORT))]
        bind: SocketAddrV4,
        /// Logical port for this end.
        #[arg(short, long, default_value_t = 4000)]
        port: u16,
        /// Remote listener (address and logical port).
        #[arg(short, long)]
        server: SocketAddrV4,
        /// Messages to send.
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = ConnectionConfig::default()
        .with_ack_timeout(Duration::from_millis(cli.timing.ack_timeout_ms))
        .with_max_attempts(cli.timing.attempts);

    match cli.mode {
        Mode::Server { bind, port } => serve(bind, port, config).await,
        Mode::Client {
            bind,
            port,
            server,
            messages,
        } => run_client(bind, port, server, &messages, config).await,
    }
}

async fn serve(bind: SocketAddrV4, port: u16, config: ConnectionConfig) -> Result<()> {
    let transport = UdpTransport::bind(bind)
        .await
        .with_context(|| format!("binding substrate socket on {bind}"))?;
    let ports = Arc::new(PortRegistry::new());
    let mut listener = Connection::new(transport, ports, port, config)
        .with_context(|| format!("listening on port {port}"))?;
    log::info!("Listening on {}", listener.local_addr());

    loop {
        let mut conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        tokio::spawn(async move {
            let peer = conn.remote();
            loop {
                match conn.receive().await {
                    Ok(msg) => {
                        log::info!("{peer:?} says {msg:?}");
                        if let Err(e) = conn.send(&msg).await {
                            log::warn!("echo to {peer:?} failed: {e}");
                            break;
                        }
                    }
                    Err(ConnError::PeerClosed) => break,
                    Err(e) => {
                        log::warn!("receive from {peer:?} failed: {e}");
                        break;
                    }
                }
            }
            if let Err(e) = conn.close().await {
                log::warn!("closing session with {peer:?}: {e}");
            }
        });
    }
}

async fn run_client(
    bind: SocketAddrV4,
    port: u16,
    server: SocketAddrV4,
    messages: &[String],
    config: ConnectionConfig,
) -> Result<()> {
    let transport = UdpTransport::bind(bind)
        .await
        .with_context(|| format!("binding substrate socket on {bind}"))?;
    let ports = Arc::new(PortRegistry::new());
    let mut conn = Connection::new(transport, ports, port, config)?;

    conn.connect(server)
        .await
        .with_context(|| format!("connecting to {server}"))?;
    for msg in messages {
        conn.send(msg).await.context("sending message")?;
        let echo = conn.receive().await.context("waiting for echo")?;
        println!("{echo}");
    }
    conn.close().await.context("closing connection")?;
    Ok(())
}
