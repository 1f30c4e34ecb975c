//! Task-per-connection driver.
//!
//! [`Connection`] methods are sequential `async fn`s on `&mut self`.  When the
//! application would rather not own the connection directly, [`Session::spawn`]
//! moves it onto its own tokio task and returns a cheap handle:
//!
//! ```text
//!  Application                 Session task
//!      │  send / receive / close   ┌──────────────────────────┐
//!      │ ───── commands (mpsc) ──▶ │  Connection (owned)      │
//!      │ ◀──── replies (oneshot) ─ │  one operation at a time │
//!      │ ◀──── events  (mpsc) ──── │                          │
//!                                  └──────────────────────────┘
//! ```
//!
//! Lifecycle changes are reported as [`SessionEvent`]s.  Dropping every
//! handle closes the connection.

use std::net::SocketAddrV4;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::{ConnError, Connection};
use crate::transport::{Transport, TransportError};

/// Lifecycle notifications from a session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established {
        local_port: u16,
        remote: SocketAddrV4,
    },
    MessageReceived {
        len: usize,
    },
    PeerClosing,
    Terminated {
        /// `false` when teardown ended in an error.
        clean: bool,
    },
}

enum Command {
    Send(String, oneshot::Sender<Result<(), ConnError>>),
    Receive(oneshot::Sender<Result<String, ConnError>>),
    Close(oneshot::Sender<Result<(), ConnError>>),
}

/// Handle to a connection running on its own task.
pub struct Session {
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    handle: JoinHandle<()>,
}

impl Session {
    /// Move an established connection onto a new task.
    pub fn spawn<T: Transport>(conn: Connection<T>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drive(conn, cmd_rx, event_tx));
        Self {
            commands: cmd_tx,
            events: event_rx,
            handle,
        }
    }

    pub async fn send(&self, msg: impl Into<String>) -> Result<(), ConnError> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Send(msg.into(), tx), rx).await
    }

    pub async fn receive(&self) -> Result<String, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Receive(tx), rx).await
    }

    /// Close the connection and wait for the task to finish.
    pub async fn close(self) -> Result<(), ConnError> {
        let (tx, rx) = oneshot::channel();
        let result = self.request(Command::Close(tx), rx).await;
        drop(self.commands);
        let _ = self.handle.await;
        result
    }

    /// Next lifecycle event, `None` once the task is gone and all events
    /// were read.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    async fn request<R>(
        &self,
        cmd: Command,
        reply: oneshot::Receiver<Result<R, ConnError>>,
    ) -> Result<R, ConnError> {
        // The task is gone: it finished closing, or it panicked.
        if self.commands.send(cmd).await.is_err() {
            return Err(TransportError::Closed.into());
        }
        reply
            .await
            .unwrap_or(Err(ConnError::Transport(TransportError::Closed)))
    }
}

async fn drive<T: Transport>(
    mut conn: Connection<T>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    if let Some(remote) = conn.remote() {
        let _ = events.send(SessionEvent::Established {
            local_port: conn.local_port(),
            remote,
        });
    }

    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Send(msg, reply) => {
                let result = conn.send(&msg).await;
                if matches!(result, Err(ConnError::PeerClosed)) {
                    let _ = events.send(SessionEvent::PeerClosing);
                }
                let _ = reply.send(result);
            }
            Command::Receive(reply) => {
                let result = conn.receive().await;
                match &result {
                    Ok(msg) => {
                        let _ = events.send(SessionEvent::MessageReceived { len: msg.len() });
                    }
                    Err(ConnError::PeerClosed) => {
                        let _ = events.send(SessionEvent::PeerClosing);
                    }
                    Err(_) => {}
                }
                let _ = reply.send(result);
            }
            Command::Close(reply) => {
                let result = conn.close().await;
                let _ = events.send(SessionEvent::Terminated {
                    clean: result.is_ok(),
                });
                let _ = reply.send(result);
                return;
            }
        }
    }

    // Every handle dropped without an explicit close.
    let clean = match conn.close().await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("[session:{}] close on drop failed: {e}", conn.local_port());
            false
        }
    };
    let _ = events.send(SessionEvent::Terminated { clean });
}
