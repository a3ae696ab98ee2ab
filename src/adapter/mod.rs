//! Transport adapters: turn sockets into [`Connection`]s and bus events.
//!
//! Each accepted or dialed socket gets one reader task (owning its
//! [`EventCodec`]) and one writer task fed by an unbounded queue, so
//! `Connection::send` never waits on the socket.

pub mod tcp_client;
pub mod tcp_server;

pub use tcp_client::{TcpClientAdapter, TcpClientConfig};
pub use tcp_server::{TcpServerAdapter, TcpServerConfig};

use crate::connectable::{BusEvent, EventBus};
use crate::connection::{Connection, Connections, Transport};
use crate::error::{Result, WyomingError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wyoming_protocol::{Event, EventCodec};

const READ_CHUNK_SIZE: usize = 8192;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TcpTransport {
    peer: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    token: CancellationToken,
}

impl Transport for TcpTransport {
    fn send(&self, event: &Event) -> Result<()> {
        let bytes = EventCodec::encode(event)?;
        self.outbound
            .send(bytes)
            .map_err(|_| WyomingError::Transport(format!("connection to {} is closed", self.peer)))
    }

    fn close(&self) {
        self.token.cancel();
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Wrap a connected socket, register it and emit `connect`.
///
/// `connect` is emitted before the reader starts, so listeners can set up
/// per-connection state before the first `event` arrives. Cancelling
/// `parent` closes the connection.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    bus: EventBus,
    connections: Connections,
    parent: &CancellationToken,
) -> Connection {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Could not disable Nagle for {}: {}", peer, e);
    }

    let (reader, writer) = stream.into_split();
    let (outbound, queued) = mpsc::unbounded_channel();
    let token = parent.child_token();

    let connection = Connection::new(Arc::new(TcpTransport {
        peer: peer.clone(),
        outbound,
        token: token.clone(),
    }));
    connections.insert(connection.clone());

    log::info!(
        "🔌 New connection from {} [{}] ({} active)",
        peer,
        connection.id(),
        connections.len()
    );
    bus.emit(&BusEvent::Connect(connection.clone()));

    tokio::spawn(write_loop(writer, queued, token.clone(), peer));
    tokio::spawn(read_loop(reader, connection.clone(), bus, connections, token));

    connection
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
    peer: String,
) {
    loop {
        tokio::select! {
            biased;

            bytes = queued.recv() => match bytes {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        log::error!("❌ Write to {} failed: {}", peer, e);
                        token.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = token.cancelled() => {
                // Flush what was sent before the close request
                queued.close();
                while let Ok(bytes) = queued.try_recv() {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        log::debug!("Shutdown of {} failed: {}", peer, e);
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    connection: Connection,
    bus: EventBus,
    connections: Connections,
    token: CancellationToken,
) {
    let mut codec = EventCodec::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    log::info!("🔌 [{}] Peer closed the connection", connection.id());
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    log::error!("❌ [{}] Read failed: {}", connection.id(), e);
                    bus.emit(&BusEvent::Error(e.into()));
                    break;
                }
            }
        };

        let mut corrupted = false;
        for decoded in codec.decode(&buf[..n]) {
            match decoded {
                Ok(event) => {
                    log::debug!("📥 [{}] '{}'", connection.id(), event.event_type());
                    bus.emit(&BusEvent::Event(event, connection.clone()));
                }
                Err(e) => {
                    log::warn!(
                        "⚠️ [{}] Dropping connection after decode error: {}",
                        connection.id(),
                        e
                    );
                    bus.emit(&BusEvent::Error(e.into()));
                    corrupted = true;
                }
            }
        }
        if corrupted {
            break;
        }
    }

    token.cancel();
    connections.remove(&connection);
    log::info!(
        "👋 [{}] Disconnected ({} active)",
        connection.id(),
        connections.len()
    );
    bus.emit(&BusEvent::Disconnect(connection));
}
