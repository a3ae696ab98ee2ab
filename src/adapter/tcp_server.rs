use super::{lock, spawn_connection};
use crate::connectable::{BusEvent, Connectable, ConnectableCore};
use crate::connection::{Connection, Connections};
use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for the listening TCP adapter
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub bind_address: String,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:10300".to_string(),
        }
    }
}

/// Accepts any number of peers on one TCP address
#[derive(Clone)]
pub struct TcpServerAdapter {
    inner: Arc<ServerAdapterInner>,
}

struct ServerAdapterInner {
    core: ConnectableCore,
    config: TcpServerConfig,
    connections: Connections,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<CancellationToken>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServerAdapter {
    pub fn new(config: TcpServerConfig) -> Self {
        let name = format!("tcp server {}", config.bind_address);
        Self {
            inner: Arc::new(ServerAdapterInner {
                core: ConnectableCore::new(name),
                config,
                connections: Connections::default(),
                local_addr: Mutex::new(None),
                shutdown: Mutex::new(None),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Bound address while started; resolves port 0 to the real port
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.snapshot()
    }
}

impl ServerAdapterInner {
    async fn listen(self: Arc<Self>) -> Result<()> {
        log::info!("🎙️ Starting Wyoming TCP server on {}", self.config.bind_address);

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();

        *lock(&self.local_addr) = Some(local_addr);
        *lock(&self.shutdown) = Some(token.clone());
        let task = tokio::spawn(accept_loop(
            listener,
            self.core.clone(),
            self.connections.clone(),
            token,
        ));
        *lock(&self.accept_task) = Some(task);

        log::info!("🎙️ Wyoming TCP server listening on {}", local_addr);
        Ok(())
    }

    async fn shutdown(self: Arc<Self>) -> Result<()> {
        let token = lock(&self.shutdown).take();
        if let Some(token) = token {
            // Child tokens close every live connection too
            token.cancel();
        }

        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("⚠️ Accept loop ended abnormally: {}", e);
            }
        }

        *lock(&self.local_addr) = None;
        log::info!("🛑 Wyoming TCP server on {} stopped", self.config.bind_address);
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    core: ConnectableCore,
    connections: Connections,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    spawn_connection(stream, core.bus().clone(), connections.clone(), &token);
                }
                Err(e) => {
                    log::error!("❌ Failed to accept connection: {}", e);
                    core.bus().emit(&BusEvent::Error(e.into()));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[async_trait]
impl Connectable for TcpServerAdapter {
    fn core(&self) -> &ConnectableCore {
        &self.inner.core
    }

    async fn start(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.core.start_with(move || inner.listen()).await
    }

    async fn stop(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.core.stop_with(move || inner.shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectable::{ConnectableState, EventKind};
    use crate::error::WyomingError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use wyoming_protocol::{Event, EventCodec};

    fn local_server() -> TcpServerAdapter {
        TcpServerAdapter::new(TcpServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
        })
    }

    /// Forward every bus event of `kind` into a channel
    fn tap(adapter: &TcpServerAdapter, kind: EventKind) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        adapter.on(
            kind,
            Arc::new(move |event: &BusEvent| {
                let _ = tx.send(event.clone());
            }),
        );
        rx
    }

    async fn connect(adapter: &TcpServerAdapter) -> TcpStream {
        let addr = adapter.local_addr().expect("server should be bound");
        TcpStream::connect(addr).await.unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_events_for_one_peer() {
        env_logger::builder().is_test(true).try_init().ok();

        let adapter = local_server();
        let mut connects = tap(&adapter, EventKind::Connect);
        let mut events = tap(&adapter, EventKind::Event);
        let mut disconnects = tap(&adapter, EventKind::Disconnect);

        adapter.start().await.unwrap();
        assert_eq!(adapter.state(), ConnectableState::Started);

        let mut peer = connect(&adapter).await;
        let Some(BusEvent::Connect(connected)) = connects.recv().await else {
            panic!("expected connect");
        };

        // One write carrying two events, the second split across writes
        let mut bytes = EventCodec::encode(&Event::new("ping")).unwrap();
        let second = EventCodec::encode(&Event::new("describe")).unwrap();
        bytes.extend_from_slice(&second[..3]);
        peer.write_all(&bytes).await.unwrap();
        peer.write_all(&second[3..]).await.unwrap();

        for expected in ["ping", "describe"] {
            let Some(BusEvent::Event(event, from)) = events.recv().await else {
                panic!("expected event");
            };
            assert_eq!(event.event_type(), expected);
            assert_eq!(from, connected);
        }

        drop(peer);
        let Some(BusEvent::Disconnect(gone)) = disconnects.recv().await else {
            panic!("expected disconnect");
        };
        assert_eq!(gone, connected);
        assert!(adapter.connections().is_empty());

        adapter.stop().await.unwrap();
        assert!(adapter.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_decode_error_closes_only_that_peer() {
        let adapter = local_server();
        let mut connects = tap(&adapter, EventKind::Connect);
        let mut errors = tap(&adapter, EventKind::Error);
        let mut disconnects = tap(&adapter, EventKind::Disconnect);
        adapter.start().await.unwrap();

        let mut bad = connect(&adapter).await;
        connects.recv().await.unwrap();
        let mut good = connect(&adapter).await;
        let Some(BusEvent::Connect(good_connection)) = connects.recv().await else {
            panic!("expected connect");
        };

        bad.write_all(b"this is not json\n").await.unwrap();

        let Some(BusEvent::Error(err)) = errors.recv().await else {
            panic!("expected error");
        };
        assert!(matches!(err, WyomingError::Decode(_)));
        disconnects.recv().await.unwrap();

        // The corrupted socket is closed by the server
        let mut buf = [0u8; 16];
        assert_eq!(bad.read(&mut buf).await.unwrap(), 0);

        // The other peer still works in both directions
        good_connection.send(&Event::new("pong")).unwrap();
        let mut codec = EventCodec::new();
        let n = good.read(&mut buf).await.unwrap();
        let mut decoded: Vec<Event> = codec.decode(&buf[..n]).map(|r| r.unwrap()).collect();
        while decoded.is_empty() {
            let n = good.read(&mut buf).await.unwrap();
            decoded = codec.decode(&buf[..n]).map(|r| r.unwrap()).collect();
        }
        assert_eq!(decoded[0].event_type(), "pong");
        assert_eq!(adapter.connections(), vec![good_connection]);

        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_queued_events() {
        let adapter = local_server();
        let mut connects = tap(&adapter, EventKind::Connect);
        adapter.start().await.unwrap();

        let mut peer = connect(&adapter).await;
        let Some(BusEvent::Connect(connection)) = connects.recv().await else {
            panic!("expected connect");
        };

        connection.send(&Event::new("transcript-start")).unwrap();
        connection.send(&Event::new("transcript-stop")).unwrap();
        connection.close().await;

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        let mut codec = EventCodec::new();
        let types: Vec<String> = codec
            .decode(&received)
            .map(|e| e.unwrap().event_type().to_string())
            .collect();
        assert_eq!(types, vec!["transcript-start", "transcript-stop"]);

        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_live_connections() {
        let adapter = local_server();
        let mut connects = tap(&adapter, EventKind::Connect);
        let mut disconnects = tap(&adapter, EventKind::Disconnect);
        adapter.start().await.unwrap();
        let addr = adapter.local_addr().unwrap();

        let mut peer = connect(&adapter).await;
        connects.recv().await.unwrap();
        adapter.stop().await.unwrap();

        disconnects.recv().await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_fails_start() {
        let first = local_server();
        first.start().await.unwrap();
        let taken = first.local_addr().unwrap();

        let second = TcpServerAdapter::new(TcpServerConfig {
            bind_address: taken.to_string(),
        });
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, WyomingError::Transport(_)));
        assert_eq!(second.state(), ConnectableState::Stopped);

        first.stop().await.unwrap();
    }
}
