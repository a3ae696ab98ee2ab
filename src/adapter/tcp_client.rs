use super::{lock, spawn_connection};
use crate::connectable::{Connectable, ConnectableCore};
use crate::connection::{Connection, Connections};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    /// `host:port` of the remote service
    pub address: String,
}

/// Holds a single outbound connection for as long as it is started.
/// There is no reconnection; a peer hang-up leaves the adapter started
/// with no connection.
#[derive(Clone)]
pub struct TcpClientAdapter {
    inner: Arc<ClientAdapterInner>,
}

struct ClientAdapterInner {
    core: ConnectableCore,
    config: TcpClientConfig,
    connections: Connections,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl TcpClientAdapter {
    pub fn new(config: TcpClientConfig) -> Self {
        let name = format!("tcp client {}", config.address);
        Self {
            inner: Arc::new(ClientAdapterInner {
                core: ConnectableCore::new(name),
                config,
                connections: Connections::default(),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// The live connection, if connected
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connections.snapshot().into_iter().next()
    }
}

impl ClientAdapterInner {
    async fn connect(self: Arc<Self>) -> Result<()> {
        log::info!("📡 Connecting to {}", self.config.address);

        let stream = TcpStream::connect(&self.config.address).await?;
        let token = CancellationToken::new();
        spawn_connection(
            stream,
            self.core.bus().clone(),
            self.connections.clone(),
            &token,
        );
        *lock(&self.shutdown) = Some(token);

        log::info!("✅ Connected to {}", self.config.address);
        Ok(())
    }

    async fn disconnect(self: Arc<Self>) -> Result<()> {
        let token = lock(&self.shutdown).take();
        if let Some(token) = token {
            token.cancel();
        }
        log::info!("🛑 Closed connection to {}", self.config.address);
        Ok(())
    }
}

#[async_trait]
impl Connectable for TcpClientAdapter {
    fn core(&self) -> &ConnectableCore {
        &self.inner.core
    }

    async fn start(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.core.start_with(move || inner.connect()).await
    }

    async fn stop(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.core.stop_with(move || inner.disconnect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{TcpServerAdapter, TcpServerConfig};
    use crate::connectable::{BusEvent, ConnectableState, EventKind};
    use crate::error::WyomingError;
    use tokio::sync::mpsc;
    use wyoming_protocol::Event;

    fn tap(bus_owner: &dyn Connectable, kind: EventKind) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus_owner.on(
            kind,
            Arc::new(move |event: &BusEvent| {
                let _ = tx.send(event.clone());
            }),
        );
        rx
    }

    #[tokio::test]
    async fn test_client_talks_to_server_adapter() {
        env_logger::builder().is_test(true).try_init().ok();

        let server = TcpServerAdapter::new(TcpServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
        });
        server.start().await.unwrap();
        let mut server_events = tap(&server, EventKind::Event);

        let client = TcpClientAdapter::new(TcpClientConfig {
            address: server.local_addr().unwrap().to_string(),
        });
        let mut client_connects = tap(&client, EventKind::Connect);
        let mut client_events = tap(&client, EventKind::Event);
        let mut client_disconnects = tap(&client, EventKind::Disconnect);

        client.start().await.unwrap();
        assert!(matches!(client_connects.recv().await, Some(BusEvent::Connect(_))));

        let connection = client.connection().expect("client should be connected");
        connection.send(&Event::new("ping")).unwrap();

        let Some(BusEvent::Event(event, peer)) = server_events.recv().await else {
            panic!("expected event on server");
        };
        assert_eq!(event.event_type(), "ping");
        peer.send(&Event::new("pong")).unwrap();

        let Some(BusEvent::Event(reply, _)) = client_events.recv().await else {
            panic!("expected event on client");
        };
        assert_eq!(reply.event_type(), "pong");

        client.stop().await.unwrap();
        assert_eq!(client.state(), ConnectableState::Stopped);
        assert!(matches!(
            client_disconnects.recv().await,
            Some(BusEvent::Disconnect(_))
        ));
        assert!(client.connection().is_none());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_fails_start() {
        // Bind then release a port so nothing listens on it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = TcpClientAdapter::new(TcpClientConfig { address });
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, WyomingError::Transport(_)));
        assert_eq!(client.state(), ConnectableState::Stopped);
    }
}
