//! The Wyoming service endpoint.
//!
//! A [`Server`] pipes one or more transport adapters into its own bus and
//! runs one [`Controller`] per live connection. Controllers are fed through
//! an unbounded inbox so events from one connection are handled strictly in
//! arrival order, while different connections proceed independently.

pub mod controller;
pub mod handler;

pub use controller::Controller;
pub use handler::{
    AudioChunk, AudioStream, DescribeHandler, FnFactory, HandlerFactory, HandlerSet,
    HandlerSource, PingHandler, ResolvedHandlers, StreamingTranscriber, Transcriber,
    TranscriptStream, TranscriptionMode,
};

use crate::connectable::{BusEvent, Connectable, ConnectableCore, EventKind};
use crate::connection::Connection;
use crate::error::{Result, WyomingError};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wyoming_protocol::Event;

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Upper bound for each handler call; `None` waits indefinitely
    pub handler_timeout: Option<Duration>,
}

struct ControllerHandle {
    inbox: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    core: ConnectableCore,
    adapters: Vec<Arc<dyn Connectable>>,
    handlers: HandlerSource,
    options: ServerOptions,
    controllers: Mutex<HashMap<Connection, ControllerHandle>>,
}

impl Server {
    pub fn new(
        adapters: Vec<Arc<dyn Connectable>>,
        handlers: impl Into<HandlerSource>,
    ) -> Result<Self> {
        Self::with_options(adapters, handlers, ServerOptions::default())
    }

    pub fn with_options(
        adapters: Vec<Arc<dyn Connectable>>,
        handlers: impl Into<HandlerSource>,
        options: ServerOptions,
    ) -> Result<Self> {
        if adapters.is_empty() {
            return Err(WyomingError::Configuration(
                "a server needs at least one adapter".to_string(),
            ));
        }

        let inner = Arc::new(ServerInner {
            core: ConnectableCore::new("server"),
            adapters,
            handlers: handlers.into(),
            options,
            controllers: Mutex::new(HashMap::new()),
        });
        ServerInner::listen_for_connections(&inner);

        Ok(Self { inner })
    }

    pub fn adapters(&self) -> &[Arc<dyn Connectable>] {
        &self.inner.adapters
    }

    /// Number of connections that currently have a controller
    pub fn controller_count(&self) -> usize {
        lock(&self.inner.controllers).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerInner {
    fn listen_for_connections(inner: &Arc<Self>) {
        let bus = inner.core.bus();

        let weak: Weak<Self> = Arc::downgrade(inner);
        bus.on(
            EventKind::Connect,
            Arc::new(move |event: &BusEvent| {
                if let (Some(server), BusEvent::Connect(connection)) = (weak.upgrade(), event) {
                    server.open_controller(connection.clone());
                }
            }),
        );

        let weak: Weak<Self> = Arc::downgrade(inner);
        bus.on(
            EventKind::Event,
            Arc::new(move |bus_event: &BusEvent| {
                if let (Some(server), BusEvent::Event(event, connection)) =
                    (weak.upgrade(), bus_event)
                {
                    server.dispatch(event.clone(), connection);
                }
            }),
        );

        let weak: Weak<Self> = Arc::downgrade(inner);
        bus.on(
            EventKind::Disconnect,
            Arc::new(move |event: &BusEvent| {
                if let (Some(server), BusEvent::Disconnect(connection)) = (weak.upgrade(), event) {
                    server.close_controller(connection);
                }
            }),
        );
    }

    fn open_controller(&self, connection: Connection) {
        let (inbox, mut events) = mpsc::unbounded_channel::<Event>();
        let source = self.handlers.clone();
        let bus = self.core.bus().clone();
        let timeout = self.options.handler_timeout;
        let peer = connection.clone();

        let task = tokio::spawn(async move {
            let handlers = match source.resolve(&peer).await {
                Ok(handlers) => handlers,
                Err(e) => {
                    log::error!("❌ [{}] Could not set up handlers: {}", peer.id(), e);
                    bus.emit(&BusEvent::Error(WyomingError::from(e)));
                    peer.close().await;
                    return;
                }
            };

            let mut controller = Controller::new(peer, handlers, bus.clone(), timeout);
            while let Some(event) = events.recv().await {
                if let Err(e) = controller.handle(event).await {
                    log::warn!(
                        "⚠️ [{}] Event handling failed: {}",
                        controller.connection().id(),
                        e
                    );
                    bus.emit(&BusEvent::Error(e));
                }
            }
            controller.stop();
        });

        log::debug!("[{}] Controller created", connection.id());
        lock(&self.controllers).insert(connection, ControllerHandle { inbox, task });
    }

    fn dispatch(&self, event: Event, connection: &Connection) {
        let controllers = lock(&self.controllers);
        match controllers.get(connection) {
            Some(handle) => {
                if handle.inbox.send(event).is_err() {
                    log::debug!("[{}] Controller gone, event dropped", connection.id());
                }
            }
            None => log::debug!(
                "[{}] No controller for '{}' event",
                connection.id(),
                event.event_type()
            ),
        }
    }

    fn close_controller(&self, connection: &Connection) {
        // Dropping the inbox lets the controller finish queued events and
        // stop its transcription session
        if lock(&self.controllers).remove(connection).is_some() {
            log::debug!("[{}] Controller released", connection.id());
        }
    }

    async fn start_adapters(self: Arc<Self>) -> Result<()> {
        log::info!(
            "🚀 Starting Wyoming server with {} adapter(s)",
            self.adapters.len()
        );

        for adapter in &self.adapters {
            adapter.bus().pipe(self.core.bus());
        }

        let results = join_all(self.adapters.iter().map(|adapter| adapter.start())).await;
        let failure = results.iter().find_map(|r| r.as_ref().err()).cloned();

        if let Some(err) = failure {
            log::error!("❌ Server start failed, rolling back: {}", err);
            for (adapter, result) in self.adapters.iter().zip(&results) {
                if result.is_ok() {
                    if let Err(e) = adapter.stop().await {
                        log::warn!("⚠️ Rollback stop failed: {}", e);
                    }
                }
                adapter.bus().unpipe(self.core.bus());
            }
            return Err(err);
        }

        Ok(())
    }

    async fn stop_adapters(self: Arc<Self>) -> Result<()> {
        log::info!("🛑 Stopping Wyoming server");

        for adapter in &self.adapters {
            adapter.bus().unpipe(self.core.bus());
        }

        let results = join_all(self.adapters.iter().map(|adapter| adapter.stop())).await;
        for result in results {
            if let Err(e) = result {
                log::warn!("⚠️ Adapter failed to stop: {}", e);
            }
        }

        let handles: Vec<ControllerHandle> = lock(&self.controllers)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            // Dropping the controller stops its session
            handle.task.abort();
        }

        Ok(())
    }
}

#[async_trait]
impl Connectable for Server {
    fn core(&self) -> &ConnectableCore {
        &self.inner.core
    }

    async fn start(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.core.start_with(move || inner.start_adapters()).await
    }

    async fn stop(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.core.stop_with(move || inner.stop_adapters()).await
    }
}
