//! Start/stop lifecycle and event bus shared by adapters and the server.
//!
//! Every component is a [`Connectable`]: it owns a [`ConnectableCore`] (state
//! machine plus [`EventBus`]) and supplies its own startup and teardown.
//! Buses can be piped into each other so a server sees everything its
//! adapters emit, except their own `start`/`stop`.
//!
//! The pipe graph is not checked for cycles. Piping two buses into each
//! other makes the next pipeable `emit` recurse without bound, so callers
//! must keep the graph acyclic.

use crate::connection::Connection;
use crate::error::{Result, WyomingError};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use strum::Display;
use wyoming_protocol::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectableState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Bus event kinds listeners subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Start,
    Stop,
    Connect,
    Disconnect,
    Event,
    Error,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Start,
    Stop,
    Connect(Connection),
    Disconnect(Connection),
    Event(Event, Connection),
    Error(WyomingError),
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BusEvent::Start => EventKind::Start,
            BusEvent::Stop => EventKind::Stop,
            BusEvent::Connect(_) => EventKind::Connect,
            BusEvent::Disconnect(_) => EventKind::Disconnect,
            BusEvent::Event(..) => EventKind::Event,
            BusEvent::Error(_) => EventKind::Error,
        }
    }

    /// Lifecycle notifications stay on the bus that produced them
    pub fn is_pipeable(&self) -> bool {
        !matches!(self, BusEvent::Start | BusEvent::Stop)
    }
}

pub type Listener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

fn same_listener(a: &Listener, b: &Listener) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
    pipes: Mutex<Vec<Weak<BusInner>>>,
}

impl BusInner {
    fn emit(&self, event: &BusEvent) {
        // Snapshot so listeners may call on/off/emit without deadlocking
        let listeners: Vec<Listener> = lock(&self.listeners)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for listener in &listeners {
            listener(event);
        }

        if !event.is_pipeable() {
            return;
        }

        let destinations: Vec<Arc<BusInner>> =
            lock(&self.pipes).iter().filter_map(Weak::upgrade).collect();
        for destination in destinations {
            destination.emit(event);
        }
    }
}

/// Typed publish/subscribe hub with forwarding pipes
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same listener twice is a no-op.
    pub fn on(&self, kind: EventKind, listener: Listener) {
        let mut listeners = lock(&self.inner.listeners);
        let registered = listeners.entry(kind).or_default();
        if !registered.iter().any(|l| same_listener(l, &listener)) {
            registered.push(listener);
        }
    }

    pub fn off(&self, kind: EventKind, listener: &Listener) {
        let mut listeners = lock(&self.inner.listeners);
        if let Some(registered) = listeners.get_mut(&kind) {
            registered.retain(|l| !same_listener(l, listener));
        }
    }

    /// Deliver to local listeners in registration order, then forward
    /// pipeable events to every pipe destination
    pub fn emit(&self, event: &BusEvent) {
        self.inner.emit(event);
    }

    pub fn pipe(&self, destination: &EventBus) {
        let mut pipes = lock(&self.inner.pipes);
        let target = Arc::downgrade(&destination.inner);
        if !pipes.iter().any(|p| p.ptr_eq(&target)) {
            pipes.push(target);
        }
    }

    pub fn unpipe(&self, destination: &EventBus) {
        let target = Arc::downgrade(&destination.inner);
        lock(&self.inner.pipes).retain(|p| !p.ptr_eq(&target) && p.strong_count() > 0);
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.inner.listeners).get(&kind).map_or(0, Vec::len)
    }
}

type Transition = Shared<BoxFuture<'static, Result<()>>>;

struct Lifecycle {
    state: ConnectableState,
    starting: Option<Transition>,
    stopping: Option<Transition>,
}

/// State machine and bus embedded in every [`Connectable`]
#[derive(Clone)]
pub struct ConnectableCore {
    name: String,
    bus: EventBus,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl ConnectableCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bus: EventBus::new(),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ConnectableState::Stopped,
                starting: None,
                stopping: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> ConnectableState {
        lock(&self.lifecycle).state
    }

    /// Run `startup` unless a start is already in flight or done.
    ///
    /// Concurrent callers share one transition and observe the same result.
    pub async fn start_with<F, Fut>(&self, startup: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let transition = {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                ConnectableState::Started => return Ok(()),
                ConnectableState::Starting => match &lifecycle.starting {
                    Some(transition) => transition.clone(),
                    None => return Ok(()),
                },
                ConnectableState::Stopping => {
                    return Err(WyomingError::InvalidState(format!(
                        "Unable to start {} while not fully stopped",
                        self.name
                    )))
                }
                ConnectableState::Stopped => {
                    let transition = self.transition(
                        startup,
                        ConnectableState::Started,
                        ConnectableState::Stopped,
                        BusEvent::Start,
                    );
                    lifecycle.state = ConnectableState::Starting;
                    lifecycle.starting = Some(transition.clone());
                    transition
                }
            }
        };

        transition.await
    }

    /// Run `teardown` unless a stop is already in flight or done.
    ///
    /// A failed teardown leaves the instance started.
    pub async fn stop_with<F, Fut>(&self, teardown: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let transition = {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                ConnectableState::Stopped => return Ok(()),
                ConnectableState::Stopping => match &lifecycle.stopping {
                    Some(transition) => transition.clone(),
                    None => return Ok(()),
                },
                ConnectableState::Starting => {
                    return Err(WyomingError::InvalidState(format!(
                        "Unable to stop {} while not fully started",
                        self.name
                    )))
                }
                ConnectableState::Started => {
                    let transition = self.transition(
                        teardown,
                        ConnectableState::Stopped,
                        ConnectableState::Started,
                        BusEvent::Stop,
                    );
                    lifecycle.state = ConnectableState::Stopping;
                    lifecycle.stopping = Some(transition.clone());
                    transition
                }
            }
        };

        transition.await
    }

    fn transition<F, Fut>(
        &self,
        work: F,
        on_success: ConnectableState,
        on_failure: ConnectableState,
        announce: BusEvent,
    ) -> Transition
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let lifecycle = Arc::clone(&self.lifecycle);
        let bus = self.bus.clone();
        let name = self.name.clone();

        async move {
            let result = work().await;

            {
                let mut lifecycle = lock(&lifecycle);
                lifecycle.state = if result.is_ok() { on_success } else { on_failure };
                lifecycle.starting = None;
                lifecycle.stopping = None;
            }

            match &result {
                Ok(()) => {
                    log::info!("✅ {} {}", name, on_success);
                    bus.emit(&announce);
                }
                Err(e) => {
                    log::error!("❌ {} failed to leave {}: {}", name, on_failure, e);
                    bus.emit(&BusEvent::Error(e.clone()));
                }
            }

            result
        }
        .boxed()
        .shared()
    }
}

/// Anything with a start/stop lifecycle and an event bus
#[async_trait]
pub trait Connectable: Send + Sync {
    fn core(&self) -> &ConnectableCore;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn state(&self) -> ConnectableState {
        self.core().state()
    }

    fn bus(&self) -> &EventBus {
        self.core().bus()
    }

    fn on(&self, kind: EventKind, listener: Listener) {
        self.bus().on(kind, listener);
    }

    fn off(&self, kind: EventKind, listener: &Listener) {
        self.bus().off(kind, listener);
    }

    /// Re-emit every non-lifecycle event of `self` on `destination`
    fn pipe(&self, destination: &dyn Connectable) {
        self.bus().pipe(destination.bus());
    }

    fn unpipe(&self, destination: &dyn Connectable) {
        self.bus().unpipe(destination.bus());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingTransport;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Probe {
        startups: AtomicUsize,
        teardowns: AtomicUsize,
        fail_start: AtomicBool,
        fail_stop: AtomicBool,
        gate: Notify,
        gated: AtomicBool,
    }

    impl Probe {
        async fn pass_gate(&self) {
            if self.gated.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
        }
    }

    struct Dummy {
        core: ConnectableCore,
        probe: Arc<Probe>,
    }

    impl Dummy {
        fn new() -> Self {
            Self {
                core: ConnectableCore::new("dummy"),
                probe: Arc::new(Probe::default()),
            }
        }
    }

    #[async_trait]
    impl Connectable for Dummy {
        fn core(&self) -> &ConnectableCore {
            &self.core
        }

        async fn start(&self) -> Result<()> {
            let probe = Arc::clone(&self.probe);
            self.core
                .start_with(move || async move {
                    probe.startups.fetch_add(1, Ordering::SeqCst);
                    probe.pass_gate().await;
                    if probe.fail_start.load(Ordering::SeqCst) {
                        return Err(WyomingError::Transport("bind failed".into()));
                    }
                    Ok(())
                })
                .await
        }

        async fn stop(&self) -> Result<()> {
            let probe = Arc::clone(&self.probe);
            self.core
                .stop_with(move || async move {
                    probe.teardowns.fetch_add(1, Ordering::SeqCst);
                    probe.pass_gate().await;
                    if probe.fail_stop.load(Ordering::SeqCst) {
                        return Err(WyomingError::Transport("close failed".into()));
                    }
                    Ok(())
                })
                .await
        }
    }

    fn counter(bus: &EventBus, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.on(
            kind,
            Arc::new(move |_: &BusEvent| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_startup() {
        env_logger::builder().is_test(true).try_init().ok();

        let dummy = Dummy::new();
        dummy.probe.gated.store(true, Ordering::SeqCst);
        let starts = counter(dummy.bus(), EventKind::Start);

        let (first, second, _) = tokio::join!(dummy.start(), dummy.start(), async {
            assert_eq!(dummy.state(), ConnectableState::Starting);
            dummy.probe.gate.notify_one();
        });

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(dummy.probe.startups.load(Ordering::SeqCst), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(dummy.state(), ConnectableState::Started);

        // Already started: nothing runs again
        dummy.start().await.unwrap();
        assert_eq!(dummy.probe.startups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_while_stopped_skips_teardown() {
        let dummy = Dummy::new();
        dummy.stop().await.unwrap();
        assert_eq!(dummy.probe.teardowns.load(Ordering::SeqCst), 0);
        assert_eq!(dummy.state(), ConnectableState::Stopped);
    }

    #[tokio::test]
    async fn test_start_while_stopping_is_rejected() {
        let dummy = Dummy::new();
        dummy.start().await.unwrap();
        dummy.probe.gated.store(true, Ordering::SeqCst);

        let (stopped, _) = tokio::join!(dummy.stop(), async {
            assert_eq!(dummy.state(), ConnectableState::Stopping);
            let err = dummy.start().await.unwrap_err();
            assert!(matches!(err, WyomingError::InvalidState(_)));
            dummy.probe.gate.notify_one();
        });

        assert!(stopped.is_ok());
        assert_eq!(dummy.probe.startups.load(Ordering::SeqCst), 1);
        assert_eq!(dummy.state(), ConnectableState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_while_starting_is_rejected() {
        let dummy = Dummy::new();
        dummy.probe.gated.store(true, Ordering::SeqCst);

        let (started, _) = tokio::join!(dummy.start(), async {
            let err = dummy.stop().await.unwrap_err();
            assert!(matches!(err, WyomingError::InvalidState(_)));
            dummy.probe.gate.notify_one();
        });

        assert!(started.is_ok());
        assert_eq!(dummy.probe.teardowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_start_emits_error_and_stays_stopped() {
        let dummy = Dummy::new();
        dummy.probe.fail_start.store(true, Ordering::SeqCst);
        let errors = counter(dummy.bus(), EventKind::Error);
        let starts = counter(dummy.bus(), EventKind::Start);

        let err = dummy.start().await.unwrap_err();
        assert_eq!(err, WyomingError::Transport("bind failed".into()));
        assert_eq!(dummy.state(), ConnectableState::Stopped);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 0);

        // A later attempt runs startup again
        dummy.probe.fail_start.store(false, Ordering::SeqCst);
        dummy.start().await.unwrap();
        assert_eq!(dummy.probe.startups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_stop_stays_started() {
        let dummy = Dummy::new();
        dummy.start().await.unwrap();
        dummy.probe.fail_stop.store(true, Ordering::SeqCst);

        assert!(dummy.stop().await.is_err());
        assert_eq!(dummy.state(), ConnectableState::Started);

        dummy.probe.fail_stop.store(false, Ordering::SeqCst);
        dummy.stop().await.unwrap();
        assert_eq!(dummy.state(), ConnectableState::Stopped);
    }

    #[tokio::test]
    async fn test_pipe_forwards_events_but_not_lifecycle() {
        let source = Dummy::new();
        let destination = Dummy::new();
        source.pipe(&destination);

        let events = counter(destination.bus(), EventKind::Event);
        let starts = counter(destination.bus(), EventKind::Start);

        let (connection, _) = RecordingTransport::connection();
        source
            .bus()
            .emit(&BusEvent::Event(Event::new("ping"), connection.clone()));
        source.start().await.unwrap();

        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 0);

        source.unpipe(&destination);
        source
            .bus()
            .emit(&BusEvent::Event(Event::new("ping"), connection));
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pipes_chain_through_intermediate_buses() {
        let first = EventBus::new();
        let second = EventBus::new();
        let third = EventBus::new();
        first.pipe(&second);
        second.pipe(&third);

        let seen = counter(&third, EventKind::Error);
        first.emit(&BusEvent::Error(WyomingError::Decode("bad".into())));
        first.emit(&BusEvent::Stop);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listeners_run_in_order_and_deduplicate() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_order = Arc::clone(&order);
        let first: Listener = Arc::new(move |_: &BusEvent| first_order.lock().unwrap().push(1));
        let second_order = Arc::clone(&order);
        let second: Listener = Arc::new(move |_: &BusEvent| second_order.lock().unwrap().push(2));

        bus.on(EventKind::Start, Arc::clone(&first));
        bus.on(EventKind::Start, Arc::clone(&second));
        bus.on(EventKind::Start, Arc::clone(&first));
        assert_eq!(bus.listener_count(EventKind::Start), 2);

        bus.emit(&BusEvent::Start);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);

        bus.off(EventKind::Start, &first);
        bus.emit(&BusEvent::Start);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 2]);
    }
}
