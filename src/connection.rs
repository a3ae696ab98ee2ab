//! Transport-agnostic peer handle.
//!
//! Adapters own the socket side; everything above them only sees a
//! [`Connection`] that can send one event or close.

use crate::error::Result;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use wyoming_protocol::Event;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What an adapter has to provide for each peer
pub trait Transport: Send + Sync {
    /// Encode and queue one event for the peer
    fn send(&self, event: &Event) -> Result<()>;

    /// Begin tearing the peer down; does not wait for `disconnect`
    fn close(&self);

    /// Human readable peer description for logs
    fn peer(&self) -> String;
}

/// Cheap, cloneable handle to one live peer
#[derive(Clone)]
pub struct Connection {
    id: u64,
    transport: Arc<dyn Transport>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    /// Encode and write one event. Encoding errors surface here, synchronously.
    pub fn send(&self, event: &Event) -> Result<()> {
        log::debug!("📤 [{}] '{}'", self.id, event.event_type());
        self.transport.send(event)
    }

    /// Initiate teardown. Resolves once initiated, not once disconnected.
    pub async fn close(&self) {
        log::debug!("🔌 [{}] close requested", self.id);
        self.transport.close();
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.transport.peer())
            .finish()
    }
}

/// Live connections owned by one adapter
#[derive(Clone, Default)]
pub struct Connections {
    inner: Arc<Mutex<HashMap<u64, Connection>>>,
}

impl Connections {
    pub fn insert(&self, connection: Connection) {
        self.lock().insert(connection.id(), connection);
    }

    pub fn remove(&self, connection: &Connection) -> Option<Connection> {
        self.lock().remove(&connection.id())
    }

    pub fn snapshot(&self) -> Vec<Connection> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Connection>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
