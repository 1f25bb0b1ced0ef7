//! In-process transport.
//!
//! Nothing travels over the network: `open` only records the request, and
//! the owner of a [`MemoryConnection`] drives the lifecycle
//! (`simulate_connect`, `simulate_disconnect`) and
//! delivers server events with [`MemoryConnection::fire`]. Every dial and
//! every outbound message is recorded for inspection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::transport::listeners::Listeners;
use crate::transport::{
    ConnectOptions, Connection, Connector, Handler, Payload, TransportError,
    CLIENT_DISCONNECT_REASON, CONNECT_EVENT, DISCONNECT_EVENT, TRANSPORT_CLOSE_REASON,
};

/// Connector handing out [`MemoryConnection`]s.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection dialed so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recently dialed connection.
    pub fn last_connection(&self) -> Option<Arc<MemoryConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn dial_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        address: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let connection = Arc::new(MemoryConnection::new(address));
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&connection));
        debug!(event = "memory_connection_dialed", address);
        Ok(connection)
    }
}

/// Message recorded by [`MemoryConnection::emit`].
#[derive(Clone, Debug, PartialEq)]
pub struct Emitted {
    pub event: String,
    pub payload: Option<Payload>,
}

/// Connection whose server side is driven by hand.
#[derive(Debug)]
pub struct MemoryConnection {
    address: String,
    listeners: Listeners,
    id: Mutex<Option<String>>,
    emitted: Mutex<Vec<Emitted>>,
    opened: AtomicBool,
    open: AtomicBool,
    torn_down: AtomicBool,
}

impl MemoryConnection {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            listeners: Listeners::new(),
            id: Mutex::new(None),
            emitted: Mutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            open: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_id(&self, id: Option<String>) {
        *self.id.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    /// Marks the session up and fires `"connect"`.
    pub fn simulate_connect(&self, id: Option<&str>) {
        if let Some(id) = id {
            self.set_id(Some(id.to_string()));
        }
        self.open.store(true, Ordering::SeqCst);
        self.listeners.dispatch(CONNECT_EVENT, &Payload::Null);
    }

    /// Marks the session down from the server side and fires `"disconnect"`.
    pub fn simulate_disconnect(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.listeners.dispatch(
                DISCONNECT_EVENT,
                &Payload::String(TRANSPORT_CLOSE_REASON.to_string()),
            );
        }
    }

    /// Delivers a server event and returns how many handlers ran.
    pub fn fire(&self, event: &str, payload: Payload) -> usize {
        self.listeners.dispatch(event, &payload)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.count(event)
    }

    pub fn emitted(&self) -> Vec<Emitted> {
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the session is up.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Whether [`Connection::open`] was called on this handle.
    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Whether [`Connection::disconnect`] was called on this handle.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> Option<String> {
        self.id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn open(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    fn on(&self, event: &str, handler: Handler) {
        self.listeners.on(event, handler);
    }

    fn once(&self, event: &str, handler: Handler) {
        self.listeners.once(event, handler);
    }

    fn off(&self, event: &str) {
        self.listeners.off(event);
    }

    fn emit(&self, event: &str, payload: Option<Payload>) {
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Emitted {
                event: event.to_string(),
                payload,
            });
    }

    fn disconnect(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            self.listeners.dispatch(
                DISCONNECT_EVENT,
                &Payload::String(CLIENT_DISCONNECT_REASON.to_string()),
            );
        }
    }
}
