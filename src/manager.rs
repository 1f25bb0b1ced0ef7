//! Connection manager.
//!
//! [`ConnectionManager`] owns the transport connection and the registry of
//! [`EventChannel`]s. It deduplicates registrations, attaches every
//! registered channel once the transport completes its handshake, and
//! publishes connection-state snapshots on a replay stream.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{ChannelError, EventChannel, EventSpec};
use crate::replay::{ReplayStream, Subscription};
use crate::transport::ws::WsConnector;
use crate::transport::{
    same_connection, ConnectOptions, Connection, Connector, Payload, TransportError,
    CONNECT_EVENT, DISCONNECT_EVENT,
};

/// Address dialed when `connect` is called without one.
pub const DEFAULT_ADDRESS: &str = "http://localhost:5000";

/// Identifier published when the transport has not assigned one.
pub const UNASSIGNED_CONNECTION_ID: &str = "0";

/// Connection-state update published by the manager.
///
/// The handshake snapshot carries the transport id; later transitions carry
/// only the flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ConnectionSnapshot {
    pub fn handshake(id: Option<String>) -> Self {
        Self {
            connected: true,
            id: Some(id.unwrap_or_else(|| UNASSIGNED_CONNECTION_ID.to_string())),
        }
    }

    pub fn status(connected: bool) -> Self {
        Self {
            connected,
            id: None,
        }
    }
}

struct ManagerState {
    registry: Vec<Arc<EventChannel>>,
    connected: bool,
    connection: Option<Arc<dyn Connection>>,
}

struct Shared {
    state: Mutex<ManagerState>,
    status: ReplayStream<ConnectionSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connected(&self, value: bool) {
        let mut state = self.lock();
        state.connected = value;
        self.status.publish(ConnectionSnapshot::status(value));
    }

    /// Applies a lifecycle transition reported by `connection`, ignoring
    /// connections that have since been replaced.
    fn transition_from(&self, connection: &Arc<dyn Connection>, value: bool) {
        let mut state = self.lock();
        if !is_current(&state, connection) {
            debug!(event = "stale_transition_ignored", connected = value);
            return;
        }
        state.connected = value;
        self.status.publish(ConnectionSnapshot::status(value));
    }

    fn complete_handshake(self: &Arc<Self>, connection: &Arc<dyn Connection>) {
        let id = connection.id();
        let registry = {
            let mut state = self.lock();
            if !is_current(&state, connection) {
                debug!(event = "stale_handshake_ignored", id = ?id);
                return;
            }
            state.connected = true;
            self.status.publish(ConnectionSnapshot::handshake(id.clone()));
            state.registry.clone()
        };

        for channel in &registry {
            bind_channel(channel, connection);
        }

        let shared = Arc::downgrade(self);
        let source = Arc::downgrade(connection);
        connection.on(
            CONNECT_EVENT,
            Arc::new(move |_| {
                if let (Some(shared), Some(source)) = (shared.upgrade(), source.upgrade()) {
                    shared.transition_from(&source, true);
                }
            }),
        );

        let shared = Arc::downgrade(self);
        let source = Arc::downgrade(connection);
        connection.on(
            DISCONNECT_EVENT,
            Arc::new(move |_| {
                if let (Some(shared), Some(source)) = (shared.upgrade(), source.upgrade()) {
                    shared.transition_from(&source, false);
                }
            }),
        );

        debug!(event = "handshake_complete", id = ?id, channels = registry.len());
    }
}

fn is_current(state: &ManagerState, connection: &Arc<dyn Connection>) -> bool {
    state
        .connection
        .as_ref()
        .is_some_and(|current| same_connection(current, connection))
}

/// Attaches `channel` to `connection`, detaching it from any other
/// connection first.
fn bind_channel(channel: &Arc<EventChannel>, connection: &Arc<dyn Connection>) {
    let result = match channel.attach(Some(connection)) {
        Err(ChannelError::AlreadyBound { .. }) => {
            channel.detach();
            channel.attach(Some(connection))
        }
        other => other,
    };
    if let Err(err) = result {
        warn!(event = "channel_attach_failed", name = channel.name(), error = %err);
    }
}

/// Whether `existing` makes `candidate` a duplicate registration.
///
/// Pending fire-once registrations of the same name stack; any registration
/// whose name matches a persistent entry collapses onto it.
fn is_duplicate_of(existing: &EventChannel, candidate: &EventChannel) -> bool {
    if !existing.has_triggered()
        && !candidate.has_triggered()
        && candidate.is_unique()
        && existing.name() == candidate.name()
    {
        return false;
    }
    !existing.is_unique() && existing.name() == candidate.name()
}

fn find_registered(
    registry: &[Arc<EventChannel>],
    candidate: &Arc<EventChannel>,
) -> Option<Arc<EventChannel>> {
    if let Some(same) = registry.iter().find(|entry| Arc::ptr_eq(entry, candidate)) {
        return Some(Arc::clone(same));
    }
    let matched = registry
        .iter()
        .find(|entry| is_duplicate_of(entry, candidate))?;
    let exact = registry.iter().find(|entry| {
        entry.is_unique() == candidate.is_unique() && entry.name() == candidate.name()
    });
    Some(Arc::clone(exact.unwrap_or(matched)))
}

/// Single logical connection plus the registry of channels listening on it.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Creates a disconnected manager dialing through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState {
                    registry: Vec::new(),
                    connected: false,
                    connection: None,
                }),
                status: ReplayStream::new(),
            }),
        }
    }

    /// Creates a manager using the websocket transport.
    pub fn websocket() -> Self {
        Self::new(Arc::new(WsConnector::new()))
    }

    /// The live connection, only while connected.
    pub fn raw(&self) -> Option<Arc<dyn Connection>> {
        let state = self.shared.lock();
        if state.connected {
            state.connection.clone()
        } else {
            None
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    /// Overrides the connection flag and publishes `{connected: value}`.
    pub fn set_connected(&self, value: bool) {
        self.shared.set_connected(value);
    }

    /// Handle to the connection-state replay stream.
    pub fn event_stream(&self) -> ReplayStream<ConnectionSnapshot> {
        self.shared.status.clone()
    }

    pub fn subscribe(&self) -> Subscription<ConnectionSnapshot> {
        self.shared.status.subscribe()
    }

    /// Registered channels in registration order.
    pub fn channels(&self) -> Vec<Arc<EventChannel>> {
        self.shared.lock().registry.clone()
    }

    /// Sends `event` when connected; drops it silently otherwise.
    pub fn emit(&self, event: &str, data: Option<Payload>) {
        match self.raw() {
            Some(connection) => connection.emit(event, data),
            None => debug!(event = "emit_dropped", name = event),
        }
    }

    /// Whether registering `candidate` would collapse onto an existing entry.
    pub fn event_exists(&self, candidate: &EventChannel) -> bool {
        self.shared
            .lock()
            .registry
            .iter()
            .any(|entry| is_duplicate_of(entry, candidate))
    }

    /// Registers `channel` unless an equivalent one is already registered.
    ///
    /// Returns the registered instance, which is the existing entry for a
    /// duplicate. A newly registered channel is attached right away when the
    /// manager is connected.
    pub fn listen_to_event(&self, channel: Arc<EventChannel>) -> Arc<EventChannel> {
        let connection = {
            let mut state = self.shared.lock();
            if let Some(existing) = find_registered(&state.registry, &channel) {
                debug!(
                    event = "channel_deduplicated",
                    name = channel.name(),
                    unique = channel.is_unique()
                );
                return existing;
            }
            state.registry.push(Arc::clone(&channel));
            if state.connected {
                state.connection.clone()
            } else {
                None
            }
        };

        if let Some(connection) = connection {
            bind_channel(&channel, &connection);
        }
        channel
    }

    /// Registers one channel per [`EventSpec`] and returns their replay streams in
    /// input order.
    pub fn listen<I, S>(&self, specs: I) -> Vec<ReplayStream<Payload>>
    where
        I: IntoIterator<Item = S>,
        S: Into<EventSpec>,
    {
        specs
            .into_iter()
            .map(|spec| {
                let channel = Arc::new(EventChannel::from_spec(spec.into()));
                self.listen_to_event(channel).event_stream()
            })
            .collect()
    }

    /// Detaches and forgets every channel named `name`.
    pub fn unhook(&self, name: &str) {
        let removed: Vec<Arc<EventChannel>> = {
            let mut state = self.shared.lock();
            let (removed, kept) = std::mem::take(&mut state.registry)
                .into_iter()
                .partition(|channel| channel.name() == name);
            state.registry = kept;
            removed
        };

        for channel in &removed {
            channel.detach();
        }
        debug!(event = "channel_unhooked", name, removed = removed.len());
    }

    /// Dials `address` (default [`DEFAULT_ADDRESS`]).
    ///
    /// While connected this returns the live connection unless `force_new`
    /// is set, in which case the live connection is abandoned (not torn
    /// down) and a new one is dialed. Registered channels are attached when
    /// the new connection completes its handshake.
    pub fn connect(
        &self,
        address: Option<&str>,
        force_new: bool,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let was_connected = {
            let state = self.shared.lock();
            match (&state.connection, state.connected, force_new) {
                (Some(connection), true, false) => {
                    debug!(event = "connect_skipped");
                    return Ok(Arc::clone(connection));
                }
                _ => state.connected,
            }
        };
        if was_connected && force_new {
            self.shared.set_connected(false);
        }

        let address = address.unwrap_or(DEFAULT_ADDRESS);
        let connection = self.connector.connect(address, options)?;
        self.shared.lock().connection = Some(Arc::clone(&connection));

        let shared = Arc::downgrade(&self.shared);
        let source = Arc::downgrade(&connection);
        connection.once(
            CONNECT_EVENT,
            Arc::new(move |_| {
                if let (Some(shared), Some(source)) = (shared.upgrade(), source.upgrade()) {
                    shared.complete_handshake(&source);
                }
            }),
        );
        connection.open();

        debug!(event = "connection_dialed", address, force_new);
        Ok(connection)
    }

    /// Tears the live connection down. No-op while disconnected.
    pub fn disconnect(&self) {
        let connection = {
            let state = self.shared.lock();
            if !state.connected {
                return;
            }
            state.connection.clone()
        };

        if let Some(connection) = connection {
            connection.disconnect();
        }
        self.shared.set_connected(false);
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::websocket()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ConnectionManager")
            .field("connected", &state.connected)
            .field("channels", &state.registry)
            .finish()
    }
}
