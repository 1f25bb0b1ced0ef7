//! Named event channels.
//!
//! An [`EventChannel`] is the client-side half of one server-pushed event: it
//! installs a single handler on a connection and republishes every payload
//! onto its replay stream. Channels are either persistent (`on`) or
//! fire-once (`once`, re-armed at every attachment).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::replay::{ReplayStream, Subscription};
use crate::transport::{same_connection, Connection, Handler, Payload};

/// Callback run after every payload update.
pub type UpdateCallback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Errors surfaced synchronously by channel operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Attach was requested with no bound and no supplied connection.
    #[error("event `{event}` has no connection to attach to")]
    NoConnection { event: String },

    /// An argument was missing or unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Attach to a different connection was requested while still bound.
    #[error("event `{event}` is bound to another connection; detach it first")]
    AlreadyBound { event: String },
}

/// Declarative description of a channel, as accepted by
/// [`ConnectionManager::listen`](crate::manager::ConnectionManager::listen).
///
/// Deserializes from either a bare string or `{"name", "once", "count"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventSpec {
    /// Persistent channel for the named event.
    Name(String),
    /// Channel with explicit fire-once flag and preset trigger count.
    Descriptor {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        once: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
    },
}

impl EventSpec {
    /// Fire-once descriptor for `name`.
    pub fn once(name: impl Into<String>) -> Self {
        Self::Descriptor {
            name: name.into(),
            once: Some(true),
            count: None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Descriptor { name, .. } => name,
        }
    }
}

impl From<&str> for EventSpec {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for EventSpec {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

enum Binding {
    Unbound,
    Bound(Weak<dyn Connection>),
}

struct ChannelState {
    trigger_count: u64,
    last_payload: Payload,
    initial_state: Payload,
    binding: Binding,
    on_update: Option<UpdateCallback>,
}

/// One named event of interest.
pub struct EventChannel {
    name: String,
    unique: bool,
    stream: ReplayStream<Payload>,
    state: Mutex<ChannelState>,
}

impl EventChannel {
    /// Creates an unbound persistent channel for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique: false,
            stream: ReplayStream::new(),
            state: Mutex::new(ChannelState {
                trigger_count: 0,
                last_payload: Payload::Object(Default::default()),
                initial_state: Payload::Bool(false),
                binding: Binding::Unbound,
                on_update: None,
            }),
        }
    }

    /// Creates an unbound fire-once channel for `name`.
    pub fn once(name: impl Into<String>) -> Self {
        Self::new(name).with_unique(true)
    }

    pub fn from_spec(spec: EventSpec) -> Self {
        match spec {
            EventSpec::Name(name) => Self::new(name),
            EventSpec::Descriptor { name, once, count } => Self::new(name)
                .with_unique(once.unwrap_or(false))
                .with_count(count.unwrap_or(0)),
        }
    }

    /// Makes the channel fire-once (`true`) or persistent (`false`).
    #[must_use]
    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Presets the trigger counter. Zero leaves it untouched.
    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        if count > 0 {
            self.state_mut().trigger_count = count;
        }
        self
    }

    /// Assigns the initial state when `state` is truthy.
    #[must_use]
    pub fn with_initial_state(mut self, state: Payload) -> Self {
        if is_truthy(&state) {
            assign_initial_state(&mut self.state_mut().initial_state, state);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the channel listens with `once` semantics.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn trigger_count(&self) -> u64 {
        self.lock().trigger_count
    }

    pub fn has_triggered(&self) -> bool {
        self.trigger_count() > 0
    }

    /// Most recent payload; an empty object until the first update.
    pub fn last_payload(&self) -> Payload {
        self.lock().last_payload.clone()
    }

    pub fn initial_state(&self) -> Payload {
        self.lock().initial_state.clone()
    }

    /// Assigns the state republished by [`reset_state`](Self::reset_state).
    ///
    /// A falsy current state is replaced. An object state absorbs the keys of
    /// an incoming object and ignores anything else. Any other state is
    /// replaced.
    pub fn set_initial_state(&self, state: Payload) {
        assign_initial_state(&mut self.lock().initial_state, state);
    }

    /// Handle to the channel's replay stream.
    pub fn event_stream(&self) -> ReplayStream<Payload> {
        self.stream.clone()
    }

    pub fn subscribe(&self) -> Subscription<Payload> {
        self.stream.subscribe()
    }

    /// Whether the channel is bound to a connection that is still alive.
    pub fn is_bound(&self) -> bool {
        matches!(&self.lock().binding, Binding::Bound(weak) if weak.strong_count() > 0)
    }

    /// Installs the callback run after every update.
    pub fn set_on_update<F>(&self, callback: F)
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let callback: UpdateCallback = Arc::new(callback);
        self.lock().on_update = Some(callback);
    }

    /// Installs an optional callback, rejecting `None`.
    pub fn try_set_on_update(&self, callback: Option<UpdateCallback>) -> Result<(), ChannelError> {
        let callback = callback.ok_or_else(|| {
            ChannelError::InvalidArgument(format!(
                "on_update for event `{}` needs a callback",
                self.name
            ))
        })?;
        self.lock().on_update = Some(callback);
        Ok(())
    }

    /// Currently installed update callback.
    pub fn on_update(&self) -> Option<UpdateCallback> {
        self.lock().on_update.clone()
    }

    pub fn clear_on_update(&self) {
        self.lock().on_update = None;
    }

    /// Binds the channel to a connection and installs its handler.
    ///
    /// With `None` the currently bound connection is reused. Attaching to a
    /// different connection requires [`detach`](Self::detach) first.
    /// Fire-once channels are re-armed on every attachment: the trigger count
    /// goes back to zero and a fresh `once` handler is installed, even on the
    /// connection they are already bound to. For persistent channels
    /// attaching to the bound connection again is a no-op.
    pub fn attach(
        self: &Arc<Self>,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Result<(), ChannelError> {
        if self.name.is_empty() {
            return Err(ChannelError::InvalidArgument(
                "event name must not be empty".to_string(),
            ));
        }
        let target = {
            let mut state = self.lock();
            let bound = match &state.binding {
                Binding::Bound(weak) => weak.upgrade(),
                Binding::Unbound => None,
            };
            match (bound, connection) {
                (Some(bound), Some(requested)) if !same_connection(&bound, requested) => {
                    return Err(ChannelError::AlreadyBound {
                        event: self.name.clone(),
                    });
                }
                (Some(_), _) if !self.unique => return Ok(()),
                (Some(bound), _) => {
                    state.trigger_count = 0;
                    bound
                }
                (None, Some(requested)) => {
                    state.binding = Binding::Bound(Arc::downgrade(requested));
                    if self.unique {
                        state.trigger_count = 0;
                    }
                    Arc::clone(requested)
                }
                (None, None) => {
                    return Err(ChannelError::NoConnection {
                        event: self.name.clone(),
                    });
                }
            }
        };

        let channel = Arc::downgrade(self);
        let handler: Handler = Arc::new(move |payload| {
            if let Some(channel) = channel.upgrade() {
                channel.update(payload);
            }
        });
        if self.unique {
            target.once(&self.name, handler);
        } else {
            target.on(&self.name, handler);
        }
        debug!(event = "channel_attached", name = %self.name, unique = self.unique);
        Ok(())
    }

    /// Unbinds the channel.
    ///
    /// Persistent channels remove every handler for their name from the
    /// bound connection. Fire-once handlers are left to expire on their own.
    pub fn detach(&self) {
        let previous = std::mem::replace(&mut self.lock().binding, Binding::Unbound);
        let Binding::Bound(weak) = previous else {
            return;
        };
        if !self.unique {
            if let Some(connection) = weak.upgrade() {
                connection.off(&self.name);
            }
        }
        debug!(event = "channel_detached", name = %self.name, unique = self.unique);
    }

    /// Republishes the initial state as if it had arrived from the server.
    ///
    /// This counts as a trigger and runs the update callback.
    pub fn reset_state(&self) {
        let initial = self.initial_state();
        self.update(initial);
    }

    fn update(&self, payload: Payload) {
        self.stream.publish(payload.clone());
        let callback = {
            let mut state = self.lock();
            state.trigger_count += 1;
            state.on_update.clone()
        };
        if let Some(callback) = callback {
            callback(&payload);
        }
        self.lock().last_payload = payload;
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&mut self) -> &mut ChannelState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventChannel")
            .field("name", &self.name)
            .field("unique", &self.unique)
            .field("trigger_count", &state.trigger_count)
            .field(
                "bound",
                &matches!(&state.binding, Binding::Bound(weak) if weak.strong_count() > 0),
            )
            .finish()
    }
}

fn is_truthy(value: &Payload) -> bool {
    match value {
        Payload::Null => false,
        Payload::Bool(flag) => *flag,
        Payload::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Payload::String(text) => !text.is_empty(),
        Payload::Array(_) | Payload::Object(_) => true,
    }
}

fn assign_initial_state(current: &mut Payload, next: Payload) {
    if !is_truthy(current) {
        *current = next;
        return;
    }
    match (current, next) {
        (Payload::Object(existing), Payload::Object(incoming)) => existing.extend(incoming),
        (Payload::Object(_), _) => {}
        (current, next) => *current = next,
    }
}
