//! Transport seam consumed by the channel and manager layers.
//!
//! - `Connector` / `Connection`: the callback-style contract a realtime
//!   transport has to satisfy (`on`, `once`, `off`, `emit`, `disconnect`).
//! - `listeners`: handler table shared by the bundled transports.
//! - `memory`: in-process transport driven by hand, used by tests and demos.
//! - `ws`: websocket transport with a JSON frame envelope.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Reconnect policy used by the websocket transport.
pub mod backoff;
/// JSON frame envelope exchanged by the websocket transport.
pub mod frame;
/// Event handler table with `on` / `once` / `off` semantics.
pub mod listeners;
/// In-process transport.
pub mod memory;
/// Websocket transport.
pub mod ws;

pub use backoff::ReconnectPolicy;

/// Payload carried by every event.
pub type Payload = serde_json::Value;

/// Callback installed on a connection for one event name.
pub type Handler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Lifecycle event fired by a transport once a session is established.
pub const CONNECT_EVENT: &str = "connect";
/// Lifecycle event fired by a transport when a live session ends.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// `"disconnect"` payload when the client tore the connection down.
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";
/// `"disconnect"` payload when the session dropped from the other side.
pub const TRANSPORT_CLOSE_REASON: &str = "transport close";

/// Dials new connections.
pub trait Connector: Send + Sync {
    /// Prepares a connection to `address`.
    ///
    /// The returned handle accepts handlers immediately but does not dial
    /// until [`Connection::open`] is called; the transport then fires
    /// [`CONNECT_EVENT`] once the session is actually up.
    fn connect(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Live connection handle.
pub trait Connection: Send + Sync {
    /// Transport-assigned identifier, if the transport has one yet.
    fn id(&self) -> Option<String>;

    /// Starts dialing. Calling it more than once has no effect.
    fn open(&self);

    /// Installs a persistent handler for `event`.
    fn on(&self, event: &str, handler: Handler);

    /// Installs a handler that is removed after its first delivery.
    fn once(&self, event: &str, handler: Handler);

    /// Removes every handler installed for `event`.
    fn off(&self, event: &str);

    /// Sends `event` with an optional payload to the server.
    fn emit(&self, event: &str, payload: Option<Payload>);

    /// Tears the connection down.
    fn disconnect(&self);
}

/// Identity comparison for connection handles.
pub fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Per-connection transport options.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Optional API key sent as the `x-api-key` handshake header.
    pub api_key: Option<SecretString>,
    /// Extra handshake headers.
    pub headers: Vec<(String, String)>,
    /// Upper bound for a single dial attempt.
    pub connect_timeout: Duration,
    /// Reconnect behaviour after a dropped session.
    pub reconnect: ReconnectPolicy,
}

impl ConnectOptions {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Sets the `x-api-key` handshake header.
    #[must_use]
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Adds an extra handshake header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            headers: Vec::new(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Errors produced while dialing or driving a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Address could not be parsed or uses an unsupported scheme.
    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The websocket transport was used outside a tokio runtime.
    #[error("no tokio runtime available to drive the connection")]
    NoRuntime,

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Frame serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Header could not be converted to a valid HTTP header value.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Dial did not complete within the configured timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

impl From<InvalidHeaderValue> for TransportError {
    fn from(err: InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}
