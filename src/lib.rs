//! Event-channel convenience layer over a realtime socket connection.
//!
//! The crate is organized by concern:
//! - `replay`: single-slot replay streams shared by channels and the manager.
//! - `channel`: named event subscriptions with fire-once or persistent binding.
//! - `manager`: connection lifecycle, channel registry and connection state.
//! - `transport`: connection traits plus websocket and in-memory transports.

/// Event channels and their binding lifecycle.
pub mod channel;
/// Connection manager and channel registry.
pub mod manager;
/// Replay stream primitive.
pub mod replay;
/// Transport abstraction, websocket client, and in-memory test transport.
pub mod transport;

pub use channel::{ChannelError, EventChannel, EventSpec};
pub use manager::{ConnectionManager, ConnectionSnapshot, DEFAULT_ADDRESS};
pub use replay::{ReplayStream, Subscription};
pub use transport::{ConnectOptions, Connection, Connector, Payload, TransportError};
