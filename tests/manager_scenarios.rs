use std::sync::Arc;

use serde_json::json;
use socket_events::channel::{EventChannel, EventSpec};
use socket_events::manager::{ConnectionManager, ConnectionSnapshot};
use socket_events::transport::memory::{MemoryConnection, MemoryConnector};
use socket_events::transport::ConnectOptions;

fn manager() -> (Arc<MemoryConnector>, ConnectionManager) {
    let connector = Arc::new(MemoryConnector::new());
    let manager = ConnectionManager::new(connector.clone());
    (connector, manager)
}

fn connect_and_handshake(
    connector: &MemoryConnector,
    manager: &ConnectionManager,
    id: Option<&str>,
) -> Arc<MemoryConnection> {
    manager
        .connect(Some("test://server"), false, &ConnectOptions::default())
        .expect("connect");
    let connection = connector.last_connection().expect("dialed connection");
    connection.simulate_connect(id);
    connection
}

#[test]
fn persistent_registration_returns_the_existing_channel() {
    let (_, manager) = manager();
    let first = manager.listen_to_event(Arc::new(EventChannel::new("a")));
    let second = manager.listen_to_event(Arc::new(EventChannel::new("a")));

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.channels().len(), 1);
}

#[test]
fn pending_fire_once_registrations_stack() {
    let (_, manager) = manager();
    let first = manager.listen_to_event(Arc::new(EventChannel::once("a")));
    let second = manager.listen_to_event(Arc::new(EventChannel::once("a")));

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(manager.channels().len(), 2);
}

#[test]
fn fire_once_registration_after_trigger_is_new() {
    let (connector, manager) = manager();
    let first = manager.listen_to_event(Arc::new(EventChannel::once("ready")));
    let connection = connect_and_handshake(&connector, &manager, Some("abc"));

    connection.fire("ready", json!(true));
    assert!(first.has_triggered());

    let second = manager.listen_to_event(Arc::new(EventChannel::once("ready")));
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(manager.channels().len(), 2);
    // Registered while connected, so it is attached right away.
    assert!(second.is_bound());
    assert_eq!(connection.listener_count("ready"), 1);
}

#[test]
fn reset_state_yields_initial_state_to_new_subscribers() {
    let (_, manager) = manager();
    let channel = manager.listen_to_event(Arc::new(EventChannel::new("status")));
    channel.reset_state();

    let mut subscription = channel.subscribe();
    assert_eq!(subscription.try_recv(), Some(json!(false)));
}

#[test]
fn object_initial_states_merge() {
    let channel = EventChannel::new("status").with_initial_state(json!({"a": 1}));
    channel.set_initial_state(json!({"b": 2}));
    assert_eq!(channel.initial_state(), json!({"a": 1, "b": 2}));
}

#[test]
fn emit_while_disconnected_makes_no_transport_call() {
    let (connector, manager) = manager();
    manager.emit("hello", Some(json!({"x": 1})));
    assert_eq!(connector.dial_count(), 0);

    manager
        .connect(Some("test://server"), false, &ConnectOptions::default())
        .expect("connect");
    manager.emit("hello", None);

    // Dialed but the handshake has not completed yet.
    let connection = connector.last_connection().expect("dialed connection");
    assert!(connection.emitted().is_empty());
}

#[test]
fn emit_while_connected_reaches_the_transport() {
    let (connector, manager) = manager();
    let connection = connect_and_handshake(&connector, &manager, None);

    manager.emit("hello", Some(json!({"x": 1})));
    let emitted = connection.emitted();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].event, "hello");
    assert_eq!(emitted[0].payload, Some(json!({"x": 1})));
}

#[test]
fn connect_twice_dials_once_unless_forced() {
    let (connector, manager) = manager();
    let first = connect_and_handshake(&connector, &manager, Some("one"));

    manager
        .connect(Some("test://server"), false, &ConnectOptions::default())
        .expect("redundant connect");
    assert_eq!(connector.dial_count(), 1);

    manager
        .connect(Some("test://server"), true, &ConnectOptions::default())
        .expect("forced connect");
    assert_eq!(connector.dial_count(), 2);
    assert!(!first.is_torn_down());
    assert!(!manager.is_connected());
}

#[test]
fn handshake_publishes_id_and_delivers_payloads() {
    let (connector, manager) = manager();
    let ping = manager.listen_to_event(Arc::new(EventChannel::new("ping")));
    let mut states = manager.subscribe();
    let connection = connect_and_handshake(&connector, &manager, Some("abc"));

    assert_eq!(
        states.try_recv(),
        Some(ConnectionSnapshot {
            connected: true,
            id: Some("abc".to_string()),
        })
    );
    assert!(manager.is_connected());
    assert!(manager.raw().is_some());

    let mut payloads = ping.subscribe();
    connection.fire("ping", json!({"v": 1}));
    assert_eq!(payloads.try_recv(), Some(json!({"v": 1})));
    assert!(ping.has_triggered());
}

#[test]
fn fire_once_count_restarts_at_attach() {
    let (connector, manager) = manager();
    let pong = manager.listen_to_event(Arc::new(EventChannel::once("pong").with_count(5)));
    let connection = connect_and_handshake(&connector, &manager, None);

    connection.fire("pong", json!(null));
    assert_eq!(pong.trigger_count(), 1);
}

#[test]
fn listen_returns_streams_in_input_order() {
    let (connector, manager) = manager();
    let streams = manager.listen([
        EventSpec::from("first"),
        EventSpec::once("second"),
        EventSpec::from("first"),
    ]);
    assert_eq!(streams.len(), 3);
    assert_eq!(manager.channels().len(), 2);

    let connection = connect_and_handshake(&connector, &manager, None);
    connection.fire("first", json!(1));
    connection.fire("second", json!(2));

    let mut first = streams[0].subscribe();
    let mut second = streams[1].subscribe();
    let mut first_again = streams[2].subscribe();
    assert_eq!(first.try_recv(), Some(json!(1)));
    assert_eq!(second.try_recv(), Some(json!(2)));
    assert_eq!(first_again.try_recv(), Some(json!(1)));
}

#[test]
fn unhook_detaches_and_forgets_every_channel_with_the_name() {
    let (connector, manager) = manager();
    let ping = manager.listen_to_event(Arc::new(EventChannel::new("ping")));
    manager.listen_to_event(Arc::new(EventChannel::once("ping")));
    manager.listen_to_event(Arc::new(EventChannel::new("other")));
    let connection = connect_and_handshake(&connector, &manager, None);

    manager.unhook("ping");
    assert_eq!(manager.channels().len(), 1);
    assert!(!ping.is_bound());
    // Detaching the persistent channel clears every handler for the name.
    assert_eq!(connection.listener_count("ping"), 0);
    assert_eq!(connection.fire("ping", json!(1)), 0);
    assert!(!ping.has_triggered());
}

#[test]
fn lifecycle_events_track_connection_state() {
    let (connector, manager) = manager();
    let connection = connect_and_handshake(&connector, &manager, Some("abc"));
    let mut states = manager.subscribe();
    assert_eq!(states.try_recv().map(|s| s.connected), Some(true));

    connection.simulate_disconnect();
    assert!(!manager.is_connected());
    assert_eq!(states.try_recv(), Some(ConnectionSnapshot::status(false)));

    connection.simulate_connect(Some("abc"));
    assert!(manager.is_connected());
    assert_eq!(states.try_recv(), Some(ConnectionSnapshot::status(true)));
}

#[test]
fn disconnect_tears_down_and_publishes_disconnected() {
    let (connector, manager) = manager();
    let connection = connect_and_handshake(&connector, &manager, None);

    manager.disconnect();
    assert!(connection.is_torn_down());
    assert!(!manager.is_connected());
    assert!(manager.raw().is_none());
    assert_eq!(
        manager.event_stream().latest(),
        Some(ConnectionSnapshot::status(false))
    );

    // Already disconnected.
    manager.disconnect();
}

#[test]
fn forced_reconnect_moves_persistent_channels_to_the_new_connection() {
    let (connector, manager) = manager();
    let ping = manager.listen_to_event(Arc::new(EventChannel::new("ping")));
    let first = connect_and_handshake(&connector, &manager, Some("one"));

    manager
        .connect(Some("test://server"), true, &ConnectOptions::default())
        .expect("forced connect");
    let second = connector.last_connection().expect("second connection");
    second.simulate_connect(Some("two"));

    assert_eq!(first.listener_count("ping"), 0);
    assert_eq!(second.listener_count("ping"), 1);
    second.fire("ping", json!("from two"));
    assert_eq!(ping.last_payload(), json!("from two"));
}
