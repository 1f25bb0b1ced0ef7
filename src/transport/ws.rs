//! Websocket transport.
//!
//! [`WsConnector::connect`] spawns a background worker that owns the socket
//! and returns immediately; the worker dials once the handle is opened. It
//! fires `"connect"` after every
//! successful dial, routes inbound [`Frame`]s to the installed handlers, and
//! fires `"disconnect"` when a live session ends. Outbound frames are queued
//! and survive a reconnect.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use url::Url;

use crate::transport::frame::Frame;
use crate::transport::listeners::Listeners;
use crate::transport::{
    ConnectOptions, Connection, Connector, Handler, Payload, TransportError,
    CLIENT_DISCONNECT_REASON, CONNECT_EVENT, DISCONNECT_EVENT, TRANSPORT_CLOSE_REASON,
};

/// Handshake response header carrying the server-assigned connection id.
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";
/// Handshake request header carrying [`ConnectOptions::api_key`].
pub const API_KEY_HEADER: &str = "x-api-key";

/// Connector dialing websocket servers.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let target = DialTarget {
            url: websocket_url(address)?,
            headers: handshake_headers(options)?,
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (start_tx, start_rx) = oneshot::channel();
        let shared = Arc::new(Shared::default());

        debug!(event = "ws_connection_spawned", url = %target.url);
        runtime.spawn(connection_worker(
            target,
            options.clone(),
            Arc::clone(&shared),
            start_rx,
            outbound_rx,
        ));

        Ok(Arc::new(WsConnection {
            shared,
            start: Mutex::new(Some(start_tx)),
            outbound: outbound_tx,
        }))
    }
}

/// Maps an `http(s)` or `ws(s)` address to the websocket URL to dial.
pub fn websocket_url(address: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let mut url = Url::parse(address).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot switch scheme to `{scheme}`")))?;
    }
    Ok(url)
}

fn handshake_headers(options: &ConnectOptions) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| TransportError::InvalidHeader(err.to_string()))?;
        headers.insert(name, value.parse::<HeaderValue>()?);
    }
    if let Some(api_key) = &options.api_key {
        headers.insert(API_KEY_HEADER, api_key.expose_secret().parse()?);
    }
    Ok(headers)
}

#[derive(Debug, Default)]
struct Shared {
    listeners: Listeners,
    id: Mutex<Option<String>>,
}

impl Shared {
    fn set_id(&self, id: Option<String>) {
        *self.id.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }
}

#[derive(Debug)]
enum Outbound {
    Emit(Frame),
    Close,
}

/// Handle to a websocket connection driven by a background worker.
///
/// Dropping every handle closes the socket.
#[derive(Debug)]
pub struct WsConnection {
    shared: Arc<Shared>,
    start: Mutex<Option<oneshot::Sender<()>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl WsConnection {
    /// Whether the background worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl Connection for WsConnection {
    fn id(&self) -> Option<String> {
        self.shared
            .id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn open(&self) {
        let start = self
            .start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(start) = start {
            let _ = start.send(());
        }
    }

    fn on(&self, event: &str, handler: Handler) {
        self.shared.listeners.on(event, handler);
    }

    fn once(&self, event: &str, handler: Handler) {
        self.shared.listeners.once(event, handler);
    }

    fn off(&self, event: &str) {
        self.shared.listeners.off(event);
    }

    fn emit(&self, event: &str, payload: Option<Payload>) {
        if self
            .outbound
            .send(Outbound::Emit(Frame::new(event, payload)))
            .is_err()
        {
            debug!(event = "ws_emit_after_close", name = event);
        }
    }

    fn disconnect(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

struct DialTarget {
    url: Url,
    headers: HeaderMap,
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect,
}

async fn connection_worker(
    target: DialTarget,
    options: ConnectOptions,
    shared: Arc<Shared>,
    start_rx: oneshot::Receiver<()>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    if start_rx.await.is_err() {
        debug!(event = "ws_connection_never_opened", url = %target.url);
        return;
    }

    let mut pending = VecDeque::new();
    let mut failures = 0usize;

    loop {
        match run_connected_session(&target, &options, &shared, &mut outbound_rx, &mut pending)
            .await
        {
            Ok(SessionOutcome::GracefulShutdown) => {
                end_session(&shared, CLIENT_DISCONNECT_REASON);
                break;
            }
            Ok(SessionOutcome::Reconnect) => {
                end_session(&shared, TRANSPORT_CLOSE_REASON);
                failures = 0;
            }
            Err(err) => {
                failures += 1;
                warn!(event = "ws_dial_failed", url = %target.url, failures, error = %err);
            }
        }

        if !options.reconnect.allows_attempt(failures) || outbound_rx.is_closed() {
            debug!(event = "ws_worker_stopped", url = %target.url, failures);
            break;
        }

        let delay = options.reconnect.delay_for_attempt(failures.max(1));
        if !collect_frames_during_delay(delay, &mut outbound_rx, &mut pending).await {
            break;
        }
    }
}

fn end_session(shared: &Shared, reason: &str) {
    shared.set_id(None);
    debug!(event = "ws_session_closed", reason);
    shared
        .listeners
        .dispatch(DISCONNECT_EVENT, &Payload::String(reason.to_string()));
}

async fn run_connected_session(
    target: &DialTarget,
    options: &ConnectOptions,
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    pending: &mut VecDeque<Frame>,
) -> Result<SessionOutcome, TransportError> {
    let mut request = target.url.as_str().into_client_request()?;
    request.headers_mut().extend(target.headers.clone());

    let (mut socket, response) =
        match tokio::time::timeout(options.connect_timeout, connect_async(request)).await {
            Ok(dialed) => dialed?,
            Err(_) => return Err(TransportError::Timeout(options.connect_timeout)),
        };

    let id = response
        .headers()
        .get(CONNECTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    debug!(event = "ws_session_open", url = %target.url, id = ?id);
    shared.set_id(id);
    shared.listeners.dispatch(CONNECT_EVENT, &Payload::Null);

    while let Some(next) = pending.pop_front() {
        if send_frame(&mut socket, &next).await.is_err() {
            pending.push_front(next);
            return Ok(SessionOutcome::Reconnect);
        }
    }

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(Outbound::Emit(frame)) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            pending.push_front(frame);
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = socket.close(None).await;
                        return Ok(SessionOutcome::GracefulShutdown);
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => match Frame::from_text(text.as_str()) {
                        Ok(frame) => {
                            let event = frame.event.clone();
                            shared.listeners.dispatch(&event, &frame.into_payload());
                        }
                        Err(err) => warn!(event = "ws_frame_undecodable", error = %err),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return Ok(SessionOutcome::Reconnect),
                    Some(Ok(_)) => debug!(event = "ws_frame_ignored"),
                    Some(Err(_)) | None => return Ok(SessionOutcome::Reconnect),
                }
            }
        }
    }
}

async fn send_frame<S>(socket: &mut S, frame: &Frame) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = frame.to_text()?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn collect_frames_during_delay(
    delay: Duration,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    pending: &mut VecDeque<Frame>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(Outbound::Emit(frame)) => pending.push_back(frame),
                    Some(Outbound::Close) | None => return false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{handshake_headers, websocket_url, API_KEY_HEADER};
    use crate::transport::{ConnectOptions, Connector, TransportError};

    #[test]
    fn http_addresses_map_to_websocket_schemes() {
        assert_eq!(
            websocket_url("http://localhost:5000").expect("url").as_str(),
            "ws://localhost:5000/"
        );
        assert_eq!(
            websocket_url("https://example.com/live").expect("url").as_str(),
            "wss://example.com/live"
        );
        assert_eq!(
            websocket_url("ws://127.0.0.1:9/socket").expect("url").as_str(),
            "ws://127.0.0.1:9/socket"
        );
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(matches!(
            websocket_url("test://host"),
            Err(TransportError::InvalidAddress { .. })
        ));
        assert!(websocket_url("not an address").is_err());
    }

    #[test]
    fn api_key_and_extra_headers_are_sent() {
        let options = ConnectOptions::default()
            .with_api_key(SecretString::from("secret-key"))
            .with_header("x-client", "tests");
        let headers = handshake_headers(&options).expect("headers");
        assert_eq!(
            headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()),
            Some("secret-key")
        );
        assert_eq!(
            headers.get("x-client").and_then(|v| v.to_str().ok()),
            Some("tests")
        );
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let options = ConnectOptions::default().with_header("bad header", "x");
        assert!(matches!(
            handshake_headers(&options),
            Err(TransportError::InvalidHeader(_))
        ));
    }

    #[test]
    fn connecting_outside_a_runtime_fails() {
        let result = super::WsConnector::new()
            .connect("ws://127.0.0.1:9", &ConnectOptions::default());
        assert!(matches!(result, Err(TransportError::NoRuntime)));
    }
}
