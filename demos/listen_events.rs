use std::error::Error;
use std::sync::Arc;

use futures_util::StreamExt;
use socket_events::channel::{EventChannel, EventSpec};
use socket_events::manager::ConnectionManager;
use socket_events::transport::ConnectOptions;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:5000".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let manager = ConnectionManager::websocket();
        let streams = manager.listen([EventSpec::from("message"), EventSpec::once("welcome")]);
        let status = manager.listen_to_event(Arc::new(
            EventChannel::new("status").with_initial_state(serde_json::json!({"state": "idle"})),
        ));
        status.set_on_update(|payload| println!("status update {payload}"));

        manager.connect(Some(&address), false, &ConnectOptions::default())?;

        let mut states = manager.subscribe();
        let mut messages = streams[0].subscribe();
        let mut welcome = streams[1].subscribe();

        loop {
            tokio::select! {
                Some(state) = states.next() => {
                    println!("connected={} id={:?}", state.connected, state.id);
                    if state.connected {
                        manager.emit("hello", Some(serde_json::json!({"client": "listen_events"})));
                    }
                }
                Some(payload) = welcome.next() => println!("welcome {payload}"),
                Some(payload) = messages.next() => {
                    println!("message {payload}");
                    if payload == serde_json::json!("bye") {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        manager.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
