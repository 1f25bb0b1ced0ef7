use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::transport::{Handler, Payload};

struct Listener {
    handler: Handler,
    once: bool,
}

/// Handler table keyed by event name.
///
/// `once` handlers are removed before they run, so a handler that re-installs
/// itself from inside its own callback is not dropped. Handlers are invoked
/// with no lock held.
#[derive(Default)]
pub struct Listeners {
    table: Mutex<HashMap<String, Vec<Listener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, handler: Handler) {
        self.insert(event, handler, false);
    }

    pub fn once(&self, event: &str, handler: Handler) {
        self.insert(event, handler, true);
    }

    pub fn off(&self, event: &str) {
        self.lock().remove(event);
    }

    /// Number of handlers currently installed for `event`.
    pub fn count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    /// Delivers `payload` to every handler installed for `event` and returns
    /// how many ran.
    pub fn dispatch(&self, event: &str, payload: &Payload) -> usize {
        let handlers: Vec<Handler> = {
            let mut table = self.lock();
            let Some(entries) = table.get_mut(event) else {
                return 0;
            };
            let handlers = entries
                .iter()
                .map(|listener| listener.handler.clone())
                .collect();
            entries.retain(|listener| !listener.once);
            if entries.is_empty() {
                table.remove(event);
            }
            handlers
        };

        for handler in &handlers {
            handler(payload.clone());
        }
        handlers.len()
    }

    fn insert(&self, event: &str, handler: Handler, once: bool) {
        self.lock()
            .entry(event.to_string())
            .or_default()
            .push(Listener { handler, once });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Listener>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.lock();
        let mut map = f.debug_map();
        for (event, entries) in table.iter() {
            map.entry(event, &entries.len());
        }
        map.finish()
    }
}
