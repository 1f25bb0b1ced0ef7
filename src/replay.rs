//! Single-slot replay stream.
//!
//! A [`ReplayStream`] caches the last published value. Every new
//! [`Subscription`] receives that cached value first (if one exists) and then
//! every later value in publish order. Publishing and subscribing take the
//! same lock, so a subscriber never misses or duplicates a value published
//! concurrently with its subscription.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

struct ReplayState<T> {
    latest: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

/// Cloneable handle to a replay stream; clones share the cache and the
/// subscriber list.
pub struct ReplayStream<T> {
    state: Arc<Mutex<ReplayState<T>>>,
}

impl<T: Clone> ReplayStream<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplayState {
                latest: None,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Caches `value` and delivers it to every live subscriber.
    pub fn publish(&self, value: T) {
        let mut state = self.lock();
        state
            .subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
        state.latest = Some(value);
    }

    /// Opens a subscription, primed with the cached value when there is one.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if let Some(latest) = &state.latest {
            let _ = tx.send(latest.clone());
        }
        state.subscribers.retain(|subscriber| !subscriber.is_closed());
        state.subscribers.push(tx);
        Subscription { rx }
    }

    /// Last published value.
    pub fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    /// Number of subscriptions that are still open.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|subscriber| !subscriber.is_closed());
        state.subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for ReplayStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ReplayStream<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReplayStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ReplayStream")
            .field("latest", &state.latest)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

/// Receiving side of a [`ReplayStream`].
///
/// Ends once every handle to the stream has been dropped.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Waits for the next value.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns the next value if one is already buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
