//! Lifecycle event delivery.
//!
//! Components report what happened by firing an [`EventKind`] with a
//! payload; the embedding application registers at most one callback per
//! kind. Delivery is fire-and-forget:
//!
//! - `fire` never blocks and never fails. Kinds nobody listens to are dropped.
//! - Events reach callbacks in the order they were fired, from a single
//!   delivery task.
//! - A callback that panics is logged and forgotten; the component that
//!   fired the event never notices.
//!
//! Every payload carries a `source` entry naming the emitting session.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{trace, warn};

#[cfg(feature = "serialization")]
use serde::Serialize;

use crate::{EventKind, PayloadValue, SourceId};

pub const SOURCE_KEY: &str = "source";

pub type Payload = BTreeMap<String, PayloadValue>;

/// Builds a payload from `key => value` pairs.
#[macro_export]
macro_rules! payload {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut payload = $crate::event_system::Payload::new();
        $(
            payload.insert(($key).to_string(), $crate::PayloadValue::from($value));
        )*
        payload
    }};
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub struct Event {
    pub kind: EventKind,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn source(&self) -> Option<&str> {
        self.get_str(SOURCE_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.payload.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PayloadValue::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(PayloadValue::as_int)
    }

    #[cfg(feature = "serialization")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub type SyncCallback = Arc<dyn Fn(&Event) + Send + Sync>;
pub type AsyncCallback = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Callback {
    Sync(SyncCallback),
    Async(AsyncCallback),
}

type CallbackMap = Arc<RwLock<HashMap<EventKind, Callback>>>;

// Event dispatcher
pub struct EventDispatcher {
    source: SourceId,
    callbacks: CallbackMap,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl EventDispatcher {
    /// Creates the dispatcher and spawns its delivery task on the current
    /// tokio runtime.
    pub fn new(source: SourceId) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let callbacks: CallbackMap = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(run_delivery(callbacks.clone(), event_rx));

        Arc::new(EventDispatcher {
            source,
            callbacks,
            event_tx,
        })
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Registers the callback for `kind`, replacing any previous one.
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.set(kind, Callback::Sync(Arc::new(callback)));
    }

    /// Registers an async callback for `kind`, replacing any previous one.
    /// Each invocation runs as its own task.
    pub fn on_async<F, Fut>(&self, kind: EventKind, callback: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: AsyncCallback = Arc::new(move |event| callback(event).boxed());
        self.set(kind, Callback::Async(wrapped));
    }

    /// Removes the callback for `kind`. Returns whether one was registered.
    pub fn off(&self, kind: EventKind) -> bool {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .is_some()
    }

    pub fn has_callback(&self, kind: EventKind) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    pub fn fire(&self, kind: EventKind) {
        self.fire_with(kind, Payload::new());
    }

    pub fn fire_with(&self, kind: EventKind, mut payload: Payload) {
        if !self.has_callback(kind) {
            trace!(event = %kind, "no callback registered");
            return;
        }

        payload.insert(SOURCE_KEY.to_string(), PayloadValue::from(self.source.0.as_str()));
        let event = Event {
            kind,
            payload,
            timestamp: Utc::now(),
        };

        if self.event_tx.send(event).is_err() {
            trace!(event = %kind, "delivery task gone, event dropped");
        }
    }

    fn set(&self, kind: EventKind, callback: Callback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, callback);
    }
}

async fn run_delivery(callbacks: CallbackMap, mut event_rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = event_rx.recv().await {
        let callback = callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind)
            .cloned();

        let kind = event.kind;
        match callback {
            Some(Callback::Sync(callback)) => {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    warn!(event = %kind, "event callback panicked");
                }
            }
            Some(Callback::Async(callback)) => {
                tokio::spawn(async move {
                    let delivery = AssertUnwindSafe(async move { callback(event).await });
                    if delivery.catch_unwind().await.is_err() {
                        warn!(event = %kind, "async event callback panicked");
                    }
                });
            }
            // Unregistered between fire and delivery.
            None => {}
        }
    }
}
