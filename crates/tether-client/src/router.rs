//! Inbound message routing and the subscription registry.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tether_proto::Envelope;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::correlator::{RequestCorrelator, Resolution};
use crate::events::{ClientEvent, EventKind};

/// Subscriber callback.
pub type EventCallback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event of a kind. `Event(EventKind::Message)` sees all routed messages.
    Event(EventKind),
    /// Routed messages of one envelope type.
    MessageType(String),
}

impl Topic {
    /// Messages of the given envelope type.
    #[must_use]
    pub fn message_type(kind: impl Into<String>) -> Self {
        Self::MessageType(kind.into())
    }
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Self::Event(kind)
    }
}

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// What happened to an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// The frame was not a valid envelope and was dropped.
    Malformed,
    /// The frame completed a pending request.
    Correlated {
        /// Correlation id.
        request_id: String,
    },
    /// The frame was broadcast to subscribers.
    Broadcast {
        /// Envelope type.
        kind: String,
        /// Callbacks that ran to completion.
        delivered: usize,
    },
}

/// Subscriptions received as a channel instead of a callback.
#[derive(Debug)]
pub struct EventStream {
    ids: Vec<SubscriptionId>,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl EventStream {
    /// Next event, or `None` once every subscription feeding it is gone.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.rx.try_recv().ok()
    }

    /// Subscriptions feeding this stream.
    #[must_use]
    pub fn subscription_ids(&self) -> &[SubscriptionId] {
        &self.ids
    }
}

/// Classifies inbound frames and fans events out to subscribers.
pub struct EventRouter {
    correlator: RequestCorrelator,
    subscriptions: RwLock<HashMap<Topic, Vec<(SubscriptionId, EventCallback)>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("correlator", &self.correlator)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl EventRouter {
    /// Create a router that offers replies to `correlator` first.
    #[must_use]
    pub fn new(correlator: RequestCorrelator) -> Self {
        Self {
            correlator,
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for `topic`. Callbacks of one topic run in
    /// registration order.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .entry(topic.into())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Feed every event of the given topics into one channel.
    ///
    /// The subscriptions outlive the stream: dropping it only closes the
    /// channel. Hand the stream to [`EventRouter::close_stream`] to remove them.
    pub fn subscribe_channel<I>(&self, topics: I) -> EventStream
    where
        I: IntoIterator,
        I::Item: Into<Topic>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = topics
            .into_iter()
            .map(|topic| {
                let tx = tx.clone();
                self.subscribe(topic, move |event| {
                    let _ = tx.send(event.clone());
                })
            })
            .collect();
        EventStream { ids, rx }
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let mut found = false;
        subscriptions.retain(|_, callbacks| {
            let before = callbacks.len();
            callbacks.retain(|(sub_id, _)| *sub_id != id);
            found |= callbacks.len() != before;
            !callbacks.is_empty()
        });
        found
    }

    /// Remove every subscription feeding `stream`. Returns how many were removed.
    pub fn close_stream(&self, stream: EventStream) -> usize {
        stream
            .ids
            .iter()
            .filter(|id| self.unsubscribe(**id))
            .count()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().values().map(Vec::len).sum()
    }

    /// Route one inbound text frame.
    ///
    /// Correlated replies go only to the correlator. Everything else is
    /// broadcast to the envelope type's subscribers, then to `Message` subscribers.
    pub fn on_message(&self, raw: &str) -> Routed {
        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed gateway message");
                return Routed::Malformed;
            }
        };

        let request_id = envelope.request_id().map(str::to_owned);
        let envelope = match self.correlator.resolve(envelope) {
            Resolution::Resolved => {
                return Routed::Correlated {
                    request_id: request_id.unwrap_or_default(),
                };
            }
            Resolution::Stale(envelope) | Resolution::Unclaimed(envelope) => envelope,
        };

        let kind = envelope.kind.clone();
        let delivered = self.emit(ClientEvent::Message(envelope));
        Routed::Broadcast { kind, delivered }
    }

    /// Deliver `event` to its subscribers. Returns how many callbacks completed.
    ///
    /// A panicking callback is logged and skipped; the rest still run.
    pub fn emit(&self, event: ClientEvent) -> usize {
        let callbacks = self.callbacks_for(&event);
        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    warn!(
                        subscription = id.0,
                        kind = ?event.kind(),
                        panic = %panic_message(panic.as_ref()),
                        "subscriber panicked"
                    );
                }
            }
        }
        debug!(kind = ?event.kind(), delivered, "event dispatched");
        delivered
    }

    fn callbacks_for(&self, event: &ClientEvent) -> Vec<(SubscriptionId, EventCallback)> {
        let subscriptions = self.subscriptions.read();
        let mut callbacks = Vec::new();
        if let ClientEvent::Message(envelope) = event {
            if let Some(list) = subscriptions.get(&Topic::MessageType(envelope.kind.clone())) {
                callbacks.extend(list.iter().cloned());
            }
        }
        if let Some(list) = subscriptions.get(&Topic::Event(event.kind())) {
            callbacks.extend(list.iter().cloned());
        }
        callbacks
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic".to_string())
}
