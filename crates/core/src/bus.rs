//! In-process event bus.
//!
//! Publishing is synchronous and never blocks: the bus stamps the event with
//! the next sequence number and pushes it into the FIFO of every subscriber
//! whose filter matches, in registration order. Each handler subscriber is
//! drained by its own task, so a subscriber always observes its matching
//! events in publish order, and a slow or failing handler cannot hold up
//! delivery to anyone else.

use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{BusError, Result};
use crate::event::{Event, EventFilter};
use crate::message::{Message, NodeId};

/// Identifier returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

/// A bus subscriber.
///
/// Errors and panics are caught at the bus boundary and logged.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler(f)
}

struct Subscriber {
    id: SubscriptionId,
    name: String,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Message>,
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to a shared bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.subscriber_count())
            .field("last_sequence", &self.last_sequence())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                sequence: AtomicU64::new(0),
                next_subscription: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn register(
        &self,
        name: &str,
        filter: EventFilter,
    ) -> std::result::Result<(SubscriptionId, mpsc::UnboundedReceiver<Message>), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(Subscriber {
            id,
            name: name.to_string(),
            filter,
            tx,
        });
        debug!(subscriber = %name, id, "Subscribed to bus");
        Ok((id, rx))
    }

    /// Register a handler. Must be called from within a Tokio runtime.
    pub fn subscribe<H: EventHandler>(
        &self,
        name: impl Into<String>,
        filter: impl Into<EventFilter>,
        handler: H,
    ) -> std::result::Result<SubscriptionId, BusError> {
        let name = name.into();
        let (id, mut rx) = self.register(&name, filter.into())?;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let seq = message.id;
                match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(subscriber = %name, seq, error = %e, "Event handler failed");
                    }
                    Err(_) => {
                        error!(subscriber = %name, seq, "Event handler panicked");
                    }
                }
            }
            debug!(subscriber = %name, "Bus subscriber drained");
        });

        Ok(id)
    }

    /// Register a plain FIFO receiver instead of a handler.
    pub fn subscribe_channel(
        &self,
        name: impl Into<String>,
        filter: impl Into<EventFilter>,
    ) -> std::result::Result<(SubscriptionId, mpsc::UnboundedReceiver<Message>), BusError> {
        self.register(&name.into(), filter.into())
    }

    /// Remove a subscriber. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> std::result::Result<(), BusError> {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() == before {
            return Err(BusError::UnknownSubscription(id));
        }
        debug!(id, "Unsubscribed from bus");
        Ok(())
    }

    /// Publish an event on behalf of `source`.
    ///
    /// Delivery is to subscribers registered at the time of the call; there is
    /// no replay for later subscribers.
    pub fn publish(
        &self,
        source: &NodeId,
        event: Event,
    ) -> std::result::Result<Message, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        // The lock spans sequencing and fan-out so every subscriber sees one total order.
        let subscribers = self.subscribers();
        let id = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = Message::new(id, source.clone(), event);

        let mut delivered = 0usize;
        for subscriber in subscribers.iter() {
            if !subscriber.filter.matches(&message.event) {
                continue;
            }
            if subscriber.tx.send(message.clone()).is_err() {
                debug!(subscriber = %subscriber.name, seq = id, "Subscriber receiver dropped");
            } else {
                delivered += 1;
            }
        }
        drop(subscribers);

        debug!(
            seq = id,
            source = %message.source,
            kind = %message.kind(),
            delivered,
            "Published event"
        );
        Ok(message)
    }

    /// Stop accepting publishes and drop every subscriber.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = std::mem::take(&mut *self.subscribers());
        debug!(subscribers = dropped.len(), "Bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Sequence number of the most recent publish (0 if none).
    pub fn last_sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }
}
