//! In-process publish/subscribe with filtered subscriptions.
//!
//! Publishers are never blocked: each subscription owns a bounded channel
//! and events are dropped per-subscriber (with a warning) when a buffer is
//! full. Delivery order per subscriber matches publish order; each event is
//! seen at most once.

mod event;
mod filter;

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::BusError;

pub use event::{AlertSeverity, Event, EventPayload, EventType};
pub use filter::EventFilter;

/// Default per-subscription buffer capacity.
pub const DEFAULT_BUFFER: usize = 100;

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

struct Registry {
    subscribers: HashMap<Uuid, Subscriber>,
    closed: bool,
}

/// The event bus. Readers (publishers) share the lock; subscribe,
/// unsubscribe and close take it exclusively.
pub struct EventBus {
    registry: RwLock<Registry>,
    buffer: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: RwLock::new(Registry {
                subscribers: HashMap::new(),
                closed: false,
            }),
            buffer: buffer.max(1),
        }
    }

    /// Deliver `event` to every matching subscriber, best-effort.
    ///
    /// A subscriber with a full buffer misses this event; the publisher is
    /// never blocked.
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        let registry = self.read();
        if registry.closed {
            return Err(BusError::Closed);
        }
        for (id, subscriber) in &registry.subscribers {
            if !subscriber.filter.matches(&event) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.tx.try_send(event.clone()) {
                tracing::warn!(
                    subscription = %id,
                    event_type = ?event.event_type,
                    "Subscriber buffer full, dropping event"
                );
            }
        }
        Ok(())
    }

    /// Publish a batch, best-effort. Returns the first error but does not
    /// undo deliveries already made.
    pub fn publish_batch(&self, events: impl IntoIterator<Item = Event>) -> Result<(), BusError> {
        for event in events {
            self.publish(event)?;
        }
        Ok(())
    }

    /// Register a subscription; returns the event stream and its id.
    pub fn subscribe(
        &self,
        filter: EventFilter,
    ) -> Result<(ReceiverStream<Event>, Uuid), BusError> {
        let mut registry = self.write();
        if registry.closed {
            return Err(BusError::Closed);
        }
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        registry.subscribers.insert(id, Subscriber { filter, tx });
        Ok((ReceiverStream::new(rx), id))
    }

    /// Remove a subscription and close its stream.
    pub fn unsubscribe(&self, id: Uuid) {
        self.write().subscribers.remove(&id);
    }

    /// Close the bus: drops every subscription. Idempotent; publishing to a
    /// closed bus errors.
    pub fn close(&self) {
        let mut registry = self.write();
        registry.closed = true;
        registry.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().subscribers.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        match self.registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
