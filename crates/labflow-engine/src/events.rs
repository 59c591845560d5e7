//! In-process publish/subscribe keyed by event name.
//!
//! `emit` calls every handler subscribed to the name, in subscription order,
//! on the caller's task. The subscriber list is snapshotted before dispatch,
//! so handlers may emit further events or change subscriptions; a change made
//! during dispatch takes effect from the next emission.
//!
//! Every emission is also pushed onto a bounded broadcast feed for streaming
//! observers that do not want to register a callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use labflow_types::ExecutionContext;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

/// Callback invoked with the event name and its context.
pub type EventHandler = Arc<dyn Fn(&str, &ExecutionContext) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One emission as seen on the feed.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub name: String,
    pub context: ExecutionContext,
    pub emitted_at: DateTime<Utc>,
}

struct Subscriber {
    id: SubscriptionId,
    handler: EventHandler,
}

/// Event bus shared by everything the engine runs.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    feed: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            feed,
        }
    }

    /// Register a handler for `name`. Handlers run in the order they subscribed.
    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &ExecutionContext) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        tracing::trace!(event = %name, subscription = id.0, "subscribe");
        self.subscribers
            .write()
            .entry(name)
            .or_default()
            .push(Subscriber {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver an event to every current subscriber of `name`.
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, name: &str, context: &ExecutionContext) -> usize {
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .get(name)
            .map(|list| list.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();

        tracing::trace!(event = %name, handlers = handlers.len(), "emit");
        for handler in &handlers {
            handler(name, context);
        }

        // No receivers is fine.
        let _ = self.feed.send(BusEvent {
            name: name.to_string(),
            context: context.clone(),
            emitted_at: Utc::now(),
        });

        handlers.len()
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers.read().get(name).map_or(0, Vec::len)
    }

    /// Receive every emission from now on. Slow receivers lag and lose events.
    pub fn feed(&self) -> broadcast::Receiver<BusEvent> {
        self.feed.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_in_subscription_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe("thread.COMPLETED", move |_, _| seen.lock().push(i));
        }
        assert_eq!(bus.emit("thread.COMPLETED", &ExecutionContext::new()), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_emit_only_matching_name() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        bus.subscribe("a", move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.emit("b", &ExecutionContext::new()), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let id = bus.subscribe("a", |_, _| {});
        assert_eq!(bus.subscriber_count("a"), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count("a"), 0);
    }

    #[test]
    fn test_handler_may_emit_and_subscribe() {
        let bus = Arc::new(EventBus::default());
        let inner_hits = Arc::new(AtomicU64::new(0));

        let hits = Arc::clone(&inner_hits);
        bus.subscribe("inner", move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        let weak = Arc::downgrade(&bus);
        bus.subscribe("outer", move |_, ctx| {
            if let Some(bus) = weak.upgrade() {
                bus.subscribe("late", |_, _| {});
                bus.emit("inner", ctx);
            }
        });

        bus.emit("outer", &ExecutionContext::new());
        assert_eq!(inner_hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("late"), 1);
    }

    #[tokio::test]
    async fn test_feed_receives_emissions() {
        let bus = EventBus::new(8);
        let mut feed = bus.feed();
        bus.emit("workflow.RUNNING", &ExecutionContext::new());
        let event = feed.recv().await.unwrap();
        assert_eq!(event.name, "workflow.RUNNING");
    }
}
