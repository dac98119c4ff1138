//! Process-local live event bus.
//!
//! Independent of durable storage: subscribers register a filter list and a
//! delivery channel, every event accepted by the pipeline is tested against
//! each registered filter, and matching channels get a copy. New subscribers
//! receive no backlog; an end-of-stored acknowledgment is delivered
//! immediately on registration and only future events follow.
//!
//! Both live relay subscriptions and REST streaming endpoints sit on this
//! bus so neither has to re-poll storage per event.

use starling_common::{Event, Filter};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum LiveMessage {
    Event(Arc<Event>),
    /// Registration acknowledgment: no stored events will be replayed.
    EndOfStored,
}

struct Subscriber {
    filters: Vec<Filter>,
    tx: mpsc::Sender<LiveMessage>,
}

type Registry = Arc<RwLock<HashMap<Uuid, Subscriber>>>;

/// The bus. Cheap to clone via `Arc`; locking is a plain `RwLock` held only
/// for map access, never across an await.
#[derive(Default)]
pub struct PubSub {
    subscribers: Registry,
    channel_capacity: usize,
}

impl PubSub {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::default(),
            channel_capacity: 64,
        }
    }

    /// Register a subscriber. The returned handle unsubscribes on drop.
    pub fn subscribe(&self, filters: Vec<Filter>) -> LiveSubscription {
        let (tx, rx) = mpsc::channel(self.channel_capacity.max(1));
        let id = Uuid::new_v4();

        // Capacity is at least one, so the ack always fits.
        let _ = tx.try_send(LiveMessage::EndOfStored);

        self.subscribers
            .write()
            .expect("pubsub registry poisoned")
            .insert(id, Subscriber { filters, tx });

        LiveSubscription {
            id,
            rx,
            registry: Arc::clone(&self.subscribers),
        }
    }

    /// Push an event to every subscriber whose filters match. Slow consumers
    /// lose the message rather than blocking the bus.
    pub fn publish(&self, event: &Arc<Event>) {
        let subscribers = self.subscribers.read().expect("pubsub registry poisoned");
        for (id, subscriber) in subscribers.iter() {
            if subscriber.filters.iter().any(|f| f.matches(event)) {
                if subscriber
                    .tx
                    .try_send(LiveMessage::Event(Arc::clone(event)))
                    .is_err()
                {
                    tracing::debug!(subscriber = %id, event = %event.id, "live delivery dropped");
                }
            }
        }
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .expect("pubsub registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered subscription; dropping it deregisters.
pub struct LiveSubscription {
    id: Uuid,
    rx: mpsc::Receiver<LiveMessage>,
    registry: Registry,
}

impl LiveSubscription {
    /// Next message, or `None` after the bus itself is gone.
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        self.rx.recv().await
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.registry.write() {
            subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, kind: u16) -> Arc<Event> {
        Arc::new(Event {
            id: id.to_string(),
            pubkey: "pk".into(),
            created_at: 100,
            kind,
            tags: vec![],
            content: "hello world".into(),
            sig: "sig".into(),
        })
    }

    #[tokio::test]
    async fn registration_acks_immediately() {
        let bus = PubSub::new();
        let mut sub = bus.subscribe(vec![Filter::new()]);
        assert!(matches!(sub.recv().await, Some(LiveMessage::EndOfStored)));
    }

    #[tokio::test]
    async fn only_matching_subscribers_receive() {
        let bus = PubSub::new();
        let mut kind1 = bus.subscribe(vec![Filter::new().kinds([1])]);
        let mut kind6 = bus.subscribe(vec![Filter::new().kinds([6])]);
        assert!(matches!(kind1.recv().await, Some(LiveMessage::EndOfStored)));
        assert!(matches!(kind6.recv().await, Some(LiveMessage::EndOfStored)));

        bus.publish(&event("e1", 1));

        let LiveMessage::Event(got) = kind1.recv().await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(got.id, "e1");

        // The kind-6 subscriber's queue stays empty.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), kind6.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn no_backlog_for_new_subscribers() {
        let bus = PubSub::new();
        bus.publish(&event("old", 1));

        let mut sub = bus.subscribe(vec![Filter::new()]);
        assert!(matches!(sub.recv().await, Some(LiveMessage::EndOfStored)));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn search_filters_apply_on_the_bus() {
        let bus = PubSub::new();
        let mut sub = bus.subscribe(vec![Filter::new().search("hello")]);
        assert!(matches!(sub.recv().await, Some(LiveMessage::EndOfStored)));

        bus.publish(&event("e1", 1));
        let LiveMessage::Event(got) = sub.recv().await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(got.id, "e1");
    }

    #[tokio::test]
    async fn dropping_the_handle_unsubscribes() {
        let bus = PubSub::new();
        let sub = bus.subscribe(vec![Filter::new()]);
        assert_eq!(bus.len(), 1);
        drop(sub);
        assert_eq!(bus.len(), 0);
    }
}
