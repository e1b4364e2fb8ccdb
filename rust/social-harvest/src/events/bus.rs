//! Topic-keyed publish/subscribe bus.
//!
//! Fans harvested records out to any number of concurrent consumers:
//! storage workers and live stream clients.
//!
//! # Architecture
//!
//! ```text
//! Harvest adapter → EventBus::publish(topic, event) → [Subscription 1, Subscription 2, ...]
//!                                                          ↓                ↓
//!                                                   storage worker    stream bridge
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use social_harvest::events::EventBus;
//!
//! let bus = EventBus::new();
//! let mut sub = bus.subscribe("harvest.records");
//!
//! bus.publish("harvest.records", event);
//!
//! if let Some(envelope) = sub.recv().await {
//!     println!("{}: {:?}", envelope.topic, envelope.event);
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Default per-subscriber buffer size.
///
/// A subscriber that falls further behind than this loses new events; see
/// [`EventBus`] for the backpressure policy.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Subscription identifier.
pub type SubscriptionId = Uuid;

/// An event as delivered to a subscriber, tagged with the topic it was
/// published on.
#[derive(Debug)]
pub struct Envelope<E> {
    /// Topic the event was published on.
    pub topic: Arc<str>,
    /// The published event, shared between all subscribers.
    pub event: Arc<E>,
}

impl<E> Clone for Envelope<E> {
    fn clone(&self) -> Self {
        Self {
            topic: Arc::clone(&self.topic),
            event: Arc::clone(&self.event),
        }
    }
}

/// Result of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Subscribers that accepted the event.
    pub delivered: usize,
    /// Subscribers whose buffer was full.
    pub dropped: usize,
}

/// Registration held by the bus for one subscription on one topic.
struct Subscriber<E> {
    id: SubscriptionId,
    sender: mpsc::Sender<Envelope<E>>,
    dropped: Arc<AtomicU64>,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

type Registry<E> = Mutex<HashMap<Arc<str>, Vec<Subscriber<E>>>>;

/// Event bus for harvested records.
///
/// # Thread Safety
///
/// One `parking_lot::Mutex` guards the topic → subscribers map. Publishing
/// holds it while handing the event to every subscriber of the topic, so all
/// subscribers observe publishes on a topic in the same order. The lock is
/// never held across an `.await`.
///
/// # Backpressure
///
/// Every subscription has its own bounded buffer. When it is full the **new
/// event is dropped for that subscriber only**: the publisher never blocks,
/// other subscribers still receive it, and the loss is counted in
/// [`Subscription::dropped`] and [`PublishReport::dropped`].
pub struct EventBus<E> {
    registry: Arc<Registry<E>>,
    capacity: usize,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            capacity: self.capacity,
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.registry.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<E: Send + Sync + 'static> EventBus<E> {
    /// Create a new event bus with the default subscriber buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a new event bus whose subscribers buffer `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to one topic.
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe(&self, topic: &str) -> Subscription<E> {
        self.register([topic], self.capacity)
    }

    /// Subscribe to one topic with its own buffer size instead of the bus
    /// default.
    ///
    /// For consumers that must absorb bursts the default buffer would drop.
    pub fn subscribe_with_capacity(&self, topic: &str, capacity: usize) -> Subscription<E> {
        self.register([topic], capacity.max(1))
    }

    /// Subscribe to several topics through one buffer.
    ///
    /// Deliveries carry their topic in the [`Envelope`], so the subscriber
    /// can tell the streams apart.
    pub fn subscribe_many<I, T>(&self, topics: I) -> Subscription<E>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.register(topics, self.capacity)
    }

    fn register<I, T>(&self, topics: I, capacity: usize) -> Subscription<E>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let (sender, receiver) = mpsc::channel(capacity);
        let id = Uuid::new_v4();
        let dropped = Arc::new(AtomicU64::new(0));

        let mut topics: Vec<Arc<str>> = topics
            .into_iter()
            .map(|topic| Arc::from(topic.as_ref()))
            .collect();
        topics.sort();
        topics.dedup();

        {
            let mut registry = self.registry.lock();
            for topic in &topics {
                registry
                    .entry(Arc::clone(topic))
                    .or_default()
                    .push(Subscriber {
                        id,
                        sender: sender.clone(),
                        dropped: Arc::clone(&dropped),
                    });
            }
        }

        tracing::debug!(subscription_id = %id, topics = ?topics, capacity, "Subscribed");

        Subscription {
            id,
            topics,
            receiver,
            dropped,
            created_at: Utc::now(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Publish an event to every current subscriber of `topic`.
    ///
    /// Never blocks. Returns how many subscribers accepted the event and how
    /// many had a full buffer.
    pub fn publish(&self, topic: &str, event: E) -> PublishReport {
        let event = Arc::new(event);
        let mut report = PublishReport::default();

        let registry = self.registry.lock();
        let Some((topic, subscribers)) = registry.get_key_value(topic) else {
            return report;
        };

        for subscriber in subscribers {
            let envelope = Envelope {
                topic: Arc::clone(topic),
                event: Arc::clone(&event),
            };
            match subscriber.sender.try_send(envelope) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                    report.dropped += 1;
                }
                // Receiver is being dropped; its guard removes the registration.
                Err(TrySendError::Closed(_)) => {}
            }
        }

        if report.dropped > 0 {
            tracing::warn!(
                topic = %topic,
                dropped = report.dropped,
                delivered = report.delivered,
                "Subscriber buffer full, event dropped"
            );
        }

        report
    }

    /// Remove a subscription from every topic it was registered on.
    ///
    /// Returns `false` if it was not registered. Buffered events can still be
    /// drained from the [`Subscription`].
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        remove_subscriber(&self.registry, id)
    }

    /// Number of subscribers registered on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.lock().get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one subscriber.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .registry
            .lock()
            .keys()
            .map(ToString::to_string)
            .collect();
        topics.sort();
        topics
    }
}

impl<E: Send + Sync + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscriber<E>(registry: &Registry<E>, id: SubscriptionId) -> bool {
    let mut registry = registry.lock();
    let mut removed = false;
    registry.retain(|_, subscribers| {
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        removed |= subscribers.len() != before;
        !subscribers.is_empty()
    });
    removed
}

/// Receiving side of a bus subscription.
///
/// Owned by the consumer. Dropping it (or calling
/// [`unsubscribe`](Self::unsubscribe)) removes its registration from the bus.
pub struct Subscription<E> {
    id: SubscriptionId,
    topics: Vec<Arc<str>>,
    receiver: mpsc::Receiver<Envelope<E>>,
    dropped: Arc<AtomicU64>,
    created_at: DateTime<Utc>,
    registry: Weak<Registry<E>>,
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .field("created_at", &self.created_at)
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl<E> Subscription<E> {
    /// Subscription ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topics this subscription listens on.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(AsRef::as_ref)
    }

    /// When the subscription was registered.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Events lost because this subscription's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription is unregistered (or the bus is
    /// gone) and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Envelope<E>> {
        self.receiver.recv().await
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope<E>> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly unregister from the bus.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if remove_subscriber(&registry, self.id) {
                tracing::debug!(subscription_id = %self.id, "Unsubscribed");
            }
        }
        self.registry = Weak::new();
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.detach();
    }
}
