//! Event subscriptions with bounded per-subscriber queues.
//!
//! The registry enqueues without blocking; each subscriber drains its own
//! queue at its own pace. Overflow drops the oldest event and bumps
//! `mesh_events_dropped_total` for that subscriber.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use mesh_core::{metrics, RegistryEvent};

/// Which events a subscriber wants.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one service; `None` receives every service.
    pub service: Option<String>,
    /// Restrict to event types (`registered`, `status_changed`, ...);
    /// empty receives every type.
    pub event_types: BTreeSet<String>,
}

impl EventFilter {
    #[must_use]
    pub fn for_service(service: &str) -> Self {
        Self {
            service: Some(service.to_string()),
            event_types: BTreeSet::new(),
        }
    }

    fn matches(&self, event: &RegistryEvent) -> bool {
        if let Some(service) = &self.service {
            if event.service() != Some(service.as_str()) {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(event.event_type()) {
            return false;
        }
        true
    }
}

/// Bounded FIFO owned by one subscriber.
struct SubQueue {
    events: Mutex<VecDeque<RegistryEvent>>,
    notify: Notify,
    closed: AtomicBool,
    bound: usize,
}

impl SubQueue {
    fn push(&self, subscriber_id: &str, event: RegistryEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut events = self.events.lock();
        events.push_back(event);
        if events.len() > self.bound {
            events.pop_front();
            metrics::EVENTS_DROPPED_TOTAL
                .with_label_values(&[subscriber_id])
                .inc();
        }
        drop(events);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct SubscriberEntry {
    filter: EventFilter,
    queue: Arc<SubQueue>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    queue: Arc<SubQueue>,
    hub: Weak<HubInner>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive the next event, in publish order for this subscriber.
    /// Returns `None` once unsubscribed.
    pub async fn recv(&self) -> Option<RegistryEvent> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut events = self.queue.events.lock();
                if let Some(event) = events.pop_front() {
                    return Some(event);
                }
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Drain without waiting. Useful for tests and polling consumers.
    #[must_use]
    pub fn try_recv(&self) -> Option<RegistryEvent> {
        self.queue.events.lock().pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.remove(&self.id);
        }
    }
}

struct HubInner {
    subscribers: DashMap<String, SubscriberEntry>,
    bound: usize,
}

/// Fan-out hub for registry events.
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    #[must_use]
    pub fn new(queue_bound: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: DashMap::new(),
                bound: queue_bound,
            }),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = format!("sub_{}", nanoid::nanoid!(8));
        let queue = Arc::new(SubQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            bound: self.inner.bound,
        });
        self.inner.subscribers.insert(
            id.clone(),
            SubscriberEntry {
                filter,
                queue: queue.clone(),
            },
        );
        Subscription {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        if let Some((_, entry)) = self.inner.subscribers.remove(subscription_id) {
            entry.queue.close();
        }
    }

    /// Enqueue `event` for every matching subscriber. Never blocks.
    pub fn publish(&self, event: &RegistryEvent) {
        for entry in self.inner.subscribers.iter() {
            if entry.filter.matches(event) {
                entry.queue.push(entry.key(), event.clone());
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mesh_core::ServiceStatus;

    fn registered(service: &str, id: &str) -> RegistryEvent {
        RegistryEvent::Registered {
            service: service.to_string(),
            instance_id: id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive_in_order() {
        let hub = EventHub::new(16);
        let sub = hub.subscribe(EventFilter::default());

        hub.publish(&registered("auth", "a1"));
        hub.publish(&registered("auth", "a2"));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.instance_id(), Some("a1"));
        assert_eq!(second.instance_id(), Some("a2"));
    }

    #[tokio::test]
    async fn test_service_filter() {
        let hub = EventHub::new(16);
        let sub = hub.subscribe(EventFilter::for_service("billing"));

        hub.publish(&registered("auth", "a1"));
        hub.publish(&registered("billing", "b1"));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.service(), Some("billing"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_event_type_filter() {
        let hub = EventHub::new(16);
        let mut filter = EventFilter::default();
        filter.event_types.insert("status_changed".to_string());
        let sub = hub.subscribe(filter);

        hub.publish(&registered("auth", "a1"));
        hub.publish(&RegistryEvent::StatusChanged {
            service: "auth".to_string(),
            instance_id: "a1".to_string(),
            from: ServiceStatus::Starting,
            to: ServiceStatus::Running,
            timestamp: Utc::now(),
        });

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type(), "status_changed");
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let hub = EventHub::new(2);
        let sub = hub.subscribe(EventFilter::default());

        hub.publish(&registered("auth", "a1"));
        hub.publish(&registered("auth", "a2"));
        hub.publish(&registered("auth", "a3"));

        // a1 was dropped; a2 and a3 survive in order.
        assert_eq!(sub.recv().await.unwrap().instance_id(), Some("a2"));
        assert_eq!(sub.recv().await.unwrap().instance_id(), Some("a3"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let hub = EventHub::new(16);
        let sub = hub.subscribe(EventFilter::default());
        let id = sub.id().to_string();

        hub.unsubscribe(&id);
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_removes_subscriber() {
        let hub = EventHub::new(16);
        {
            let _sub = hub.subscribe(EventFilter::default());
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }
}
