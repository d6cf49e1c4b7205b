//! Pending-event queue served to polling distributors.
//!
//! Events are kept in publish order with bounded retention. Consumption is
//! tracked per consumer (integration id): marking an event consumed hides it
//! from that consumer only.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::filter::subject_matches;
use crate::models::EventEnvelope;

/// Default number of events retained before the oldest are dropped
pub const DEFAULT_RETENTION: usize = 1000;

struct QueuedEvent {
    envelope: EventEnvelope,
    consumed_by: HashSet<String>,
}

pub struct EventQueue {
    events: RwLock<VecDeque<QueuedEvent>>,
    retention: usize,
}

impl EventQueue {
    pub fn new(retention: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }

    /// Queue an event, assigning `id` and `time` when missing.
    ///
    /// Publishing an id that is already queued is a no-op.
    pub async fn publish(&self, mut envelope: EventEnvelope) -> String {
        if envelope.id.is_empty() {
            envelope.id = Uuid::new_v4().to_string();
        }
        if envelope.time.is_none() {
            envelope.time = Some(Utc::now());
        }
        let id = envelope.id.clone();

        let mut events = self.events.write().await;
        if events.iter().any(|e| e.envelope.id == id) {
            return id;
        }
        while events.len() >= self.retention {
            if let Some(dropped) = events.pop_front() {
                debug!(event_id = %dropped.envelope.id, "Retention exceeded, dropping oldest event");
            }
        }
        debug!(event_id = %id, event_type = %envelope.event_type, "Event queued");
        events.push_back(QueuedEvent {
            envelope,
            consumed_by: HashSet::new(),
        });
        id
    }

    /// Events matching `event_type` (literal or pattern) not yet consumed by
    /// `consumer`, in publish order.
    pub async fn pending(&self, event_type: &str, consumer: &str) -> Vec<EventEnvelope> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| subject_matches(event_type, &e.envelope.event_type))
            .filter(|e| !e.consumed_by.contains(consumer))
            .map(|e| e.envelope.clone())
            .collect()
    }

    /// Mark `ids` consumed by `consumer`. Returns how many were newly marked.
    pub async fn mark_consumed(&self, consumer: &str, ids: &[String]) -> usize {
        let mut events = self.events.write().await;
        let mut marked = 0;
        for event in events.iter_mut().filter(|e| ids.contains(&e.envelope.id)) {
            if event.consumed_by.insert(consumer.to_string()) {
                marked += 1;
            }
        }
        marked
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str) -> EventEnvelope {
        EventEnvelope::new(event_type, json!({ "project": "p" }))
    }

    #[tokio::test]
    async fn test_publish_assigns_id_and_time() {
        let queue = EventQueue::default();
        let id = queue.publish(event("t1")).await;
        assert!(!id.is_empty());
        let pending = queue.pending("t1", "c").await;
        assert_eq!(pending[0].id, id);
        assert!(pending[0].time.is_some());
    }

    #[tokio::test]
    async fn test_pending_preserves_order_and_type() {
        let queue = EventQueue::default();
        let a = queue.publish(event("sh.keptn.event.a.triggered")).await;
        queue.publish(event("sh.keptn.event.b.triggered")).await;
        let c = queue.publish(event("sh.keptn.event.a.triggered")).await;

        let ids: Vec<String> = queue
            .pending("sh.keptn.event.a.triggered", "c1")
            .await
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![a, c]);
        assert_eq!(queue.pending("sh.keptn.event.>", "c1").await.len(), 3);
    }

    #[tokio::test]
    async fn test_consumption_is_per_consumer() {
        let queue = EventQueue::default();
        let id = queue.publish(event("t1")).await;

        assert_eq!(queue.mark_consumed("c1", &[id.clone()]).await, 1);
        assert_eq!(queue.mark_consumed("c1", &[id.clone()]).await, 0);
        assert!(queue.pending("t1", "c1").await.is_empty());
        assert_eq!(queue.pending("t1", "c2").await.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let queue = EventQueue::new(2);
        let first = queue.publish(event("t1")).await;
        queue.publish(event("t1")).await;
        queue.publish(event("t1")).await;
        assert_eq!(queue.len().await, 2);
        assert!(queue.pending("t1", "c").await.iter().all(|e| e.id != first));
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_ignored() {
        let queue = EventQueue::default();
        let mut e = event("t1");
        e.id = "fixed".into();
        queue.publish(e.clone()).await;
        queue.publish(e).await;
        assert_eq!(queue.len().await, 1);
    }
}
