//! In-process event bus built on `async-broadcast`.
//!
//! One broadcast channel carries every event; each subscription filters
//! on its topic. The channel overflows by dropping the oldest messages so
//! publishing never blocks the tracker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_broadcast::{Receiver, RecvError, Sender, TryRecvError};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::graph::model::JobId;
use crate::tracker::events::{EventEnvelope, JobEvent, Topic};

#[derive(Clone)]
pub struct EventBus {
    sender: Sender<Arc<EventEnvelope>>,
    // Held so the channel never reports itself inactive
    _receiver: Receiver<Arc<EventEnvelope>>,
    subscriptions: Arc<DashMap<Uuid, Registration>>,
    sequence: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Registration {
    topic: Topic,
    /// Wakes a receiver blocked in `next` when unsubscribed from elsewhere
    closed: Arc<Notify>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true); // Drop oldest messages when full
        Self {
            sender,
            _receiver: receiver,
            subscriptions: Arc::new(DashMap::new()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish without waiting. Returns the sequence number assigned.
    pub fn publish(&self, job_id: &JobId, event: JobEvent) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = Arc::new(EventEnvelope {
            sequence,
            job_id: job_id.clone(),
            timestamp: Utc::now(),
            topic: event.topic(),
            event,
        });
        trace!(sequence, topic = %envelope.topic, event = envelope.event.name(), "publish");
        if let Err(e) = self.sender.try_broadcast(envelope) {
            warn!(sequence, error = %e, "event dropped");
        }
        sequence
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = Uuid::new_v4();
        let closed = Arc::new(Notify::new());
        self.subscriptions.insert(
            id,
            Registration {
                topic: topic.clone(),
                closed: closed.clone(),
            },
        );
        debug!(subscription = %id, topic = %topic, "subscribed");
        Subscription {
            id,
            topic,
            receiver: self.sender.new_receiver(),
            subscriptions: self.subscriptions.clone(),
            closed,
        }
    }

    /// Idempotent: returns false when the subscription is already gone
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        match self.subscriptions.remove(&id) {
            Some((_, registration)) => {
                registration.closed.notify_one();
                debug!(subscription = %id, topic = %registration.topic, "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// One item read from a subscription
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Arc<EventEnvelope>),
    /// This many events were dropped before being read; state queries
    /// are needed to catch up.
    Lagged(u64),
}

/// A topic-filtered view of the bus
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    topic: Topic,
    receiver: Receiver<Arc<EventEnvelope>>,
    subscriptions: Arc<DashMap<Uuid, Registration>>,
    closed: Arc<Notify>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.subscriptions.contains_key(&self.id)
    }

    /// Next event on this topic, or notice that events were lost.
    /// `None` once unsubscribed or the bus is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            if !self.is_active() {
                return None;
            }
            let received = tokio::select! {
                _ = self.closed.notified() => return None,
                received = self.receiver.recv() => received,
            };
            match received {
                Ok(envelope) if envelope.topic == self.topic => {
                    return Some(Delivery::Event(envelope))
                }
                Ok(_) => continue,
                Err(RecvError::Overflowed(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged, events lost");
                    return Some(Delivery::Lagged(skipped));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event on this topic, skipping over lost ones
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        loop {
            match self.next().await? {
                Delivery::Event(envelope) => return Some(envelope),
                Delivery::Lagged(_) => continue,
            }
        }
    }

    /// Next already-buffered event on this topic, if any
    pub fn try_recv(&mut self) -> Option<Arc<EventEnvelope>> {
        loop {
            if !self.is_active() {
                return None;
            }
            match self.receiver.try_recv() {
                Ok(envelope) if envelope.topic == self.topic => return Some(envelope),
                Ok(_) => continue,
                Err(TryRecvError::Overflowed(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged, events lost");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Same as [`EventBus::unsubscribe`] for this subscription
    pub fn unsubscribe(&mut self) -> bool {
        self.subscriptions.remove(&self.id).is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscriptions.remove(&self.id);
    }
}
