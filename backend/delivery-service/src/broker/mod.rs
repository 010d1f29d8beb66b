//! Real-time fan-out of events to connected subscribers.
//!
//! Every subscription owns a bounded buffer. Publishing never waits on a
//! consumer: when a buffer is full the oldest frame is dropped, the new one is
//! kept, and the subscription is evicted. The consumer drains what is left and
//! then sees [`ConnectionDropped::Evicted`].
//!
//! Events published while a topic has no subscriber are not retained.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::metrics;

pub mod sse;

/// Unique identifier for a stream subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One event as seen by a subscriber. `id` increases across the whole broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub id: u64,
    pub event_type: String,
    pub data: Value,
}

/// Why a subscription stopped yielding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionDropped {
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("subscriber evicted after overflowing its buffer")]
    Evicted,

    #[error("broker is shutting down")]
    Shutdown,
}

struct Buffer {
    frames: VecDeque<EventFrame>,
    closed: Option<ConnectionDropped>,
}

/// Broker-side half of a subscription.
struct Slot {
    id: SubscriberId,
    capacity: usize,
    buffer: Mutex<Buffer>,
    notify: Notify,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct FanOut {
    delivered: usize,
    evicted: usize,
    reaped: usize,
}

enum Push {
    Delivered,
    Evicted,
    Closed,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Self {
            id: SubscriberId::new(),
            capacity,
            buffer: Mutex::new(Buffer {
                frames: VecDeque::with_capacity(capacity),
                closed: None,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, frame: EventFrame) -> Push {
        let mut buffer = self.buffer.lock();
        if buffer.closed.is_some() {
            return Push::Closed;
        }

        let result = if buffer.frames.len() >= self.capacity {
            buffer.frames.pop_front();
            buffer.frames.push_back(frame);
            buffer.closed = Some(ConnectionDropped::Evicted);
            Push::Evicted
        } else {
            buffer.frames.push_back(frame);
            Push::Delivered
        };
        drop(buffer);

        self.notify.notify_one();
        result
    }

    /// Returns false if the slot was already closed.
    fn close(&self, reason: ConnectionDropped) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.closed.is_some() {
            return false;
        }
        buffer.closed = Some(reason);
        drop(buffer);

        self.notify.notify_one();
        true
    }
}

struct Inner {
    topics: RwLock<HashMap<String, Vec<Arc<Slot>>>>,
    buffer_size: usize,
    next_frame_id: AtomicU64,
}

impl Inner {
    fn remove(&self, topic: &str, id: SubscriberId) -> bool {
        let mut topics = self.topics.write();
        let Some(slots) = topics.get_mut(topic) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        let removed = slots.len() < before;
        if slots.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

/// Topic-based fan-out. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<Inner>,
}

impl EventBroker {
    /// `buffer_size` frames per subscriber; zero is treated as one.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                buffer_size: buffer_size.max(1),
                next_frame_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Register a connection-scoped subscription. Dropping it unsubscribes.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let slot = Arc::new(Slot::new(self.inner.buffer_size));
        let mut topics = self.inner.topics.write();
        topics
            .entry(topic.to_string())
            .or_default()
            .push(Arc::clone(&slot));

        tracing::debug!(
            subscriber_id = %slot.id,
            topic = %topic,
            subscribers = topics.get(topic).map(|v| v.len()).unwrap_or(0),
            "Added subscriber"
        );
        drop(topics);
        metrics::subscriber_opened();

        Subscription {
            topic: topic.to_string(),
            slot,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver to every live subscriber of `topic`. Returns how many
    /// subscribers received the frame; zero when nobody is listening.
    pub fn publish(&self, topic: &str, event_type: &str, data: Value) -> usize {
        let frame = EventFrame {
            id: self.inner.next_frame_id.fetch_add(1, Ordering::Relaxed) + 1,
            event_type: event_type.to_string(),
            data,
        };
        let frame_id = frame.id;

        let report = self.fan_out(topic, frame);
        metrics::record_evicted(report.evicted);
        metrics::record_reaped(report.reaped);
        metrics::record_publish(report.delivered);
        tracing::debug!(
            topic = %topic,
            event_type = %event_type,
            frame_id,
            delivered = report.delivered,
            "Published event"
        );
        report.delivered
    }

    fn fan_out(&self, topic: &str, frame: EventFrame) -> FanOut {
        let mut report = FanOut::default();
        let mut overflowed = Vec::new();
        let mut closed = Vec::new();
        {
            let topics = self.inner.topics.read();
            if let Some(slots) = topics.get(topic) {
                for slot in slots {
                    match slot.push(frame.clone()) {
                        Push::Delivered => report.delivered += 1,
                        Push::Evicted => {
                            report.delivered += 1;
                            overflowed.push(slot.id);
                        }
                        Push::Closed => closed.push(slot.id),
                    }
                }
            }
        }

        for id in overflowed {
            if self.inner.remove(topic, id) {
                tracing::warn!(
                    subscriber_id = %id,
                    topic = %topic,
                    buffer_size = self.inner.buffer_size,
                    "Subscriber buffer overflowed, evicting"
                );
                report.evicted += 1;
            }
        }
        for id in closed {
            // Consumer went away between closing its slot and unregistering.
            if self.inner.remove(topic, id) {
                tracing::debug!(subscriber_id = %id, topic = %topic, "Reaped closed subscriber");
                report.reaped += 1;
            }
        }
        report
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.subscriber_count(topic) > 0
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().len()
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner.topics.read().values().map(Vec::len).sum()
    }

    /// End every subscription with [`ConnectionDropped::Shutdown`].
    pub fn close_all(&self) {
        let topics = std::mem::take(&mut *self.inner.topics.write());
        let mut closed = 0;
        for slot in topics.values().flatten() {
            if slot.close(ConnectionDropped::Shutdown) {
                closed += 1;
            }
        }
        tracing::info!(closed, "Closed all event stream subscriptions");
    }
}

/// Consumer half of a subscription.
pub struct Subscription {
    topic: String,
    slot: Arc<Slot>,
    broker: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.slot.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next buffered frame. Once the subscription is closed, remaining frames
    /// are still drained before the drop reason is returned.
    pub async fn next(&mut self) -> Result<EventFrame, ConnectionDropped> {
        loop {
            if let Some(result) = self.try_next() {
                return result;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`Subscription::next`]; `None` when idle.
    pub fn try_next(&mut self) -> Option<Result<EventFrame, ConnectionDropped>> {
        let mut buffer = self.slot.buffer.lock();
        if let Some(frame) = buffer.frames.pop_front() {
            return Some(Ok(frame));
        }
        buffer.closed.map(Err)
    }

    pub fn buffered(&self) -> usize {
        self.slot.buffer.lock().frames.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.close(ConnectionDropped::ClientDisconnected);
        if let Some(inner) = self.broker.upgrade() {
            inner.remove(&self.topic, self.slot.id);
        }
        metrics::subscriber_closed();
        tracing::debug!(subscriber_id = %self.slot.id, topic = %self.topic, "Removed subscriber");
    }
}
