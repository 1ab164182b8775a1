//! Fan-out of typed events to subscribers, with bounded history replay.
//!
//! Publishing is non-blocking from the publisher's side: a slow
//! subscriber never stalls the control task. Each subscriber gets its
//! own bounded queue; once full the oldest queued event is dropped and
//! a single `subscriber_lagged` event is pushed in its place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: now_ms(),
            data,
            iteration: None,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A subscriber's own bounded queue. Unlike a plain `mpsc` channel, the
/// publisher side can evict from the front, which is what makes true
/// drop-oldest overflow handling possible: once `push` finds the queue
/// full it pops the oldest entry before appending the new one, so the
/// append never fails and a `subscriber_lagged` notice can always be
/// delivered the same way.
struct SubscriberQueue {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Appends `event`, evicting the oldest queued event first if full.
    /// Returns `true` if an eviction happened (the subscriber lagged).
    async fn push(&self, event: Event) -> bool {
        let mut events = self.events.lock().await;
        let lagged = events.len() >= self.capacity;
        if lagged {
            events.pop_front();
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
        lagged
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct Subscriber {
    id: u64,
    queue: Arc<SubscriberQueue>,
}

/// Fan-out bus with a bounded history ring.
///
/// `inner` is a single `Mutex` guarding both the subscriber list and
/// the history ring: publishes are rare enough relative to per-event
/// work that a single lock is simpler than splitting them, and it
/// keeps "append to history" and "fan out to subscribers" atomic with
/// respect to concurrent subscribes (property P6).
pub struct EventBus {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    history_capacity: usize,
    subscriber_queue_capacity: usize,
}

struct Inner {
    subscribers: Vec<Subscriber>,
    history: VecDeque<Event>,
}

pub struct Subscription {
    pub id: u64,
    pub receiver: Receiver,
}

/// A subscriber's read handle. Cancel-safe: the only await point is
/// `Notify::notified`, reached only after finding the queue empty, so
/// dropping a pending `recv()` (e.g. inside `tokio::select!`) never
/// loses an already-queued event.
pub struct Receiver {
    queue: Arc<SubscriberQueue>,
}

impl Receiver {
    /// Waits for the next event, or returns `None` once the bus has
    /// unsubscribed this receiver and its queue has drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut events = self.queue.events.lock().await;
                if let Some(event) = events.pop_front() {
                    return Some(event);
                }
                if self.queue.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.events.try_lock().ok().and_then(|mut events| events.pop_front())
    }
}

impl EventBus {
    pub fn new(history_capacity: usize, subscriber_queue_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                history: VecDeque::with_capacity(history_capacity.min(4096)),
            }),
            next_id: AtomicU64::new(1),
            history_capacity,
            subscriber_queue_capacity,
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.subscriber_queue_capacity));
        let mut inner = self.inner.lock().await;
        inner.subscribers.push(Subscriber {
            id,
            queue: queue.clone(),
        });
        Subscription {
            id,
            receiver: Receiver { queue },
        }
    }

    /// Idempotent: removing an id that is not present (already removed,
    /// or never existed) is a no-op.
    pub async fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.subscribers.iter().position(|s| s.id == id) {
            let sub = inner.subscribers.remove(pos);
            sub.queue.close();
        }
    }

    pub async fn publish(&self, event: Event) {
        tracing::debug!(event_type = %event.kind, timestamp = event.timestamp, "publishing event");

        let mut inner = self.inner.lock().await;

        inner.history.push_back(event.clone());
        while inner.history.len() > self.history_capacity {
            inner.history.pop_front();
        }

        let mut lagged_ids = Vec::new();
        for sub in &inner.subscribers {
            if sub.queue.push(event.clone()).await {
                lagged_ids.push(sub.id);
            }
        }

        // Overflow policy (spec.md:70): drop the oldest queued event and
        // deliver exactly one `subscriber_lagged` notice to that
        // subscriber. `push` always succeeds (it evicts to make room),
        // so the notice is never silently dropped the way a failed
        // `try_send` would be.
        for id in lagged_ids {
            if let Some(sub) = inner.subscribers.iter().find(|s| s.id == id) {
                let lag_event = Event::new(
                    "subscriber_lagged",
                    serde_json::json!({ "subscriberId": id }),
                );
                sub.queue.push(lag_event).await;
            }
        }
    }

    pub async fn history(&self, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock().await;
        let skip = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(skip).cloned().collect()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}

pub type SharedEventBus = Arc<EventBus>;
