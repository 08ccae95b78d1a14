mod resilient;

pub use resilient::{PendingMessage, PendingStore, ResilientPublisher, ResilientPublisherConfig};

use cadre_types::{now_ms, topic_matches, BusMessage};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub type PublishCallback = Arc<dyn Fn(&BusMessage) + Send + Sync>;

struct SubscriberEntry {
    filter: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Receiving side of a subscription. Dropping it without unsubscribing is
/// safe; the bus drops messages into a closed queue without blocking.
pub struct Subscription {
    pub id: String,
    pub rx: mpsc::Receiver<BusMessage>,
}

/// In-process pub/sub with monotonic sequence stamping and prefix matching.
///
/// Sequence assignment and fanout happen under one critical section so every
/// subscriber observes its matching messages in non-decreasing `seq` order.
/// Delivery is non-blocking: a full subscriber queue drops the message for
/// that subscriber only. The publish callback runs outside the lock and its
/// panics are contained.
pub struct MessageBus {
    subscribers: Mutex<HashMap<String, SubscriberEntry>>,
    seq: AtomicU64,
    subscriber_count: AtomicUsize,
    dropped_total: AtomicU64,
    on_publish: RwLock<Option<PublishCallback>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            subscriber_count: AtomicUsize::new(0),
            dropped_total: AtomicU64::new(0),
            on_publish: RwLock::new(None),
        }
    }

    /// Stamp, match, and fan out. Returns the assigned sequence number.
    pub fn publish(&self, mut msg: BusMessage) -> u64 {
        let seq = {
            let subscribers = self.subscribers.lock().unwrap();
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            msg.seq = seq;
            if msg.timestamp_ms == 0 {
                msg.timestamp_ms = now_ms();
            }
            for entry in subscribers.values() {
                if !topic_matches(&entry.filter, &msg.topic) {
                    continue;
                }
                if entry.tx.try_send(msg.clone()).is_err() {
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            seq
        };

        let callback = self.on_publish.read().unwrap().clone();
        if let Some(cb) = callback {
            if catch_unwind(AssertUnwindSafe(|| cb(&msg))).is_err() {
                tracing::error!(topic = %msg.topic, seq, "publish callback panicked; contained");
            }
        }
        seq
    }

    /// Register a subscriber. An existing subscription with the same id is
    /// replaced; its old queue closes.
    pub fn subscribe(&self, id: impl Into<String>, filter: impl Into<String>) -> Subscription {
        self.subscribe_with_capacity(id, filter, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        &self,
        id: impl Into<String>,
        filter: impl Into<String>,
        capacity: usize,
    ) -> Subscription {
        let id = id.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut subscribers = self.subscribers.lock().unwrap();
        let replaced = subscribers
            .insert(
                id.clone(),
                SubscriberEntry {
                    filter: filter.into(),
                    tx,
                },
            )
            .is_some();
        if !replaced {
            self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        }
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let removed = subscribers.remove(id).is_some();
        if removed {
            self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Last assigned sequence number. Does not contend with `publish`.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn set_on_publish(&self, callback: Option<PublishCallback>) {
        *self.on_publish.write().unwrap() = callback;
    }
}
