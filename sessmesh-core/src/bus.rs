//! Publish/subscribe transport for change frames.
//!
//! The bus moves opaque byte frames between nodes; encoding is the caller's
//! business (see [`crate::message::Codec`]). Publishing never waits for
//! delivery. Each subscription owns one delivery task that invokes its
//! handler frame by frame, so frames published by one node reach a given
//! subscriber in publish order, and handlers never run on the publisher's task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Receives frames delivered on a subscribed topic.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, topic: &str, frame: &[u8]);
}

/// Many-to-many, best-effort, at-most-once topic transport.
pub trait ChangeBus: Send + Sync + 'static {
    /// Hand `frame` to every current subscriber of `topic`. Never blocks on
    /// delivery; frames a subscriber cannot accept are dropped.
    fn publish(&self, topic: &str, frame: Vec<u8>);

    /// Register `handler` for `topic` until the returned subscription is
    /// cancelled or dropped. Must be called from within a tokio runtime.
    fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<Subscription>;
}

/// Live registration on a bus. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        topic: String,
        task: Option<JoinHandle<()>>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            topic,
            cancel: Some(Box::new(cancel)),
            task,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("topic", &self.topic).finish()
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Topics {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl Topics {
    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut subs = self.subscribers.lock();
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subs.remove(topic);
            }
        }
    }
}

/// In-process bus connecting every node built on the same instance.
pub struct LocalBus {
    topics: Arc<Topics>,
    capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl LocalBus {
    /// `capacity` bounds each subscriber's backlog.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Topics::default()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Frames dropped because a subscriber's backlog was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.subscribers.lock().get(topic).map_or(0, Vec::len)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ChangeBus for LocalBus {
    fn publish(&self, topic: &str, frame: Vec<u8>) {
        let subs = self.topics.subscribers.lock();
        let Some(list) = subs.get(topic) else {
            return;
        };
        for sub in list {
            if sub.tx.try_send(frame.clone()).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic, subscriber = sub.id, "Change bus backlog full or closed, frame dropped");
            }
        }
    }

    fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<Subscription> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Lifecycle(format!("change bus needs a tokio runtime: {e}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.capacity);
        self.topics
            .subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        let task_topic = topic.to_string();
        let task = runtime.spawn(async move {
            let mut delivered: u64 = 0;
            while let Some(frame) = rx.recv().await {
                delivered += 1;
                handler.on_message(&task_topic, &frame);
            }
            tracing::debug!(topic = %task_topic, delivered, "Change bus subscription closed");
        });

        let topics: Weak<Topics> = Arc::downgrade(&self.topics);
        let cancel_topic = topic.to_string();
        Ok(Subscription::new(topic.to_string(), Some(task), move || {
            if let Some(topics) = topics.upgrade() {
                topics.unsubscribe(&cancel_topic, id);
            }
        }))
    }
}
