//! FIFO work queue feeding the reconcile loop.
//!
//! `enqueue` appends and stores a wake permit; `dequeue` never blocks.
//! Several enqueues before the consumer wakes coalesce into a single wake,
//! so consumers drain with `dequeue` until it returns `None` on every wake.
//! The item is pushed before the permit is stored, so a wake always observes
//! every item enqueued ahead of it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

/// Unbounded FIFO of work items. Clones share the same queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Appends `item` at the tail and wakes the consumer.
    pub fn enqueue(&self, item: T) {
        self.shared
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        self.shared.notify.notify_one();
    }

    /// Pops the head, or `None` when empty.
    pub fn dequeue(&self) -> Option<T> {
        self.shared
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Waits until at least one enqueue happened since the last wake.
    pub async fn notified(&self) {
        self.shared.notify.notified().await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue").field("len", &self.len()).finish()
    }
}
