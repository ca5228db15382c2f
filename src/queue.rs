use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded FIFO queue with drop-oldest overflow.
///
/// When full, `push` evicts the oldest entry to make room for the newest:
/// for interactive byte streams, freshness beats completeness. `pop` and
/// `drain` suspend while the queue is empty.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue, evicting the oldest entry when the queue is at capacity.
    /// Returns true when nothing was evicted.
    pub fn push(&self, item: T) -> bool {
        let mut dropped = false;
        {
            let mut items = match self.items.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if items.len() >= self.capacity {
                items.pop_front();
                dropped = true;
            }
            items.push_back(item);
        }
        self.notify.notify_waiters();
        !dropped
    }

    /// Wait for an item and dequeue it.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Arm the waiter before checking so a push between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        match self.items.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Wait for at least one item, then greedily take everything already
    /// queued without blocking. Batches bursts into one delivery.
    pub async fn drain(&self) -> Vec<T> {
        let first = self.pop().await;
        let mut batch = vec![first];
        while let Some(item) = self.try_pop() {
            batch.push(item);
        }
        batch
    }

    pub fn len(&self) -> usize {
        match self.items.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        match self.items.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}
