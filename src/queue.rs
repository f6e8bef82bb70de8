//! Bounded hand-off queue between pipeline stages.
//!
//! `BoundedQueue` is the only structure shared between stage threads on the hot
//! path. It is fixed-capacity and never grows: a push against a full queue hands
//! the item back to the caller, which then applies its backpressure policy.
//!
//! The queue MUST NOT:
//! - Block on push
//! - Drop items implicitly (eviction happens only through `drop_oldest`)
//! - Reorder items

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Poll interval used by `pop_wait`.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Fixed-capacity FIFO for one producer thread and one consumer thread.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items. A zero capacity is
    /// raised to one so the queue can always make progress.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push without blocking. On a full queue the item is returned untouched
    /// and the queue contents are unchanged.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    /// Pop the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Poll `try_pop` until an item arrives or `timeout` elapses.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let started = Instant::now();
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if started.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(POP_POLL_INTERVAL);
        }
    }

    /// Evict exactly one item, the oldest. Returns false when the queue was empty.
    ///
    /// The evicted item is discarded unseen; callers that must report what they
    /// evicted (the pipeline's `drop_oldest` policy logs the frame id) use
    /// `try_pop` instead.
    pub fn drop_oldest(&self) -> bool {
        self.lock().pop_front().is_some()
    }

    /// Remove every queued item, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    /// Current depth. Approximate once other threads are active.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock cannot leave the deque half-updated,
        // so a poisoned guard is still safe to use.
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
