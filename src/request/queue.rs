//! `FileRequestQueue`: bounded in-memory FIFO of pending requests, the
//! hand-off point between `CachedNetworkFile` and the worker pool
//! (spec §4.4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded FIFO guarded by a `tokio::sync::Notify` pair instead of the
/// source's condition variables (spec §4.4, §5 "suspension points").
pub struct FileRequestQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    shutdown: AtomicBool,
}

impl<T> FileRequestQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Appends `item` to the tail. Returns `false` without enqueuing if the
    /// queue is at capacity — callers (queue loaders) should back off.
    pub fn push(&self, item: T) -> bool {
        {
            let mut q = self.lock();
            if q.len() >= self.capacity {
                return false;
            }
            q.push_back(item);
        }
        self.not_empty.notify_one();
        true
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let item = {
            let mut q = self.lock();
            q.pop_front()
        };
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pops the head, parking until an item arrives or [`Self::shutdown`]
    /// is called. Returns `None` only on shutdown (spec §5 "workers park
    /// indefinitely on their queue condvar").
    pub async fn pop(&self) -> Option<T> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            self.not_empty.notified().await;
        }
    }

    /// Waits until the queue has room below capacity, used for write-side
    /// backpressure on the in-memory queue itself (distinct from the
    /// per-segment `write_buffer_cv` backpressure in `CachedNetworkFile`).
    pub async fn wait_for_capacity(&self) {
        loop {
            if self.lock().len() < self.capacity || self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            self.not_full.notified().await;
        }
    }

    /// Cooperative shutdown: sets the flag and wakes every parked `pop`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether depth is below `low_water_mark`, the refill trigger a queue
    /// loader checks before draining more of the durable store (spec §4.4).
    #[must_use]
    pub fn is_below_water_mark(&self, low_water_mark: usize) -> bool {
        self.len() < low_water_mark
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn push_then_pop_returns_in_fifo_order() {
        let q: FileRequestQueue<i32> = FileRequestQueue::new(10);
        q.push(1);
        q.push(2);
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn push_rejects_once_at_capacity() {
        let q: FileRequestQueue<i32> = FileRequestQueue::new(1);
        assert!(q.push(1));
        assert!(!q.push(2));
    }

    #[tokio::test]
    async fn pop_parks_until_push_wakes_it() {
        let q = Arc::new(FileRequestQueue::<i32>::new(10));
        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(42);

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pop should have woken")
            .unwrap();
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn shutdown_wakes_a_parked_pop_with_none() {
        let q = Arc::new(FileRequestQueue::<i32>::new(10));
        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("shutdown should have woken the waiter")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn is_below_water_mark_reflects_depth() {
        let q: FileRequestQueue<i32> = FileRequestQueue::new(10);
        assert!(q.is_below_water_mark(5));
        for i in 0..5 {
            q.push(i);
        }
        assert!(!q.is_below_water_mark(5));
    }
}
