//! Fixed-capacity MPMC queue with drop-oldest admission.
//!
//! Sits between the per-stream decode loops (producers) and the accelerator
//! workers (consumers). Dropping the oldest task on overflow keeps the
//! pipeline serving fresh frames under load; dropped tasks are counted but
//! otherwise vanish silently.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::Duration,
};

struct Inner<T> {
    items: VecDeque<T>,
    stopped: bool,
    dropped: u64,
}

pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    /// A zero capacity is clamped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                stopped: false,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueue an item, evicting the oldest entry when full.
    ///
    /// Returns `false` only when the queue has been stopped.
    pub fn push(&self, item: T) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopped {
                return false;
            }
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
            }
            inner.items.push_back(item);
        }
        self.not_empty.notify_one();
        true
    }

    /// Block until an item arrives, the timeout elapses, or the queue stops.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        let (mut inner, result) = self
            .not_empty
            .wait_timeout_while(inner, timeout, |inner| {
                inner.items.is_empty() && !inner.stopped
            })
            .unwrap();
        if result.timed_out() {
            return None;
        }
        // A stop() wake-up with nothing queued also lands here.
        inner.items.pop_front()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    /// Reject further pushes and wake every blocked `pop`. Items already
    /// enqueued stay drainable.
    pub fn stop(&self) {
        self.inner.lock().unwrap().stopped = true;
        self.not_empty.notify_all();
    }

    /// Drop queued items without touching the stopped flag or statistics.
    pub fn clear(&self) {
        self.inner.lock().unwrap().items.clear();
    }

    /// Clear contents, lift the stopped flag, and zero the drop counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        inner.stopped = false;
        inner.dropped = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn size_never_exceeds_capacity() {
        let queue = BoundedQueue::new(4);
        for i in 0..100 {
            assert!(queue.push(i));
            assert!(queue.len() <= 4);
        }
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn full_queue_drops_the_front_item() {
        let queue = BoundedQueue::new(3);
        for i in 0..3 {
            queue.push(i);
        }
        assert_eq!(queue.dropped_count(), 0);

        queue.push(3);
        assert_eq!(queue.dropped_count(), 1);
        // Item 0 is gone; the rest drain in order.
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn stop_wakes_blocked_pop_and_rejects_push() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(2));
        queue.push(7);

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || {
                // Drain the single item, then block until stop().
                let first = queue.pop(Duration::from_secs(5));
                let second = queue.pop(Duration::from_secs(5));
                (first, second)
            })
        };

        thread::sleep(Duration::from_millis(100));
        queue.stop();
        let (first, second) = waiter.join().unwrap();
        assert_eq!(first, Some(7));
        assert_eq!(second, None);

        assert!(!queue.push(8));
        assert!(queue.is_stopped());
    }

    #[test]
    fn stopped_queue_remains_drainable() {
        let queue = BoundedQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.stop();
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(2));
    }

    #[test]
    fn reset_restores_a_stopped_queue() {
        let queue = BoundedQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        queue.stop();
        assert_eq!(queue.dropped_count(), 1);

        queue.reset();
        assert!(!queue.is_stopped());
        assert!(queue.is_empty());
        assert_eq!(queue.dropped_count(), 0);
        assert!(queue.push(9));
        assert_eq!(queue.try_pop(), Some(9));
    }

    #[test]
    fn clear_keeps_stats_and_state() {
        let queue = BoundedQueue::new(1);
        queue.push(1);
        queue.push(2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.dropped_count(), 1);
        assert!(!queue.is_stopped());
    }
}
