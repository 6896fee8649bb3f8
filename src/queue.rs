/*!
Thread-safe FIFO used to hand buffers between the firmware plane threads.

Pushes never block (bounded only by memory); the high-watermark is tracked so
a growing backlog is visible in status output. Pops come in a blocking
flavor with a deadline (so worker loops can poll their shutdown flag) and a
non-blocking flavor for the evaluation path.
*/

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    watermark: usize,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Queue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                watermark: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, value: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.items.push_back(value);
            if inner.items.len() > inner.watermark {
                inner.watermark = inner.items.len();
            }
        }
        self.available.notify_one();
    }

    /// Wait up to `timeout` for an element. Returns `None` on timeout so the
    /// caller can check its run flag and come back.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while inner.items.is_empty() {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let (guard, result) = self.available.wait_timeout(inner, remaining).unwrap();
            inner = guard;
            if result.timed_out() && inner.items.is_empty() {
                return None;
            }
        }
        inner.items.pop_front()
    }

    /// Return immediately with `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest queue depth observed since the last counter clear.
    pub fn watermark(&self) -> usize {
        self.inner.lock().unwrap().watermark
    }

    pub fn clear_counters(&self) {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.items.len();
        inner.watermark = len;
    }

    /// Drop all queued elements and the watermark.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        inner.watermark = 0;
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn fifo_order() {
        let q = Queue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn watermark_tracks_high_point() {
        let q = Queue::new();
        q.push(1);
        q.push(2);
        let _ = q.try_pop();
        q.push(3);
        assert_eq!(q.watermark(), 2);
        q.clear_counters();
        assert_eq!(q.watermark(), 1);
    }

    #[test]
    fn pop_timeout_expires() {
        let q: Queue<u32> = Queue::new();
        let t0 = Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(20)), None);
        assert!(t0.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let q = Arc::new(Queue::new());
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                q.push(42u32);
            })
        };
        assert_eq!(q.pop_timeout(Duration::from_secs(2)), Some(42));
        producer.join().unwrap();
    }

    #[test]
    fn reset_clears_backlog() {
        let q = Queue::new();
        q.push(1);
        q.push(2);
        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.watermark(), 0);
    }
}
