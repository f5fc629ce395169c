//! Bounded hand-off queue between the accept loop and the workers.
//!
//! Classic mutex + condvar bounded FIFO. One producer (the accept loop),
//! `worker_max` consumers. Consumers wait on the condvar with a timeout so
//! they can notice graceful completion even when no sessions arrive.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct EventQueue<T> {
    inner: Mutex<VecDeque<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue for a worker. Gives the item back when the queue is full so
    /// the caller can fall back to driving the session itself.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Non-blocking pop.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Pop, waiting up to `timeout` when the queue is observed empty.
    pub fn pop_or_wait(&self, timeout: Duration) -> Option<T> {
        let mut queue = self.inner.lock().unwrap();
        if queue.is_empty() {
            let (guard, _) = self.cond.wait_timeout(queue, timeout).unwrap();
            queue = guard;
        }
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_refuses_when_full() {
        let queue = EventQueue::new(2);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        assert_eq!(queue.push("c"), Err("c"));

        queue.pop();
        assert!(queue.push("c").is_ok());
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let queue: EventQueue<u32> = EventQueue::new(2);
        assert_eq!(queue.pop_or_wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_wait_wakes_on_push() {
        let queue = Arc::new(EventQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_or_wait(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(50));
        queue.push(42u32).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }
}
