//! Bounded send buffer that drops the oldest frame when full

use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

pub type Fields = Map<String, Value>;

pub struct Outbox {
    queue: Mutex<VecDeque<Fields>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Fields>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue a frame. Returns `false` when the oldest frame was evicted.
    pub fn push(&self, fields: Fields) -> bool {
        let evicted = {
            let mut queue = self.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            };
            queue.push_back(fields);
            evicted
        };
        self.notify.notify_one();
        !evicted
    }

    /// Put back a frame that failed to send, ahead of everything else.
    /// Dropped instead when the buffer filled up in the meantime.
    pub fn requeue(&self, fields: Fields) {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            queue.push_front(fields);
        }
    }

    pub fn try_pop(&self) -> Option<Fields> {
        self.lock().pop_front()
    }

    /// Wait up to `timeout` for a frame.
    pub async fn pop(&self, timeout: Duration) -> Option<Fields> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(fields) = self.try_pop() {
                return Some(fields);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(n: u64) -> Fields {
        let mut map = Map::new();
        map.insert("n".to_string(), json!(n));
        map
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let outbox = Outbox::new(3);
        for n in 0..3 {
            assert!(outbox.push(frame(n)));
        }
        assert!(!outbox.push(frame(3)));
        assert!(!outbox.push(frame(4)));
        assert_eq!(outbox.dropped(), 2);
        assert_eq!(outbox.len(), 3);

        let kept: Vec<u64> = std::iter::from_fn(|| outbox.try_pop())
            .map(|f| f["n"].as_u64().unwrap())
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn test_requeue_goes_first() {
        let outbox = Outbox::new(2);
        outbox.push(frame(1));
        outbox.requeue(frame(0));
        assert_eq!(outbox.try_pop().unwrap()["n"], 0);

        outbox.push(frame(2));
        outbox.requeue(frame(9));
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(outbox.len(), 2);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let outbox = std::sync::Arc::new(Outbox::new(8));
        let producer = std::sync::Arc::clone(&outbox);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(frame(7));
        });

        let got = outbox.pop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got["n"], 7);
        assert!(outbox.pop(Duration::from_millis(20)).await.is_none());
    }
}
