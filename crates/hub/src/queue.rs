//! Bounded per sensor type FIFO with drop-oldest overflow
//!
//! Producers never wait on a full queue: the oldest entry is evicted and
//! handed back so the caller can count it. The single consumer waits on a
//! [`Notify`] with a timeout.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::sample::Sample;

#[derive(Debug, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; this oldest entry was dropped to make room.
    Evicted(Sample),
}

pub struct SampleQueue {
    items: Mutex<VecDeque<Sample>>,
    capacity: usize,
    notify: Notify,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Sample>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue without blocking.
    pub fn push(&self, sample: Sample) -> PushOutcome {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(sample);
            evicted
        };
        self.notify.notify_one();
        match evicted {
            Some(old) => PushOutcome::Evicted(old),
            None => PushOutcome::Queued,
        }
    }

    /// Move up to `max` samples into `out` in enqueue order.
    pub fn try_pop_batch(&self, max: usize, out: &mut Vec<Sample>) -> usize {
        let mut items = self.lock();
        let n = max.min(items.len());
        out.extend(items.drain(..n));
        n
    }

    /// Like [`try_pop_batch`](Self::try_pop_batch) but waits up to `timeout`
    /// for the first sample. Returns 0 on timeout.
    pub async fn pop_batch(&self, max: usize, timeout: Duration, out: &mut Vec<Sample>) -> usize {
        let n = self.try_pop_batch(max, out);
        if n > 0 {
            return n;
        }
        // A push between the check above and this wait leaves a permit, so
        // the wakeup is not lost.
        if tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_err()
        {
            return 0;
        }
        self.try_pop_batch(max, out)
    }

    /// Remove everything still queued.
    pub fn drain_all(&self) -> Vec<Sample> {
        self.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorhub_protocol::{Payload, SensorType};
    use std::sync::Arc;

    fn sample(sequence: u64) -> Sample {
        Sample {
            sensor: SensorType::Fsr,
            producer: 1,
            timestamp: 1_700_000_000.0 + sequence as f64,
            sequence,
            payload: Payload::Fsr {
                force: 1.0,
                raw: sequence as i64,
            },
        }
    }

    fn sequences(samples: &[Sample]) -> Vec<u64> {
        samples.iter().map(|s| s.sequence).collect()
    }

    #[test]
    fn test_fifo_order() {
        let queue = SampleQueue::new(10);
        for i in 0..5 {
            assert_eq!(queue.push(sample(i)), PushOutcome::Queued);
        }
        let mut out = Vec::new();
        assert_eq!(queue.try_pop_batch(3, &mut out), 3);
        assert_eq!(queue.try_pop_batch(10, &mut out), 2);
        assert_eq!(sequences(&out), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = SampleQueue::new(3);
        for i in 0..3 {
            queue.push(sample(i));
        }
        match queue.push(sample(3)) {
            PushOutcome::Evicted(old) => assert_eq!(old.sequence, 0),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(sequences(&queue.drain_all()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_pop_batch_times_out_when_empty() {
        let queue = SampleQueue::new(4);
        let mut out = Vec::new();
        let n = queue
            .pop_batch(4, Duration::from_millis(20), &mut out)
            .await;
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_pop_batch_wakes_on_push() {
        let queue = Arc::new(SampleQueue::new(4));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(sample(9));
        });

        let mut out = Vec::new();
        let n = queue.pop_batch(4, Duration::from_secs(5), &mut out).await;
        assert_eq!(n, 1);
        assert_eq!(out[0].sequence, 9);
    }
}
