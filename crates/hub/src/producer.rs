//! Connected producers and the table that tracks them
//!
//! Counters on [`Producer`] are atomics so the ingestion worker, the liveness
//! tracker and the status endpoint can read them without holding the table
//! lock.

use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sensorhub_protocol::SensorType;

use crate::metrics;

pub type ProducerId = u64;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

pub struct Producer {
    id: ProducerId,
    sensor: SensorType,
    addr: SocketAddr,
    /// Disciplined epoch nanos
    connected_at: i64,
    last_seen: AtomicI64,
    samples: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    next_sequence: AtomicU64,
    stale: AtomicBool,
}

impl Producer {
    pub fn new(id: ProducerId, sensor: SensorType, addr: SocketAddr, now_nanos: i64) -> Self {
        Self {
            id,
            sensor,
            addr,
            connected_at: now_nanos,
            last_seen: AtomicI64::new(now_nanos),
            samples: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
            stale: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn sensor(&self) -> &SensorType {
        &self.sensor
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Next hub-assigned sequence number. Only advances when called, so
    /// assigned numbers have no gaps even if the producer supplies its own
    /// for some frames.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Record an accepted sample.
    pub fn record_sample(&self, now_nanos: i64) -> u64 {
        self.last_seen.store(now_nanos, Ordering::Release);
        self.samples.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Heartbeats refresh liveness without counting as samples.
    pub fn touch(&self, now_nanos: i64) {
        self.last_seen.store(now_nanos, Ordering::Release);
    }

    /// Count a malformed frame, returning the running total.
    pub fn record_error(&self) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_seen_nanos(&self) -> i64 {
        self.last_seen.load(Ordering::Acquire)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Set the stale flag, returning the previous value.
    pub(crate) fn swap_stale(&self, stale: bool) -> bool {
        self.stale.swap(stale, Ordering::AcqRel)
    }

    pub fn snapshot(&self) -> ProducerSnapshot {
        ProducerSnapshot {
            id: self.id,
            sensor: self.sensor.clone(),
            address: self.addr.to_string(),
            connected_at: self.connected_at as f64 / NANOS_PER_SEC,
            last_seen: self.last_seen_nanos() as f64 / NANOS_PER_SEC,
            samples: self.samples(),
            errors: self.errors(),
            dropped: self.dropped(),
            stale: self.is_stale(),
        }
    }
}

/// Point-in-time view of a producer for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerSnapshot {
    pub id: ProducerId,
    pub sensor: SensorType,
    pub address: String,
    pub connected_at: f64,
    pub last_seen: f64,
    pub samples: u64,
    pub errors: u64,
    pub dropped: u64,
    pub stale: bool,
}

/// Registry of connected producers keyed by id.
#[derive(Default)]
pub struct ProducerTable {
    producers: Mutex<HashMap<ProducerId, Arc<Producer>>>,
    next_id: AtomicU64,
}

impl ProducerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProducerId, Arc<Producer>>> {
        match self.producers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocate an id for a connection that has not finished its handshake.
    pub fn allocate_id(&self) -> ProducerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, producer: Arc<Producer>) {
        let active = {
            let mut producers = self.lock();
            producers.insert(producer.id(), producer);
            producers.len()
        };
        metrics::set_producers_active(active);
    }

    pub fn unregister(&self, id: ProducerId) -> Option<Arc<Producer>> {
        let (removed, active) = {
            let mut producers = self.lock();
            let removed = producers.remove(&id);
            (removed, producers.len())
        };
        metrics::set_producers_active(active);
        removed
    }

    pub fn get(&self, id: ProducerId) -> Option<Arc<Producer>> {
        self.lock().get(&id).cloned()
    }

    /// Handles to every registered producer, ordered by id. The lock is
    /// released before the caller touches any of them.
    pub fn list(&self) -> Vec<Arc<Producer>> {
        let mut producers: Vec<_> = self.lock().values().cloned().collect();
        producers.sort_by_key(|p| p.id());
        producers
    }

    pub fn snapshot(&self) -> Vec<ProducerSnapshot> {
        self.list().iter().map(|p| p.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(table: &ProducerTable, sensor: SensorType) -> Arc<Producer> {
        Arc::new(Producer::new(
            table.allocate_id(),
            sensor,
            "127.0.0.1:40000".parse().unwrap(),
            1_000,
        ))
    }

    #[test]
    fn test_register_and_unregister() {
        let table = ProducerTable::new();
        let fsr = producer(&table, SensorType::Fsr);
        let mic = producer(&table, SensorType::Microphone);
        assert_ne!(fsr.id(), mic.id());

        table.register(Arc::clone(&fsr));
        table.register(Arc::clone(&mic));
        assert_eq!(table.len(), 2);
        assert_eq!(table.list()[0].id(), fsr.id());

        let removed = table.unregister(fsr.id()).unwrap();
        assert_eq!(removed.sensor(), &SensorType::Fsr);
        assert!(table.unregister(fsr.id()).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sequence_has_no_gaps() {
        let table = ProducerTable::new();
        let p = producer(&table, SensorType::Fsr);
        let seqs: Vec<u64> = (0..5).map(|_| p.next_sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_counters_and_snapshot() {
        let table = ProducerTable::new();
        let p = producer(&table, SensorType::Accelerometer);

        assert_eq!(p.record_sample(2_000_000_000), 1);
        p.touch(3_000_000_000);
        assert_eq!(p.record_error(), 1);
        p.record_dropped();

        let snap = p.snapshot();
        assert_eq!(snap.samples, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.last_seen, 3.0);
        assert!(!snap.stale);
        assert_eq!(snap.address, "127.0.0.1:40000");
    }
}
