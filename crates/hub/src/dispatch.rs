//! Per sensor type channels: one bounded queue and one writer per type,
//! created the first time a producer of that type completes its handshake.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

use sensorhub_protocol::SensorType;

use crate::metrics::{DropReason, SensorCounters, SensorMetrics};
use crate::queue::SampleQueue;
use crate::session::SessionManager;
use crate::tasks::TaskGroup;
use crate::writer::{PersistenceWriter, WriterConfig};

/// Queue and counters for one sensor type. Ingestion workers hold this for
/// the life of their connection.
pub struct TypeChannel {
    pub sensor: SensorType,
    pub queue: Arc<SampleQueue>,
    pub metrics: SensorMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus {
    pub sensor: SensorType,
    pub queued: usize,
    #[serde(flatten)]
    pub counters: SensorCounters,
}

pub struct Dispatcher {
    channels: Mutex<HashMap<SensorType, Arc<TypeChannel>>>,
    queue_capacity: usize,
    writer_config: WriterConfig,
    sessions: Arc<SessionManager>,
    writers: TaskGroup,
    writer_stop: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        queue_capacity: usize,
        writer_config: WriterConfig,
        sessions: Arc<SessionManager>,
        writers: TaskGroup,
        writer_stop: CancellationToken,
    ) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            queue_capacity,
            writer_config,
            sessions,
            writers,
            writer_stop,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SensorType, Arc<TypeChannel>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Channel for `sensor`, spawning its writer on first use.
    pub fn channel(&self, sensor: &SensorType) -> Arc<TypeChannel> {
        let mut channels = self.lock();
        if let Some(channel) = channels.get(sensor) {
            return Arc::clone(channel);
        }

        let channel = Arc::new(TypeChannel {
            sensor: sensor.clone(),
            queue: Arc::new(SampleQueue::new(self.queue_capacity)),
            metrics: SensorMetrics::new(sensor.tag()),
        });

        let writer = PersistenceWriter::new(
            sensor.clone(),
            Arc::clone(&channel.queue),
            Arc::clone(&self.sessions),
            channel.metrics.clone(),
            self.writer_config,
        );
        self.writers.spawn(writer.run(self.writer_stop.clone()));
        info!(sensor = %sensor, capacity = self.queue_capacity, "Spawned writer");

        channels.insert(sensor.clone(), Arc::clone(&channel));
        channel
    }

    pub fn channels(&self) -> Vec<Arc<TypeChannel>> {
        let mut channels: Vec<_> = self.lock().values().cloned().collect();
        channels.sort_by(|a, b| a.sensor.tag().cmp(b.sensor.tag()));
        channels
    }

    pub fn status(&self) -> Vec<SensorStatus> {
        self.channels()
            .iter()
            .map(|c| SensorStatus {
                sensor: c.sensor.clone(),
                queued: c.queue.len(),
                counters: c.metrics.snapshot(),
            })
            .collect()
    }

    /// Count anything still queued as a shutdown drop. Used after writers
    /// have been given their drain budget.
    pub fn discard_remaining(&self) -> u64 {
        let mut total = 0;
        for channel in self.channels() {
            let leftover = channel.queue.drain_all().len() as u64;
            channel.metrics.inc_dropped(DropReason::Shutdown, leftover);
            channel.metrics.set_queue_depth(0);
            total += leftover;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::sample::Sample;
    use crate::store::FlushPolicy;
    use sensorhub_protocol::Payload;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_one_channel_and_writer_per_type() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::new(
            dir.path().to_path_buf(),
            FlushPolicy::default(),
            EventBus::default(),
        ));
        let writers = TaskGroup::new();
        let stop = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            8,
            WriterConfig::default(),
            sessions,
            writers.clone(),
            stop.clone(),
        );

        let a = dispatcher.channel(&SensorType::Fsr);
        let b = dispatcher.channel(&SensorType::Fsr);
        let c = dispatcher.channel(&SensorType::Microphone);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(writers.len(), 2);

        let status = dispatcher.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].sensor, SensorType::Fsr);

        stop.cancel();
        writers.close();
        writers.wait().await;
    }

    #[test]
    fn test_discard_remaining_counts_shutdown() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::new(
            dir.path().to_path_buf(),
            FlushPolicy::default(),
            EventBus::default(),
        ));
        // Writers never run outside a runtime; the queue keeps its samples.
        let channel = Arc::new(TypeChannel {
            sensor: SensorType::Fsr,
            queue: Arc::new(SampleQueue::new(8)),
            metrics: SensorMetrics::new("FSR"),
        });
        let dispatcher = Dispatcher::new(
            8,
            WriterConfig::default(),
            sessions,
            TaskGroup::new(),
            CancellationToken::new(),
        );
        dispatcher
            .lock()
            .insert(SensorType::Fsr, Arc::clone(&channel));

        channel.queue.push(Sample {
            sensor: SensorType::Fsr,
            producer: 1,
            timestamp: 1.0,
            sequence: 0,
            payload: Payload::Fsr { force: 0.0, raw: 0 },
        });
        assert_eq!(dispatcher.discard_remaining(), 1);
        assert_eq!(channel.metrics.snapshot().dropped, 1);
    }
}
