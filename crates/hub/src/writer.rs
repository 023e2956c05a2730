//! Persistence writer: one task per sensor type
//!
//! Drains its queue in batches, strictly in enqueue order, into the active
//! session. After the stop signal it keeps draining until the queue is empty
//! or the drain budget runs out; whatever is left is counted as a shutdown
//! drop.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sensorhub_protocol::SensorType;

use crate::metrics::{DropReason, SensorMetrics};
use crate::queue::SampleQueue;
use crate::sample::Sample;
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// How long to keep draining after stop
    pub drain_budget: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            poll_timeout: Duration::from_millis(250),
            drain_budget: Duration::from_secs(5),
        }
    }
}

pub struct PersistenceWriter {
    sensor: SensorType,
    queue: Arc<SampleQueue>,
    sessions: Arc<SessionManager>,
    metrics: SensorMetrics,
    config: WriterConfig,
    batch: Vec<Sample>,
}

impl PersistenceWriter {
    pub fn new(
        sensor: SensorType,
        queue: Arc<SampleQueue>,
        sessions: Arc<SessionManager>,
        metrics: SensorMetrics,
        config: WriterConfig,
    ) -> Self {
        sessions.register_metrics(&sensor, metrics.clone());
        Self {
            sensor,
            queue,
            sessions,
            metrics,
            batch: Vec::with_capacity(config.batch_size),
            config,
        }
    }

    /// Run until `stop` is cancelled, then drain.
    pub async fn run(mut self, stop: CancellationToken) {
        debug!(sensor = %self.sensor, "Writer started");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                n = self.queue.pop_batch(self.config.batch_size, self.config.poll_timeout, &mut self.batch) => {
                    if n > 0 {
                        self.write_batch();
                    } else {
                        self.sessions.flush_if_due(&self.sensor);
                    }
                    self.metrics.set_queue_depth(self.queue.len());
                }
            }
        }

        self.drain().await;
    }

    fn write_batch(&mut self) {
        // Settled rows are recorded by the session manager
        self.sessions.append_batch(&self.sensor, &self.batch);
        self.batch.clear();
    }

    async fn drain(&mut self) {
        let deadline = Instant::now() + self.config.drain_budget;
        let mut drained = 0u64;

        while Instant::now() < deadline {
            let n = self
                .queue
                .try_pop_batch(self.config.batch_size, &mut self.batch);
            if n == 0 {
                break;
            }
            drained += n as u64;
            self.write_batch();
            // Let other writers progress between batches
            tokio::task::yield_now().await;
        }

        let leftover = self.queue.drain_all().len() as u64;
        if leftover > 0 {
            warn!(
                sensor = %self.sensor,
                leftover,
                "Drain budget exhausted, dropping queued samples"
            );
            self.metrics.inc_dropped(DropReason::Shutdown, leftover);
        }
        self.metrics.set_queue_depth(0);

        info!(
            sensor = %self.sensor,
            drained,
            "Writer stopped"
        );
    }
}
