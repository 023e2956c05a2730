//! Per-connection ingestion worker
//!
//! Reads newline-framed JSON from one producer, fills in timestamp and
//! sequence where the producer left them out, and enqueues into the type's
//! queue. Malformed frames are counted and skipped; only a socket error, EOF
//! or shutdown ends the loop.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use sensorhub_protocol::{decode_frame, Frame, LineFramer};

use crate::dispatch::TypeChannel;
use crate::error::IngestError;
use crate::events::StatusEvent;
use crate::metrics::DropReason;
use crate::producer::Producer;
use crate::queue::PushOutcome;
use crate::sample::Sample;
use crate::state::HubState;

/// Log the first malformed frame and then every Nth per producer
const MALFORMED_LOG_EVERY: u64 = 100;

/// Why a reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    Eof,
    Shutdown,
    Error(String),
}

impl Disconnect {
    pub fn as_reason(&self) -> String {
        match self {
            Disconnect::Eof => "eof".to_string(),
            Disconnect::Shutdown => "shutdown".to_string(),
            Disconnect::Error(e) => e.clone(),
        }
    }
}

pub struct IngestWorker {
    producer: Arc<Producer>,
    channel: Arc<TypeChannel>,
    state: Arc<HubState>,
    framer: LineFramer,
}

impl IngestWorker {
    /// `framer` may already hold bytes read past the handshake line.
    pub fn new(
        producer: Arc<Producer>,
        channel: Arc<TypeChannel>,
        state: Arc<HubState>,
        framer: LineFramer,
    ) -> Self {
        Self {
            producer,
            channel,
            state,
            framer,
        }
    }

    /// Run until EOF, error or shutdown, then unregister the producer and
    /// publish exactly one `Disconnected` event.
    pub async fn run<R>(mut self, mut reader: R, cancel: CancellationToken) -> Disconnect
    where
        R: AsyncRead + Unpin,
    {
        let disconnect = match self.read_loop(&mut reader, &cancel).await {
            Ok(d) => d,
            Err(e) => Disconnect::Error(e.to_string()),
        };

        if self.framer.pending() > 0 {
            debug!(
                producer = self.producer.id(),
                bytes = self.framer.pending(),
                "Discarding partial frame at disconnect"
            );
        }

        self.state.producers.unregister(self.producer.id());
        self.state.events.publish(StatusEvent::Disconnected {
            producer: self.producer.id(),
            sensor: self.producer.sensor().clone(),
            samples: self.producer.samples(),
            reason: disconnect.as_reason(),
        });
        disconnect
    }

    async fn read_loop<R>(
        &mut self,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<Disconnect, IngestError>
    where
        R: AsyncRead + Unpin,
    {
        let read_timeout = self.state.config.listener.read_timeout;

        loop {
            self.process_buffered();

            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(Disconnect::Shutdown),
                read = tokio::time::timeout(read_timeout, reader.read_buf(self.framer.buffer_mut())) => read,
            };

            match read {
                // Deadline passed with no data; loop to observe cancellation
                Err(_) => continue,
                Ok(Ok(0)) => return Ok(Disconnect::Eof),
                Ok(Ok(n)) => trace!(producer = self.producer.id(), bytes = n, "read"),
                Ok(Err(e)) => return Err(IngestError::Io(e)),
            }
        }
    }

    fn process_buffered(&mut self) {
        while let Some(line) = self.framer.next_line() {
            match line {
                Ok(line) if line.is_empty() => {}
                Ok(line) => self.handle_line(&line),
                Err(e) => self.record_malformed(&e.to_string()),
            }
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        let frame = match decode_frame(line, self.producer.sensor()) {
            Ok(frame) => frame,
            Err(e) => {
                self.record_malformed(&e.to_string());
                return;
            }
        };

        match frame {
            Frame::Heartbeat => {
                self.producer.touch(self.state.clock.now_nanos());
                trace!(producer = self.producer.id(), "heartbeat");
            }
            Frame::Data(data) => {
                let now_nanos = self.state.clock.now_nanos();
                let sample = Sample {
                    sensor: self.producer.sensor().clone(),
                    producer: self.producer.id(),
                    timestamp: data
                        .timestamp
                        .unwrap_or(now_nanos as f64 / 1_000_000_000.0),
                    sequence: match data.sequence {
                        Some(seq) => seq,
                        None => self.producer.next_sequence(),
                    },
                    payload: data.payload,
                };

                let outcome = self.channel.queue.push(sample);
                self.producer.record_sample(now_nanos);
                self.channel.metrics.inc_received();

                if let PushOutcome::Evicted(old) = outcome {
                    self.channel
                        .metrics
                        .inc_dropped(DropReason::Backpressure, 1);
                    if old.producer == self.producer.id() {
                        self.producer.record_dropped();
                    } else if let Some(owner) = self.state.producers.get(old.producer) {
                        owner.record_dropped();
                    }
                }
            }
        }
    }

    fn record_malformed(&self, reason: &str) {
        let count = self.producer.record_error();
        self.channel.metrics.inc_malformed();
        if count == 1 || count % MALFORMED_LOG_EVERY == 0 {
            warn!(
                producer = self.producer.id(),
                sensor = %self.producer.sensor(),
                count,
                reason,
                "Discarded malformed frame"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support;
    use sensorhub_protocol::{Payload, SensorType};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn worker(state: &Arc<HubState>, sensor: SensorType) -> (IngestWorker, Arc<Producer>, Arc<TypeChannel>) {
        let producer = Arc::new(Producer::new(
            state.producers.allocate_id(),
            sensor.clone(),
            "127.0.0.1:50000".parse().unwrap(),
            state.clock.now_nanos(),
        ));
        state.producers.register(Arc::clone(&producer));
        let channel = Arc::new(TypeChannel {
            sensor: sensor.clone(),
            queue: Arc::new(crate::queue::SampleQueue::new(100)),
            metrics: crate::metrics::SensorMetrics::new(sensor.tag()),
        });
        let worker = IngestWorker::new(
            Arc::clone(&producer),
            Arc::clone(&channel),
            Arc::clone(state),
            LineFramer::new(1024),
        );
        (worker, producer, channel)
    }

    #[tokio::test]
    async fn test_assigns_missing_fields_and_skips_malformed() {
        let dir = TempDir::new().unwrap();
        let (state, _stop) = test_support::state(dir.path());
        let (worker, producer, channel) = worker(&state, SensorType::Fsr);
        let mut events = state.events.subscribe();

        let (mut client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(worker.run(server, CancellationToken::new()));

        client
            .write_all(
                b"{\"force\":1.0,\"raw\":1}\n\
                  garbage\n\
                  {\"type\":\"heartbeat\"}\n\
                  {\"force\":2.0,\"raw\":2,\"timestamp\":1700000000.5,\"sequence\":77}\n\
                  \n\
                  {\"force\":3.0,\"raw\":3}\n\
                  {\"force\":4.0",
            )
            .await
            .unwrap();
        drop(client);

        assert_eq!(handle.await.unwrap(), Disconnect::Eof);

        let samples = channel.queue.drain_all();
        let seqs: Vec<u64> = samples.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 77, 1]);
        assert_eq!(samples[1].timestamp, 1700000000.5);
        assert!(samples[0].timestamp > 1_600_000_000.0);
        assert_eq!(
            samples[2].payload,
            Payload::Fsr {
                force: 3.0,
                raw: 3
            }
        );

        assert_eq!(producer.samples(), 3);
        assert_eq!(producer.errors(), 1);
        assert_eq!(channel.metrics.snapshot().malformed, 1);
        assert!(state.producers.get(producer.id()).is_none());

        match events.recv().await.unwrap() {
            StatusEvent::Disconnected {
                producer: id,
                samples,
                reason,
                ..
            } => {
                assert_eq!(id, producer.id());
                assert_eq!(samples, 3);
                assert_eq!(reason, "eof");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overlong_frame_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let (state, _stop) = test_support::state(dir.path());
        let (worker, producer, channel) = worker(&state, SensorType::Fsr);

        let (mut client, server) = tokio::io::duplex(8192);
        let handle = tokio::spawn(worker.run(server, CancellationToken::new()));

        let mut long = vec![b'x'; 2048];
        long.push(b'\n');
        client.write_all(&long).await.unwrap();
        client.write_all(b"{\"force\":1.0,\"raw\":1}\n").await.unwrap();
        drop(client);

        handle.await.unwrap();
        assert_eq!(producer.errors(), 1);
        assert_eq!(channel.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_ends_idle_reader() {
        let dir = TempDir::new().unwrap();
        let (state, _stop) = test_support::state(dir.path());
        let (worker, _producer, _channel) = worker(&state, SensorType::Microphone);

        let (_client, server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(server, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let disconnect = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(disconnect, Disconnect::Shutdown);
        assert!(state.producers.is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let (state, _stop) = test_support::state(dir.path());
        let producer = Arc::new(Producer::new(
            state.producers.allocate_id(),
            SensorType::Fsr,
            "127.0.0.1:50001".parse().unwrap(),
            0,
        ));
        state.producers.register(Arc::clone(&producer));
        let channel = Arc::new(TypeChannel {
            sensor: SensorType::Fsr,
            queue: Arc::new(crate::queue::SampleQueue::new(2)),
            metrics: crate::metrics::SensorMetrics::new("FSR"),
        });
        let worker = IngestWorker::new(
            Arc::clone(&producer),
            Arc::clone(&channel),
            Arc::clone(&state),
            LineFramer::new(1024),
        );

        let (mut client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(worker.run(server, CancellationToken::new()));
        for i in 0..5 {
            client
                .write_all(format!("{{\"force\":1.0,\"raw\":{}}}\n", i).as_bytes())
                .await
                .unwrap();
        }
        drop(client);
        handle.await.unwrap();

        let kept: Vec<u64> = channel.queue.drain_all().iter().map(|s| s.sequence).collect();
        assert_eq!(kept, vec![3, 4]);
        assert_eq!(channel.metrics.snapshot().dropped, 3);
        assert_eq!(producer.dropped(), 3);
    }
}
