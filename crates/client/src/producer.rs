//! Long-running producer: buffered sends with reconnect
//!
//! Frames are stamped when submitted, not when sent, so a frame buffered
//! across a reconnect keeps the time it was taken.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sensorhub_protocol::SensorType;
use sensorhub_timesync::local_nanos;

use crate::client::ProducerClient;
use crate::outbox::{Fields, Outbox};

/// Outbox wait between cancellation checks
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ReconnectingProducer {
    addr: String,
    sensor: SensorType,
    outbox: Arc<Outbox>,
    backoff: Duration,
    connect_timeout: Duration,
    /// Offset learned from the most recent ack
    offset_secs: Mutex<f64>,
    sent: AtomicU64,
    connects: AtomicU64,
}

impl ReconnectingProducer {
    pub fn new(addr: impl Into<String>, sensor: SensorType, capacity: usize, backoff: Duration) -> Self {
        Self {
            addr: addr.into(),
            sensor,
            outbox: Arc::new(Outbox::new(capacity)),
            backoff,
            connect_timeout: crate::client::DEFAULT_CONNECT_TIMEOUT,
            offset_secs: Mutex::new(0.0),
            sent: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn sensor(&self) -> &SensorType {
        &self.sensor
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.outbox.dropped()
    }

    /// Successful handshakes so far.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    fn offset(&self) -> f64 {
        match self.offset_secs.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_offset(&self, offset: f64) {
        let mut guard = match self.offset_secs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = offset;
    }

    /// Hub-aligned time; local time until the first connection.
    pub fn timestamp(&self) -> f64 {
        local_nanos() as f64 / 1_000_000_000.0 + self.offset()
    }

    /// Stamp and buffer one frame. Returns `false` when an older frame was
    /// dropped to make room.
    pub fn submit(&self, mut fields: Fields) -> bool {
        if !fields.contains_key("timestamp") {
            fields.insert("timestamp".to_string(), Value::from(self.timestamp()));
        }
        self.outbox.push(fields)
    }

    /// Connect, drain the outbox, and reconnect after `backoff` whenever the
    /// connection fails. On cancel, whatever is buffered is sent once more
    /// if connected.
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let connect = ProducerClient::connect_timeout(
                self.addr.as_str(),
                self.sensor.clone(),
                self.connect_timeout,
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect => result,
            };

            let mut client = match result {
                Ok(client) => client.with_timestamps(false),
                Err(e) => {
                    warn!(
                        addr = %self.addr,
                        sensor = %self.sensor,
                        error = %e,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "Connect failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => continue,
                    }
                }
            };
            self.set_offset(client.offset_secs());
            self.connects.fetch_add(1, Ordering::Relaxed);

            if self.pump(&mut client, &cancel).await {
                self.flush(&mut client).await;
                let _ = client.close().await;
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        info!(
            sensor = %self.sensor,
            sent = self.sent(),
            dropped = self.dropped(),
            pending = self.outbox.len(),
            "Producer stopped"
        );
    }

    /// Send until the connection breaks (`false`) or cancel (`true`).
    async fn pump(&self, client: &mut ProducerClient, cancel: &CancellationToken) -> bool {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return true,
                next = self.outbox.pop(POLL_INTERVAL) => next,
            };
            let Some(fields) = next else {
                continue;
            };

            if let Err(e) = client.send(fields.clone()).await {
                warn!(sensor = %self.sensor, error = %e, "Send failed, reconnecting");
                self.outbox.requeue(fields);
                return false;
            }
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn flush(&self, client: &mut ProducerClient) {
        while let Some(fields) = self.outbox.try_pop() {
            if let Err(e) = client.send(fields).await {
                warn!(sensor = %self.sensor, error = %e, "Send failed during flush");
                return;
            }
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}
