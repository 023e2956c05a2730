//! Status events for observers (HTTP, logs, tests)

use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{info, warn};

use sensorhub_protocol::SensorType;

use crate::producer::ProducerId;

const DEFAULT_CAPACITY: usize = 256;

/// One state transition. Emitted once per transition, never per scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Connected {
        producer: ProducerId,
        sensor: SensorType,
        addr: SocketAddr,
    },
    Stale {
        producer: ProducerId,
        sensor: SensorType,
        silent_secs: f64,
    },
    Recovered {
        producer: ProducerId,
        sensor: SensorType,
    },
    Disconnected {
        producer: ProducerId,
        sensor: SensorType,
        samples: u64,
        reason: String,
    },
    SessionStarted {
        session: String,
    },
    SessionStopped {
        session: String,
        rows: u64,
    },
}

/// Fan-out of status events. Publishing never blocks; slow subscribers lag
/// and miss events rather than stalling the hub.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusEvent) {
        log_event(&event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn log_event(event: &StatusEvent) {
    match event {
        StatusEvent::Connected {
            producer,
            sensor,
            addr,
        } => info!(producer, sensor = %sensor, addr = %addr, "Producer connected"),
        StatusEvent::Stale {
            producer,
            sensor,
            silent_secs,
        } => warn!(producer, sensor = %sensor, silent_secs, "Producer stale"),
        StatusEvent::Recovered { producer, sensor } => {
            info!(producer, sensor = %sensor, "Producer recovered")
        }
        StatusEvent::Disconnected {
            producer,
            sensor,
            samples,
            reason,
        } => info!(producer, sensor = %sensor, samples, reason = %reason, "Producer disconnected"),
        StatusEvent::SessionStarted { session } => info!(session = %session, "Session started"),
        StatusEvent::SessionStopped { session, rows } => {
            info!(session = %session, rows, "Session stopped")
        }
    }
}
