//! Prometheus metrics for the hub
//!
//! Registered statics back `/metrics`. Each [`SensorMetrics`] handle also
//! keeps local atomics so `/status` and the periodic summary read one hub's
//! numbers without summing label sets.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const LABEL_SENSOR: &str = "sensor";
const LABEL_REASON: &str = "reason";

static SAMPLES_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sensorhub_samples_received_total",
        "Samples accepted from producers",
        &[LABEL_SENSOR]
    )
    .expect("Failed to register samples_received_total metric")
});

static SAMPLES_PERSISTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sensorhub_samples_persisted_total",
        "Samples written to a session store",
        &[LABEL_SENSOR]
    )
    .expect("Failed to register samples_persisted_total metric")
});

static SAMPLES_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sensorhub_samples_dropped_total",
        "Samples accepted but never persisted",
        &[LABEL_SENSOR, LABEL_REASON]
    )
    .expect("Failed to register samples_dropped_total metric")
});

static FRAMES_MALFORMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sensorhub_frames_malformed_total",
        "Frames discarded as undecodable",
        &[LABEL_SENSOR]
    )
    .expect("Failed to register frames_malformed_total metric")
});

static CONNECTIONS_REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sensorhub_connections_rejected_total",
        "Connections closed during handshake"
    )
    .expect("Failed to register connections_rejected_total metric")
});

static PRODUCERS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sensorhub_producers_active", "Registered producers")
        .expect("Failed to register producers_active metric")
});

static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "sensorhub_queue_depth",
        "Samples waiting in a sensor type queue",
        &[LABEL_SENSOR]
    )
    .expect("Failed to register queue_depth metric")
});

static CLOCK_OFFSET_SECONDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "sensorhub_clock_offset_seconds",
        "Offset of the disciplined clock from the local clock"
    )
    .expect("Failed to register clock_offset_seconds metric")
});

static CLOCK_SYNCED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sensorhub_clock_synced",
        "1 if the clock has synced with its reference"
    )
    .expect("Failed to register clock_synced metric")
});

/// Why an accepted sample was not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted from a full queue
    Backpressure,
    /// No session active when the writer drained it
    NoSession,
    WriteError,
    /// Still queued when the shutdown grace period ran out
    Shutdown,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Backpressure => "backpressure",
            DropReason::NoSession => "no_session",
            DropReason::WriteError => "write_error",
            DropReason::Shutdown => "shutdown",
        }
    }
}

/// Per sensor type metrics handle.
#[derive(Clone)]
pub struct SensorMetrics {
    sensor: String,
    received: Arc<AtomicU64>,
    persisted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
}

impl SensorMetrics {
    pub fn new(sensor: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            received: Arc::new(AtomicU64::new(0)),
            persisted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn inc_received(&self) {
        SAMPLES_RECEIVED_TOTAL
            .with_label_values(&[&self.sensor])
            .inc();
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_persisted(&self, n: u64) {
        if n == 0 {
            return;
        }
        SAMPLES_PERSISTED_TOTAL
            .with_label_values(&[&self.sensor])
            .inc_by(n);
        self.persisted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self, reason: DropReason, n: u64) {
        if n == 0 {
            return;
        }
        SAMPLES_DROPPED_TOTAL
            .with_label_values(&[&self.sensor, reason.as_str()])
            .inc_by(n);
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_malformed(&self) {
        FRAMES_MALFORMED_TOTAL
            .with_label_values(&[&self.sensor])
            .inc();
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        QUEUE_DEPTH
            .with_label_values(&[&self.sensor])
            .set(depth as i64);
    }

    pub fn snapshot(&self) -> SensorCounters {
        SensorCounters {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Local counter values for one sensor type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SensorCounters {
    pub received: u64,
    pub persisted: u64,
    pub dropped: u64,
    pub malformed: u64,
}

pub fn inc_connections_rejected() {
    CONNECTIONS_REJECTED_TOTAL.inc();
}

pub fn set_producers_active(count: usize) {
    PRODUCERS_ACTIVE.set(count as i64);
}

pub fn set_clock(offset_secs: f64, synced: bool) {
    CLOCK_OFFSET_SECONDS.set(offset_secs);
    CLOCK_SYNCED.set(i64::from(synced));
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
