//! Append-only CSV store for one sensor type within a session

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;
use sensorhub_protocol::{Payload, SensorType};
use tracing::{debug, warn};

use crate::error::PersistenceError;
use crate::sample::Sample;

/// Pending bytes that force a flush regardless of policy (64KB)
const WRITE_BUFFER_SIZE: usize = 65536;

/// Flush after `every` rows or `interval`, whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub every: usize,
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every: 100,
            interval: Duration::from_secs(1),
        }
    }
}

/// What one flush did with the rows buffered since the previous one.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// Rows now in the file
    pub persisted: u64,
    /// Rows discarded because the write failed
    pub failed: u64,
    pub error: Option<PersistenceError>,
}

/// One sensor type's file in a session.
///
/// Rows are buffered in memory and only count as persisted once a flush has
/// put them in the file. A failed flush keeps the complete rows that made
/// it, cuts off a partially written one, and reports the rest as failed.
pub struct TypeStore {
    path: PathBuf,
    sensor: SensorType,
    file: File,
    policy: FlushPolicy,
    /// Rows confirmed in the file through this handle
    rows: u64,
    /// File length covering every confirmed row
    committed_len: u64,
    /// Header, then pending rows
    buffer: Vec<u8>,
    /// Header bytes at the front of `buffer`; zero once it is on disk
    header_len: usize,
    /// End offset in `buffer` of each pending row
    row_ends: Vec<usize>,
    last_flush: Instant,
    line: String,
}

impl TypeStore {
    /// Open `<dir>/<stem>_data.csv`. The header is written with the first
    /// flush if the file is new.
    pub fn open(dir: &Path, sensor: &SensorType, policy: FlushPolicy) -> Result<Self, PersistenceError> {
        let path = dir.join(file_name(sensor));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let committed_len = file.metadata()?.len();

        let mut store = Self {
            path,
            sensor: sensor.clone(),
            file,
            policy,
            rows: 0,
            committed_len,
            buffer: Vec::with_capacity(WRITE_BUFFER_SIZE),
            header_len: 0,
            row_ends: Vec::new(),
            last_flush: Instant::now(),
            line: String::with_capacity(256),
        };
        if committed_len == 0 {
            store.push_header();
        }
        Ok(store)
    }

    fn push_header(&mut self) {
        let header = self.sensor.columns().join(",");
        self.buffer.extend_from_slice(header.as_bytes());
        self.buffer.push(b'\n');
        self.header_len = self.buffer.len();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows confirmed in the file through this handle.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Rows buffered but not yet flushed.
    pub fn pending(&self) -> usize {
        self.row_ends.len()
    }

    /// Buffer one row. Fails only if the sample cannot be encoded, in which
    /// case nothing is buffered.
    pub fn append(&mut self, sample: &Sample) -> Result<(), PersistenceError> {
        self.line.clear();
        encode_row(sample, &mut self.line)?;
        self.line.push('\n');
        self.buffer.extend_from_slice(self.line.as_bytes());
        self.row_ends.push(self.buffer.len());
        Ok(())
    }

    /// Flush if the row count, the interval or the buffer size has been
    /// reached.
    pub fn flush_if_due(&mut self) -> FlushOutcome {
        if self.row_ends.is_empty() {
            return FlushOutcome::default();
        }
        if self.row_ends.len() >= self.policy.every
            || self.buffer.len() >= WRITE_BUFFER_SIZE
            || self.last_flush.elapsed() >= self.policy.interval
        {
            return self.flush();
        }
        FlushOutcome::default()
    }

    pub fn flush(&mut self) -> FlushOutcome {
        self.last_flush = Instant::now();
        if self.row_ends.is_empty() {
            return FlushOutcome::default();
        }

        let result = self
            .file
            .write_all(&self.buffer)
            .and_then(|()| self.file.flush());
        let outcome = match result {
            Ok(()) => {
                self.committed_len += self.buffer.len() as u64;
                self.header_len = 0;
                FlushOutcome {
                    persisted: self.row_ends.len() as u64,
                    ..FlushOutcome::default()
                }
            }
            Err(e) => self.recover(e),
        };

        self.rows += outcome.persisted;
        self.buffer.clear();
        self.row_ends.clear();
        if self.header_len > 0 {
            self.push_header();
        }
        outcome
    }

    /// Work out which pending rows reached the file after a failed write
    /// and cut the file back to the last complete one.
    fn recover(&mut self, source: std::io::Error) -> FlushOutcome {
        let total = self.row_ends.len();
        let written = match self.file.metadata() {
            Ok(meta) => meta.len().saturating_sub(self.committed_len) as usize,
            Err(_) => 0,
        };

        let (landed, keep) = if written < self.header_len {
            (0, 0)
        } else {
            let landed = self.row_ends.iter().take_while(|end| **end <= written).count();
            let keep = match landed {
                0 => self.header_len,
                n => self.row_ends[n - 1],
            };
            (landed, keep)
        };

        let boundary = self.committed_len + keep as u64;
        if written > keep {
            if let Err(e) = self.file.set_len(boundary) {
                warn!(
                    sensor = %self.sensor,
                    path = ?self.path,
                    error = %e,
                    "Cannot truncate partial row after failed write"
                );
            }
        }
        self.committed_len = boundary;
        if keep >= self.header_len {
            self.header_len = 0;
        }

        FlushOutcome {
            persisted: landed as u64,
            failed: (total - landed) as u64,
            error: Some(PersistenceError::Io(source)),
        }
    }

    /// Flush and sync to disk. Returns the final flush and the rows written
    /// through this handle.
    pub fn close(mut self) -> (FlushOutcome, u64) {
        let mut outcome = self.flush();
        if outcome.error.is_none() {
            if let Err(e) = self.file.sync_all() {
                outcome.error = Some(PersistenceError::Io(e));
            }
        }
        debug!(
            sensor = %self.sensor,
            path = ?self.path,
            rows = self.rows,
            "Store closed"
        );
        (outcome, self.rows)
    }
}

pub fn file_name(sensor: &SensorType) -> String {
    format!("{}_data.csv", sensor.file_stem())
}

/// Render one sample as a CSV row matching `sensor.columns()`.
pub fn encode_row(sample: &Sample, out: &mut String) -> Result<(), PersistenceError> {
    use std::fmt::Write as _;

    // Writing to a String cannot fail
    let _ = match &sample.payload {
        Payload::Fsr { force, raw } => write!(
            out,
            "{},{},{},{},{}",
            sample.timestamp, sample.sequence, sample.producer, force, raw
        ),
        Payload::Accelerometer { x, y, z } => write!(
            out,
            "{},{},{},{},{},{}",
            sample.timestamp, sample.sequence, sample.producer, x, y, z
        ),
        Payload::Microphone {
            rms_left,
            rms_right,
        } => write!(
            out,
            "{},{},{},{},{}",
            sample.timestamp, sample.sequence, sample.producer, rms_left, rms_right
        ),
        Payload::Generic(fields) => {
            let mut data = fields.clone();
            data.insert("sequence".to_string(), Value::from(sample.sequence));
            data.insert("producer".to_string(), Value::from(sample.producer));
            let json = serde_json::to_string(&data)?;
            write!(out, "{},{}", sample.timestamp, csv_escape(&json))
        }
    };
    Ok(())
}

/// Quote a CSV field if it contains a delimiter, quote or line break.
pub fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
