//! Session lifecycle and the per-type stores of the active session
//!
//! At most one session is active. Starting a session while one is open
//! closes the old one first under the same lock, so writers see either the
//! old session or the new one and never a gap.

use chrono::Local;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, warn};

use sensorhub_protocol::SensorType;

use crate::error::{PersistenceError, SessionError};
use crate::events::{EventBus, StatusEvent};
use crate::metrics::{DropReason, SensorMetrics};
use crate::sample::Sample;
use crate::store::{FlushOutcome, FlushPolicy, TypeStore};

const SESSION_DIR_PREFIX: &str = "session_";

struct ActiveSession {
    id: String,
    dir: PathBuf,
    started_at: String,
    stores: HashMap<SensorType, TypeStore>,
    /// Types whose store could not be opened; retried on the next batch
    failed_opens: HashMap<SensorType, u64>,
}

/// Rows settled by one call. `persisted` counts rows that reached the file
/// during the call, which may include rows buffered by earlier batches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub persisted: u64,
    pub no_session: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub dir: PathBuf,
    pub started_at: String,
    pub stores: Vec<StoreInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub sensor: SensorType,
    pub path: PathBuf,
    pub rows: u64,
}

impl AppendOutcome {
    fn absorb(&mut self, flush: &FlushOutcome) {
        self.persisted += flush.persisted;
        self.failed += flush.failed;
    }
}

pub struct SessionManager {
    data_dir: PathBuf,
    policy: FlushPolicy,
    events: EventBus,
    active: Mutex<Option<ActiveSession>>,
    metrics: Mutex<HashMap<SensorType, SensorMetrics>>,
}

impl SessionManager {
    pub fn new(data_dir: PathBuf, policy: FlushPolicy, events: EventBus) -> Self {
        Self {
            data_dir,
            policy,
            events,
            active: Mutex::new(None),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Counters that settled rows of `sensor` are recorded against,
    /// including rows flushed when a session closes.
    pub fn register_metrics(&self, sensor: &SensorType, metrics: SensorMetrics) {
        let mut registry = match self.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.insert(sensor.clone(), metrics);
    }

    fn record(&self, sensor: &SensorType, outcome: AppendOutcome) {
        let registry = match self.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(metrics) = registry.get(sensor) {
            metrics.inc_persisted(outcome.persisted);
            metrics.inc_dropped(DropReason::NoSession, outcome.no_session);
            metrics.inc_dropped(DropReason::WriteError, outcome.failed);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Start a new session, closing the active one first. Returns the new id.
    pub fn start(&self) -> Result<String, SessionError> {
        let mut active = self.lock();
        if let Some(previous) = active.take() {
            self.close_session(previous);
        }

        let (id, dir) = self.allocate_dir()?;
        *active = Some(ActiveSession {
            id: id.clone(),
            dir,
            started_at: Local::now().to_rfc3339(),
            stores: HashMap::new(),
            failed_opens: HashMap::new(),
        });
        self.events.publish(StatusEvent::SessionStarted {
            session: id.clone(),
        });
        Ok(id)
    }

    /// Stop the active session. Returns the id that was stopped, or `None`
    /// if nothing was active.
    pub fn stop(&self) -> Option<String> {
        let previous = self.lock().take()?;
        let id = previous.id.clone();
        self.close_session(previous);
        Some(id)
    }

    pub fn current(&self) -> Option<String> {
        self.lock().as_ref().map(|s| s.id.clone())
    }

    pub fn current_dir(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|s| s.dir.clone())
    }

    pub fn info(&self) -> Option<SessionInfo> {
        let active = self.lock();
        let session = active.as_ref()?;
        let mut stores: Vec<StoreInfo> = session
            .stores
            .iter()
            .map(|(sensor, store)| StoreInfo {
                sensor: sensor.clone(),
                path: store.path().to_path_buf(),
                rows: store.rows(),
            })
            .collect();
        stores.sort_by(|a, b| a.sensor.tag().cmp(b.sensor.tag()));
        Some(SessionInfo {
            id: session.id.clone(),
            dir: session.dir.clone(),
            started_at: session.started_at.clone(),
            stores,
        })
    }

    /// Append a batch of one sensor type to the active session, in order.
    /// Failed rows are logged and counted; they never stop the batch. The
    /// outcome is also recorded against the registered metrics.
    pub fn append_batch(&self, sensor: &SensorType, samples: &[Sample]) -> AppendOutcome {
        if samples.is_empty() {
            return AppendOutcome::default();
        }
        let outcome = {
            let mut active = self.lock();
            Self::append_locked(active.as_mut(), self.policy, sensor, samples)
        };
        self.record(sensor, outcome);
        outcome
    }

    fn append_locked(
        session: Option<&mut ActiveSession>,
        policy: FlushPolicy,
        sensor: &SensorType,
        samples: &[Sample],
    ) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        let Some(session) = session else {
            outcome.no_session = samples.len() as u64;
            return outcome;
        };
        let id = session.id.clone();

        let store = match session.store_for(sensor, policy) {
            Ok(store) => store,
            Err(e) => {
                error!(
                    sensor = %sensor,
                    error = %e,
                    dropped = samples.len(),
                    "Failed to open store"
                );
                outcome.failed = samples.len() as u64;
                return outcome;
            }
        };

        for sample in samples {
            if let Err(e) = store.append(sample) {
                outcome.failed += 1;
                error!(
                    sensor = %sensor,
                    sequence = sample.sequence,
                    error = %e,
                    "Failed to encode sample"
                );
            }
        }

        let flush = store.flush_if_due();
        log_flush_error(&id, sensor, &flush);
        outcome.absorb(&flush);
        outcome
    }

    /// Time-based flush for a type that has gone quiet.
    pub fn flush_if_due(&self, sensor: &SensorType) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        {
            let mut active = self.lock();
            let Some(session) = active.as_mut() else {
                return outcome;
            };
            if let Some(store) = session.stores.get_mut(sensor) {
                let flush = store.flush_if_due();
                log_flush_error(&session.id, sensor, &flush);
                outcome.absorb(&flush);
            }
        }
        self.record(sensor, outcome);
        outcome
    }

    /// Find a free `session_<YYYYMMDD_HHMMSS>[_n]` directory and create it.
    fn allocate_dir(&self) -> Result<(String, PathBuf), SessionError> {
        std::fs::create_dir_all(&self.data_dir).map_err(|source| SessionError::CreateDir {
            path: self.data_dir.clone(),
            source,
        })?;

        let base = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut suffix = 1u32;
        loop {
            let id = if suffix == 1 {
                base.clone()
            } else {
                format!("{}_{}", base, suffix)
            };
            let dir = self.data_dir.join(format!("{}{}", SESSION_DIR_PREFIX, id));
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(source) => return Err(SessionError::CreateDir { path: dir, source }),
            }
        }
    }

    /// Flush and close every store. SessionStopped reports the rows that
    /// reached disk.
    fn close_session(&self, session: ActiveSession) {
        let mut rows = 0;
        for (sensor, store) in session.stores {
            let (flush, written) = store.close();
            if let Some(e) = &flush.error {
                error!(
                    session = %session.id,
                    sensor = %sensor,
                    error = %e,
                    failed = flush.failed,
                    "Failed to close store"
                );
            }
            rows += written;
            let mut outcome = AppendOutcome::default();
            outcome.absorb(&flush);
            self.record(&sensor, outcome);
        }
        self.events.publish(StatusEvent::SessionStopped {
            session: session.id,
            rows,
        });
    }
}

fn log_flush_error(session: &str, sensor: &SensorType, flush: &FlushOutcome) {
    if let Some(e) = &flush.error {
        error!(
            session = %session,
            sensor = %sensor,
            error = %e,
            persisted = flush.persisted,
            failed = flush.failed,
            "Failed to flush store, buffered rows discarded"
        );
    }
}

impl ActiveSession {
    fn store_for(
        &mut self,
        sensor: &SensorType,
        policy: FlushPolicy,
    ) -> Result<&mut TypeStore, PersistenceError> {
        if !self.stores.contains_key(sensor) {
            match TypeStore::open(&self.dir, sensor, policy) {
                Ok(store) => {
                    self.failed_opens.remove(sensor);
                    self.stores.insert(sensor.clone(), store);
                }
                Err(e) => {
                    let attempts = self.failed_opens.entry(sensor.clone()).or_insert(0);
                    *attempts += 1;
                    if *attempts > 1 {
                        warn!(sensor = %sensor, attempts = *attempts, "Store still cannot be opened");
                    }
                    return Err(e);
                }
            }
        }
        // Inserted above if it was missing
        self.stores
            .get_mut(sensor)
            .ok_or_else(|| PersistenceError::Io(std::io::Error::other("store missing after open")))
    }
}
