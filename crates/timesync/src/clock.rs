use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClockError;
use crate::reference::{OffsetSample, TimeReference};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Local wall clock in nanoseconds since the Unix epoch.
#[inline]
pub fn local_nanos() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

/// Snapshot of the clock discipline for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ClockStatus {
    pub offset_secs: f64,
    pub synced: bool,
    /// Disciplined epoch seconds of the last successful sync.
    pub last_sync: Option<f64>,
    pub reference: Option<String>,
}

/// Process-wide disciplined clock.
///
/// Readers never block: the offset is a single atomic, replaced wholesale by
/// the refresh task.
pub struct ClockSync {
    offset_nanos: AtomicI64,
    synced: AtomicBool,
    /// Local epoch nanos of the last good sync, 0 if never synced
    last_sync_nanos: AtomicI64,
    jump_threshold: Duration,
    reference_name: std::sync::Mutex<Option<String>>,
}

impl ClockSync {
    pub fn new(jump_threshold: Duration) -> Self {
        Self {
            offset_nanos: AtomicI64::new(0),
            synced: AtomicBool::new(false),
            last_sync_nanos: AtomicI64::new(0),
            jump_threshold,
            reference_name: std::sync::Mutex::new(None),
        }
    }

    /// Clock with a fixed offset, already marked as synced.
    pub fn with_offset(offset: Duration, negative: bool) -> Self {
        let clock = Self::new(Duration::from_secs(1));
        let nanos = offset.as_nanos() as i64;
        clock
            .offset_nanos
            .store(if negative { -nanos } else { nanos }, Ordering::Release);
        clock.synced.store(true, Ordering::Release);
        clock
    }

    /// Disciplined time in nanoseconds since the Unix epoch.
    #[inline]
    pub fn now_nanos(&self) -> i64 {
        local_nanos() + self.offset_nanos.load(Ordering::Acquire)
    }

    /// Disciplined time in epoch seconds.
    #[inline]
    pub fn now(&self) -> f64 {
        self.now_nanos() as f64 / NANOS_PER_SEC
    }

    /// Undisciplined local time in epoch seconds.
    #[inline]
    pub fn local_time(&self) -> f64 {
        local_nanos() as f64 / NANOS_PER_SEC
    }

    pub fn offset_nanos(&self) -> i64 {
        self.offset_nanos.load(Ordering::Acquire)
    }

    pub fn offset_secs(&self) -> f64 {
        self.offset_nanos() as f64 / NANOS_PER_SEC
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ClockStatus {
        let last = self.last_sync_nanos.load(Ordering::Acquire);
        let reference = match self.reference_name.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        ClockStatus {
            offset_secs: self.offset_secs(),
            synced: self.is_synced(),
            last_sync: (last != 0).then(|| (last + self.offset_nanos()) as f64 / NANOS_PER_SEC),
            reference,
        }
    }

    /// Install a measured offset. Returns the size of the change when it
    /// exceeded the jump threshold; the offset is applied either way.
    pub fn apply(&self, sample: OffsetSample) -> Option<Duration> {
        let previous = self.offset_nanos.swap(sample.offset_nanos, Ordering::AcqRel);
        let was_synced = self.synced.swap(true, Ordering::AcqRel);
        self.last_sync_nanos.store(local_nanos(), Ordering::Release);

        let delta = Duration::from_nanos(previous.abs_diff(sample.offset_nanos));
        if was_synced && delta > self.jump_threshold {
            Some(delta)
        } else {
            None
        }
    }

    /// One exchange with `reference`. On failure the current offset stays.
    pub async fn sync_once(&self, reference: &dyn TimeReference) -> Result<OffsetSample, ClockError> {
        let sample = reference.measure().await?;

        if let Some(jump) = self.apply(sample) {
            warn!(
                reference = %reference.name(),
                jump_ms = jump.as_secs_f64() * 1000.0,
                offset_secs = self.offset_secs(),
                "Clock offset jumped"
            );
        }
        debug!(
            reference = %reference.name(),
            offset_secs = self.offset_secs(),
            round_trip_ms = sample.round_trip.as_secs_f64() * 1000.0,
            "Clock synced"
        );

        let mut name = match self.reference_name.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *name = Some(reference.name().to_string());

        Ok(sample)
    }

    /// Startup sync. A missing or unreachable reference leaves the offset at
    /// zero and the clock unsynced; it never fails startup.
    pub async fn initialize(&self, reference: Option<&dyn TimeReference>) -> bool {
        let Some(reference) = reference else {
            warn!("No time reference configured, running on local clock (degraded accuracy)");
            return false;
        };

        match self.sync_once(reference).await {
            Ok(_) => {
                info!(
                    reference = %reference.name(),
                    offset_secs = self.offset_secs(),
                    "Time reference sync successful"
                );
                true
            }
            Err(e) => {
                warn!(
                    reference = %reference.name(),
                    error = %e,
                    "Time reference unreachable, using offset 0 (degraded accuracy)"
                );
                false
            }
        }
    }

    /// Refresh the offset every `period` until cancelled. Failed refreshes
    /// keep the last good offset.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        reference: Arc<dyn TimeReference>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let clock = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; startup already synced.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = clock.sync_once(reference.as_ref()).await {
                            warn!(
                                reference = %reference.name(),
                                error = %e,
                                offset_secs = clock.offset_secs(),
                                synced = clock.is_synced(),
                                "Clock refresh failed, keeping last offset"
                            );
                        }
                    }
                }
            }
            debug!("Clock refresh task stopped");
        })
    }
}
