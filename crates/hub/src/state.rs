//! State shared by the listener, ingestion workers, tracker and HTTP surface

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use sensorhub_timesync::{ClockStatus, ClockSync};

use crate::config::HubConfig;
use crate::dispatch::{Dispatcher, SensorStatus};
use crate::error::SessionError;
use crate::events::EventBus;
use crate::metrics;
use crate::producer::{ProducerSnapshot, ProducerTable};
use crate::session::{SessionInfo, SessionManager};

pub struct HubState {
    pub config: HubConfig,
    pub clock: Arc<ClockSync>,
    pub producers: ProducerTable,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Dispatcher,
    pub events: EventBus,
    rejected: AtomicU64,
    accepting: AtomicBool,
}

/// Full `/status` document.
#[derive(Debug, Serialize)]
pub struct HubStatus {
    pub accepting: bool,
    pub rejected_connections: u64,
    pub producers: Vec<ProducerSnapshot>,
    pub sensors: Vec<SensorStatus>,
    pub session: Option<SessionInfo>,
    pub clock: ClockStatus,
}

/// Reply of the session control endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReply {
    pub status: &'static str,
    pub session: Option<String>,
    pub active: bool,
}

impl SessionReply {
    fn success(session: Option<String>) -> Self {
        Self {
            status: "success",
            active: session.is_some(),
            session,
        }
    }
}

impl HubState {
    pub fn new(
        config: HubConfig,
        clock: Arc<ClockSync>,
        sessions: Arc<SessionManager>,
        dispatcher: Dispatcher,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            clock,
            producers: ProducerTable::new(),
            sessions,
            dispatcher,
            events,
            rejected: AtomicU64::new(0),
            accepting: AtomicBool::new(false),
        }
    }

    pub fn record_rejected(&self) -> u64 {
        metrics::inc_connections_rejected();
        self.rejected.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn rejected_connections(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            accepting: self.is_accepting(),
            rejected_connections: self.rejected_connections(),
            producers: self.producers.snapshot(),
            sensors: self.dispatcher.status(),
            session: self.sessions.info(),
            clock: self.clock.status(),
        }
    }

    pub fn session(&self) -> SessionReply {
        SessionReply::success(self.sessions.current())
    }

    /// Start a session; an active one is closed first.
    pub fn start_session(&self) -> Result<SessionReply, SessionError> {
        let id = self.sessions.start()?;
        Ok(SessionReply::success(Some(id)))
    }

    /// Stop the active session. Stopping when none is active is a no-op.
    pub fn stop_session(&self) -> SessionReply {
        self.sessions.stop();
        SessionReply::success(None)
    }

    /// Push clock gauges before a scrape.
    pub fn refresh_gauges(&self) {
        metrics::set_clock(self.clock.offset_secs(), self.clock.is_synced());
        metrics::set_producers_active(self.producers.len());
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_replies() {
        let dir = TempDir::new().unwrap();
        let (state, _stop) = test_support::state(dir.path());

        let current = state.session();
        assert!(current.active);
        assert_eq!(current.status, "success");

        let stopped = state.stop_session();
        assert_eq!(
            stopped,
            SessionReply {
                status: "success",
                session: None,
                active: false
            }
        );
        // Idempotent
        assert_eq!(state.stop_session(), stopped);

        let started = state.start_session().unwrap();
        assert!(started.active);
        assert_eq!(started.session, state.sessions.current());
    }

    #[test]
    fn test_rejected_counter_is_per_hub() {
        let dir = TempDir::new().unwrap();
        let (state, _stop) = test_support::state(dir.path());
        assert_eq!(state.record_rejected(), 1);
        assert_eq!(state.record_rejected(), 2);
        assert_eq!(state.status().rejected_connections, 2);
    }
}
