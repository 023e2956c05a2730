//! Hub assembly and lifecycle
//!
//! Startup order: data directory, listener socket, clock, sessions, writers,
//! background tasks. Shutdown runs in reverse: stop accepting and reading,
//! let writers drain within the grace period, then close the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use sensorhub_timesync::{ClockSync, SntpReference, TimeReference};

use crate::config::HubConfig;
use crate::dispatch::Dispatcher;
use crate::error::HubError;
use crate::events::{EventBus, StatusEvent};
use crate::listener::{self, ConnectionListener};
use crate::liveness::LivenessTracker;
use crate::session::SessionManager;
use crate::state::HubState;
use crate::stats::run_stats;
use crate::store::FlushPolicy;
use crate::tasks::TaskGroup;
use crate::writer::WriterConfig;

/// What happened to in-flight work during shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Readers still running when the grace period ran out
    pub readers_abandoned: bool,
    pub writers_abandoned: bool,
    /// Samples discarded after writers stopped
    pub discarded: u64,
}

/// A running hub.
pub struct Hub {
    state: Arc<HubState>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    writer_stop: CancellationToken,
    connections: TaskGroup,
    writers: TaskGroup,
    background: TaskTracker,
}

impl Hub {
    /// Start with the SNTP reference from `config.clock` (or none when
    /// disabled).
    pub async fn start(config: HubConfig) -> Result<Self, HubError> {
        let reference: Option<Arc<dyn TimeReference>> = if config.clock.enabled {
            Some(Arc::new(SntpReference::new(
                config.clock.server.clone(),
                config.clock.timeout,
            )))
        } else {
            None
        };
        Self::start_with_reference(config, reference).await
    }

    pub async fn start_with_reference(
        config: HubConfig,
        reference: Option<Arc<dyn TimeReference>>,
    ) -> Result<Self, HubError> {
        config.validate()?;

        std::fs::create_dir_all(&config.storage.data_dir).map_err(|source| HubError::DataDir {
            path: config.storage.data_dir.clone(),
            source,
        })?;

        let tcp = listener::bind(config.listener.bind).await?;
        let local_addr = tcp.local_addr()?;

        let clock = Arc::new(ClockSync::new(config.clock.jump_threshold));
        clock.initialize(reference.as_deref()).await;

        let events = EventBus::default();
        let sessions = Arc::new(SessionManager::new(
            config.storage.data_dir.clone(),
            FlushPolicy {
                every: config.storage.flush_every,
                interval: config.storage.flush_interval,
            },
            events.clone(),
        ));
        if config.session.auto_start {
            sessions.start()?;
        }

        let writers = TaskGroup::new();
        let writer_stop = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            config.pipeline.queue_capacity,
            WriterConfig {
                batch_size: config.pipeline.batch_size,
                poll_timeout: config.pipeline.poll_timeout,
                drain_budget: config.shutdown.grace_period,
            },
            Arc::clone(&sessions),
            writers.clone(),
            writer_stop.clone(),
        );

        let cancel = CancellationToken::new();
        let background = TaskTracker::new();
        if let Some(reference) = reference {
            let refresh =
                clock.spawn_refresh(reference, config.clock.refresh_interval, cancel.clone());
            background.spawn(async move {
                let _ = refresh.await;
            });
        }

        let state = Arc::new(HubState::new(
            config.clone(),
            Arc::clone(&clock),
            sessions,
            dispatcher,
            events,
        ));
        state.refresh_gauges();

        let connections = TaskGroup::new();
        let listener = ConnectionListener::new(tcp, Arc::clone(&state), connections.clone());
        // Accepting before the task first polls, so /ready is accurate as
        // soon as start returns.
        state.set_accepting(true);
        background.spawn(listener.run(cancel.clone()));

        let tracker = LivenessTracker::new(
            Arc::clone(&state),
            config.liveness.scan_interval,
            config.liveness.stale_after,
        );
        background.spawn(tracker.run(cancel.clone()));
        background.spawn(run_stats(
            Arc::clone(&state),
            config.stats.interval,
            cancel.clone(),
        ));

        info!(
            addr = %local_addr,
            data_dir = ?config.storage.data_dir,
            session = ?state.sessions.current(),
            clock_synced = clock.is_synced(),
            "Hub started"
        );

        Ok(Self {
            state,
            local_addr,
            cancel,
            writer_stop,
            connections,
            writers,
            background,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<HubState> {
        Arc::clone(&self.state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.state.events.subscribe()
    }

    /// Token cancelled at the start of shutdown; share it with sibling
    /// services (e.g. the HTTP server).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting, end readers, drain writers and close the session,
    /// all within `grace`.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();

        info!(grace_secs = grace.as_secs_f64(), "Hub shutting down");
        self.state.set_accepting(false);
        self.cancel.cancel();

        self.background.close();
        self.connections.close();
        if tokio::time::timeout_at(deadline, self.connections.wait())
            .await
            .is_err()
        {
            let aborted = self.connections.abort_all();
            warn!(aborted, "Readers did not stop within grace period, aborting");
            report.readers_abandoned = true;
        }

        // Readers are done, so nothing new reaches the queues.
        self.writer_stop.cancel();
        self.writers.close();
        if tokio::time::timeout_at(deadline, self.writers.wait())
            .await
            .is_err()
        {
            let aborted = self.writers.abort_all();
            warn!(
                aborted,
                "Writers did not finish draining within grace period, aborting"
            );
            report.writers_abandoned = true;
        }

        report.discarded = self.state.dispatcher.discard_remaining();
        self.state.sessions.stop();

        let _ = tokio::time::timeout_at(deadline, self.background.wait()).await;

        info!(
            discarded = report.discarded,
            readers_abandoned = report.readers_abandoned,
            writers_abandoned = report.writers_abandoned,
            "Hub stopped"
        );
        report
    }
}
