//! Periodic summary of per-type and per-producer counters

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::HubState;

pub async fn run_stats(state: Arc<HubState>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => log_summary(&state),
        }
    }
}

pub fn log_summary(state: &HubState) {
    state.refresh_gauges();

    info!(
        producers = state.producers.len(),
        rejected = state.rejected_connections(),
        session = ?state.sessions.current(),
        clock_offset_secs = state.clock.offset_secs(),
        clock_synced = state.clock.is_synced(),
        "stats"
    );

    for sensor in state.dispatcher.status() {
        info!(
            sensor = %sensor.sensor,
            received = sensor.counters.received,
            persisted = sensor.counters.persisted,
            dropped = sensor.counters.dropped,
            malformed = sensor.counters.malformed,
            queued = sensor.queued,
            "sensor stats"
        );
    }

    for producer in state.producers.snapshot() {
        info!(
            producer = producer.id,
            sensor = %producer.sensor,
            address = %producer.address,
            samples = producer.samples,
            errors = producer.errors,
            dropped = producer.dropped,
            stale = producer.stale,
            "producer stats"
        );
    }
}
