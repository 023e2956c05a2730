//! Stale producer detection
//!
//! A producer is stale when nothing (data or heartbeat) has arrived for
//! longer than the threshold. Sockets are left alone; the tracker only
//! reports transitions.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::StatusEvent;
use crate::state::HubState;

pub struct LivenessTracker {
    state: Arc<HubState>,
    scan_interval: Duration,
    stale_after: Duration,
}

impl LivenessTracker {
    pub fn new(state: Arc<HubState>, scan_interval: Duration, stale_after: Duration) -> Self {
        Self {
            state,
            scan_interval,
            stale_after,
        }
    }

    /// One pass over the producer table at disciplined time `now_nanos`.
    /// Returns the transitions found, already published.
    pub fn scan(&self, now_nanos: i64) -> Vec<StatusEvent> {
        let threshold = self.stale_after.as_nanos() as i64;
        let mut transitions = Vec::new();

        for producer in self.state.producers.list() {
            let silent = now_nanos - producer.last_seen_nanos();
            let stale = silent > threshold;

            if stale && !producer.swap_stale(true) {
                transitions.push(StatusEvent::Stale {
                    producer: producer.id(),
                    sensor: producer.sensor().clone(),
                    silent_secs: silent as f64 / 1_000_000_000.0,
                });
            } else if !stale && producer.swap_stale(false) {
                transitions.push(StatusEvent::Recovered {
                    producer: producer.id(),
                    sensor: producer.sensor().clone(),
                });
            }
        }

        for event in &transitions {
            self.state.events.publish(event.clone());
        }
        transitions
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan(self.state.clock.now_nanos());
                }
            }
        }
        debug!("Liveness tracker stopped");
    }
}
