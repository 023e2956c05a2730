//! sensorhub-hub: Sensor telemetry hub
//!
//! Producers connect over TCP, announce their sensor type, and stream JSON
//! frames. Every sample is stamped on one disciplined clock, queued per
//! sensor type, and appended to the active session's CSV store by a
//! dedicated writer.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod hub;
pub mod ingest;
pub mod listener;
pub mod liveness;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod sample;
pub mod server;
pub mod session;
pub mod state;
pub mod stats;
pub mod store;
pub mod tasks;
pub mod writer;

pub use config::HubConfig;
pub use error::{HubError, IngestError, PersistenceError, SessionError};
pub use events::{EventBus, StatusEvent};
pub use hub::{Hub, ShutdownReport};
pub use sample::Sample;
pub use server::{create_router, run_server};
pub use state::{HubState, HubStatus, SessionReply};
