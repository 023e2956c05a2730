use async_trait::async_trait;
use std::time::Duration;

use crate::error::ClockError;

/// Result of one exchange with a time reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    /// `reference_time - local_time` in nanoseconds.
    pub offset_nanos: i64,
    pub round_trip: Duration,
}

/// External time reference the disciplined clock is steered against.
#[async_trait]
pub trait TimeReference: Send + Sync {
    /// Human-readable name for logs (e.g. the server address).
    fn name(&self) -> &str;

    /// Perform one exchange and report the measured offset.
    async fn measure(&self) -> Result<OffsetSample, ClockError>;
}
