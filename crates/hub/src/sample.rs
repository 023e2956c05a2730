use sensorhub_protocol::{Payload, SensorType};

use crate::producer::ProducerId;

/// One accepted reading, timestamped and sequenced. Moves from the ingestion
/// worker through its type's queue to exactly one writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub sensor: SensorType,
    pub producer: ProducerId,
    /// Disciplined epoch seconds
    pub timestamp: f64,
    pub sequence: u64,
    pub payload: Payload,
}
