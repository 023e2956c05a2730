use std::time::Duration;
use thiserror::Error;

use sensorhub_protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("hub closed the connection before acknowledging")]
    Closed,

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("frame serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
