use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("handshake missing SENSOR: prefix")]
    MissingPrefix,
    #[error("handshake carries an empty sensor type")]
    EmptySensorType,
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("line is not valid UTF-8")]
    NotUtf8,
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("invalid {field} field: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("{sensor} payload rejected: {reason}")]
    InvalidPayload { sensor: String, reason: String },
    #[error("unexpected ack: {0}")]
    InvalidAck(String),
}
