//! sensorhub-protocol: Producer wire protocol
//!
//! Line-delimited UTF-8 over TCP. A producer opens with `SENSOR:<type>\n`,
//! the hub answers with one JSON ack line, then every further line is one
//! JSON data frame for the sensor type fixed at handshake.

pub mod error;
pub mod frame;
pub mod framer;
pub mod handshake;
pub mod sensor;

pub use error::ProtocolError;
pub use frame::{decode_frame, DataFrame, Frame};
pub use framer::LineFramer;
pub use handshake::{
    format_handshake, parse_handshake, HandshakeAck, ACK_STATUS_CONNECTED, HANDSHAKE_PREFIX,
    MAX_HANDSHAKE_LEN,
};
pub use sensor::{Payload, SensorType};
