use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::sensor::SensorType;

pub const HANDSHAKE_PREFIX: &str = "SENSOR:";

/// Longest handshake line accepted, excluding the newline.
pub const MAX_HANDSHAKE_LEN: usize = 256;

pub const ACK_STATUS_CONNECTED: &str = "connected";

/// Parse one handshake line (newline already stripped).
pub fn parse_handshake(line: &[u8]) -> Result<SensorType, ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::NotUtf8)?;
    let text = text.trim();
    let token = text
        .strip_prefix(HANDSHAKE_PREFIX)
        .ok_or(ProtocolError::MissingPrefix)?;
    SensorType::from_token(token)
}

/// Handshake line a producer sends, including the newline.
pub fn format_handshake(sensor: &SensorType) -> String {
    format!("{}{}\n", HANDSHAKE_PREFIX, sensor.tag())
}

/// Hub reply to a successful handshake. `ntp_time` is the hub's disciplined
/// clock, `server_time` its raw local clock, both in epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub status: String,
    pub ntp_time: f64,
    pub server_time: f64,
}

impl HandshakeAck {
    pub fn connected(ntp_time: f64, server_time: f64) -> Self {
        Self {
            status: ACK_STATUS_CONNECTED.to_string(),
            ntp_time,
            server_time,
        }
    }

    /// Encode as one JSON line terminated by `\n`.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut line =
            serde_json::to_vec(self).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode an ack line and require `status == "connected"`.
    pub fn decode(line: &[u8]) -> Result<Self, ProtocolError> {
        let ack: HandshakeAck = serde_json::from_slice(trim_line(line))
            .map_err(|e| ProtocolError::InvalidAck(e.to_string()))?;
        if ack.status != ACK_STATUS_CONNECTED {
            return Err(ProtocolError::InvalidAck(format!("status {}", ack.status)));
        }
        Ok(ack)
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake() {
        assert_eq!(parse_handshake(b"SENSOR:FSR").unwrap(), SensorType::Fsr);
        assert_eq!(
            parse_handshake(b"SENSOR:MICROPHONE\r").unwrap(),
            SensorType::Microphone
        );
    }

    #[test]
    fn test_parse_handshake_requires_prefix() {
        assert_eq!(
            parse_handshake(b"HELLO:FSR"),
            Err(ProtocolError::MissingPrefix)
        );
        assert_eq!(
            parse_handshake(b"SENSOR:"),
            Err(ProtocolError::EmptySensorType)
        );
    }

    #[test]
    fn test_parse_handshake_rejects_invalid_utf8() {
        assert_eq!(
            parse_handshake(&[b'S', 0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        );
    }

    #[test]
    fn test_format_handshake() {
        assert_eq!(format_handshake(&SensorType::Accelerometer), "SENSOR:ACCELEROMETER\n");
    }

    #[test]
    fn test_ack_wire_shape() {
        let ack = HandshakeAck::connected(1700000000.5, 1700000000.25);
        let line = ack.encode().unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');

        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["status"], "connected");
        assert_eq!(value["ntp_time"], 1700000000.5);
        assert_eq!(value["server_time"], 1700000000.25);

        assert_eq!(HandshakeAck::decode(&line).unwrap(), ack);
    }

    #[test]
    fn test_ack_decode_rejects_other_status() {
        let err = HandshakeAck::decode(br#"{"status":"busy","ntp_time":1.0,"server_time":1.0}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAck(_)));
    }

    #[test]
    fn test_ack_decode_rejects_legacy_ready() {
        assert!(HandshakeAck::decode(b"READY\n").is_err());
    }
}
