//! JSON-line data frame decoding

use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::sensor::{Payload, SensorType};

const HEARTBEAT_TYPE: &str = "heartbeat";

/// One decoded line from a producer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Keep-alive; refreshes liveness, carries no sample.
    Heartbeat,
    Data(DataFrame),
}

/// Data frame before the hub fills in missing timestamp/sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    /// Producer-supplied epoch seconds. `None` when absent, null or zero.
    pub timestamp: Option<f64>,
    pub sequence: Option<u64>,
    pub payload: Payload,
}

/// Decode one frame line for a connection whose type is `sensor`.
pub fn decode_frame(line: &[u8], sensor: &SensorType) -> Result<Frame, ProtocolError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let mut fields = match value {
        Value::Object(map) => map,
        _ => return Err(ProtocolError::NotAnObject),
    };

    if fields.get("type").and_then(Value::as_str) == Some(HEARTBEAT_TYPE) {
        return Ok(Frame::Heartbeat);
    }

    let timestamp = take_timestamp(&mut fields)?;
    let sequence = take_sequence(&mut fields)?;
    let payload = Payload::decode(sensor, fields)?;

    Ok(Frame::Data(DataFrame {
        timestamp,
        sequence,
        payload,
    }))
}

fn take_timestamp(fields: &mut Map<String, Value>) -> Result<Option<f64>, ProtocolError> {
    match fields.remove("timestamp") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            // Zero is what unsynced producers send; treat it as absent.
            Some(ts) if ts == 0.0 => Ok(None),
            Some(ts) => Ok(Some(ts)),
            None => Err(ProtocolError::InvalidField {
                field: "timestamp",
                reason: format!("{} is not representable", n),
            }),
        },
        Some(other) => Err(ProtocolError::InvalidField {
            field: "timestamp",
            reason: format!("expected number, got {}", other),
        }),
    }
}

fn take_sequence(fields: &mut Map<String, Value>) -> Result<Option<u64>, ProtocolError> {
    match fields.remove("sequence") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            n.as_u64()
                .map(Some)
                .ok_or_else(|| ProtocolError::InvalidField {
                    field: "sequence",
                    reason: format!("{} is not a non-negative integer", n),
                })
        }
        Some(other) => Err(ProtocolError::InvalidField {
            field: "sequence",
            reason: format!("expected integer, got {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(frame: Frame) -> DataFrame {
        match frame {
            Frame::Data(d) => d,
            Frame::Heartbeat => panic!("expected data frame"),
        }
    }

    #[test]
    fn test_frame_without_timestamp_or_sequence() {
        let frame = data(decode_frame(br#"{"force":1.23,"raw":456}"#, &SensorType::Fsr).unwrap());
        assert_eq!(frame.timestamp, None);
        assert_eq!(frame.sequence, None);
        assert_eq!(
            frame.payload,
            Payload::Fsr {
                force: 1.23,
                raw: 456
            }
        );
    }

    #[test]
    fn test_frame_keeps_explicit_values() {
        let frame = data(
            decode_frame(
                br#"{"timestamp":1700000000.125,"sequence":42,"x":0.1,"y":-0.2,"z":9.8}"#,
                &SensorType::Accelerometer,
            )
            .unwrap(),
        );
        assert_eq!(frame.timestamp, Some(1700000000.125));
        assert_eq!(frame.sequence, Some(42));
    }

    #[test]
    fn test_zero_and_null_timestamp_are_absent() {
        let f = data(
            decode_frame(
                br#"{"timestamp":0,"rms_left":0.1,"rms_right":0.2}"#,
                &SensorType::Microphone,
            )
            .unwrap(),
        );
        assert_eq!(f.timestamp, None);

        let f = data(
            decode_frame(
                br#"{"timestamp":null,"rms_left":0.1,"rms_right":0.2}"#,
                &SensorType::Microphone,
            )
            .unwrap(),
        );
        assert_eq!(f.timestamp, None);
    }

    #[test]
    fn test_heartbeat_frame() {
        assert_eq!(
            decode_frame(br#"{"type":"heartbeat"}"#, &SensorType::Fsr).unwrap(),
            Frame::Heartbeat
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            decode_frame(b"not json", &SensorType::Fsr),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            decode_frame(b"[1,2,3]", &SensorType::Fsr),
            Err(ProtocolError::NotAnObject)
        );
        assert!(matches!(
            decode_frame(br#"{"force":1.0}"#, &SensorType::Fsr),
            Err(ProtocolError::InvalidPayload { .. })
        ));
        assert!(matches!(
            decode_frame(br#"{"sequence":-1,"force":1.0,"raw":2}"#, &SensorType::Fsr),
            Err(ProtocolError::InvalidField {
                field: "sequence",
                ..
            })
        ));
        assert!(matches!(
            decode_frame(br#"{"timestamp":"now","force":1.0,"raw":2}"#, &SensorType::Fsr),
            Err(ProtocolError::InvalidField {
                field: "timestamp",
                ..
            })
        ));
    }

    #[test]
    fn test_generic_frame_strips_hub_fields() {
        let sensor = SensorType::from_token("chair").unwrap();
        let frame = data(decode_frame(br#"{"sequence":7,"seat":1}"#, &sensor).unwrap());
        assert_eq!(frame.sequence, Some(7));
        match frame.payload {
            Payload::Generic(map) => {
                assert!(!map.contains_key("sequence"));
                assert!(map.contains_key("seat"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
