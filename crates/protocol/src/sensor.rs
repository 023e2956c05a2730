//! Sensor type tags and their strongly-typed payloads
//!
//! The type is fixed at handshake; every later frame on the connection is
//! decoded with the payload shape of that type.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ProtocolError;

/// Sensor type announced in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SensorType {
    Fsr,
    Accelerometer,
    Microphone,
    /// Unrecognized type, normalised to `[a-z0-9_-]` for file naming.
    Generic(String),
}

const FSR_COLUMNS: &[&str] = &["timestamp", "sequence", "producer", "force", "raw"];
const ACCELEROMETER_COLUMNS: &[&str] = &["timestamp", "sequence", "producer", "x", "y", "z"];
const MICROPHONE_COLUMNS: &[&str] = &["timestamp", "sequence", "producer", "rms_left", "rms_right"];
const GENERIC_COLUMNS: &[&str] = &["timestamp", "data"];

impl SensorType {
    /// Parse a handshake type token. Matching is case-insensitive and accepts
    /// the short aliases older producers still send.
    pub fn from_token(token: &str) -> Result<Self, ProtocolError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ProtocolError::EmptySensorType);
        }

        let upper = token.to_ascii_uppercase();
        let sensor = match upper.as_str() {
            "FSR" => SensorType::Fsr,
            "ACCELEROMETER" | "ACCEL" | "IMU" => SensorType::Accelerometer,
            "MICROPHONE" | "MIC" | "AUDIO" => SensorType::Microphone,
            _ => SensorType::Generic(normalise_generic(token)),
        };
        Ok(sensor)
    }

    /// Canonical tag as sent on the wire and reported in status output.
    pub fn tag(&self) -> &str {
        match self {
            SensorType::Fsr => "FSR",
            SensorType::Accelerometer => "ACCELEROMETER",
            SensorType::Microphone => "MICROPHONE",
            SensorType::Generic(name) => name,
        }
    }

    /// Lower-case stem used for the per-session store file name.
    pub fn file_stem(&self) -> String {
        self.tag().to_ascii_lowercase()
    }

    /// Column header of this type's store. Unknown types share a two-column
    /// layout with the frame serialised into `data`.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            SensorType::Fsr => FSR_COLUMNS,
            SensorType::Accelerometer => ACCELEROMETER_COLUMNS,
            SensorType::Microphone => MICROPHONE_COLUMNS,
            SensorType::Generic(_) => GENERIC_COLUMNS,
        }
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, SensorType::Generic(_))
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Serialize for SensorType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

fn normalise_generic(token: &str) -> String {
    token
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Decoded sensor-specific fields of one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Fsr { force: f64, raw: i64 },
    Accelerometer { x: f64, y: f64, z: f64 },
    Microphone { rms_left: f64, rms_right: f64 },
    Generic(Map<String, Value>),
}

#[derive(Deserialize)]
struct FsrFields {
    force: f64,
    raw: i64,
}

#[derive(Deserialize)]
struct AccelerometerFields {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Deserialize)]
struct MicrophoneFields {
    rms_left: f64,
    rms_right: f64,
}

impl Payload {
    /// Decode the remaining frame fields with the shape fixed for `sensor`.
    /// Extra fields are ignored; missing or mistyped required fields reject
    /// the frame.
    pub fn decode(sensor: &SensorType, fields: Map<String, Value>) -> Result<Self, ProtocolError> {
        let reject = |e: serde_json::Error| ProtocolError::InvalidPayload {
            sensor: sensor.tag().to_string(),
            reason: e.to_string(),
        };

        match sensor {
            SensorType::Fsr => {
                let f: FsrFields = serde_json::from_value(Value::Object(fields)).map_err(reject)?;
                Ok(Payload::Fsr {
                    force: f.force,
                    raw: f.raw,
                })
            }
            SensorType::Accelerometer => {
                let f: AccelerometerFields =
                    serde_json::from_value(Value::Object(fields)).map_err(reject)?;
                Ok(Payload::Accelerometer {
                    x: f.x,
                    y: f.y,
                    z: f.z,
                })
            }
            SensorType::Microphone => {
                let f: MicrophoneFields =
                    serde_json::from_value(Value::Object(fields)).map_err(reject)?;
                Ok(Payload::Microphone {
                    rms_left: f.rms_left,
                    rms_right: f.rms_right,
                })
            }
            SensorType::Generic(_) => Ok(Payload::Generic(fields)),
        }
    }
}
