//! Hub configuration
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! gives a working hub. Durations are written as `<n><unit>` with units
//! `ms`, `s`, `m`, `h` or `d`.

use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HubError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub listener: ListenerConfig,
    pub clock: ClockConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub session: SessionConfig,
    pub liveness: LivenessConfig,
    pub stats: StatsConfig,
    pub http: HttpConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    #[serde(deserialize_with = "duration_str")]
    pub handshake_timeout: Duration,
    pub max_handshake_len: usize,
    /// Per-read deadline on producer sockets
    #[serde(deserialize_with = "duration_str")]
    pub read_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5555)),
            handshake_timeout: Duration::from_secs(5),
            max_handshake_len: sensorhub_protocol::MAX_HANDSHAKE_LEN,
            read_timeout: Duration::from_secs(1),
            max_frame_len: 65536,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub enabled: bool,
    pub server: String,
    #[serde(deserialize_with = "duration_str")]
    pub timeout: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub refresh_interval: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub jump_threshold: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "pool.ntp.org:123".to_string(),
            timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60 * 60),
            jump_threshold: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Rows appended between flushes
    pub flush_every: usize,
    #[serde(deserialize_with = "duration_str")]
    pub flush_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/sessions"),
            flush_every: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    #[serde(deserialize_with = "duration_str")]
    pub poll_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 64,
            poll_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auto_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { auto_start: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    #[serde(deserialize_with = "duration_str")]
    pub scan_interval: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub stale_after: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    #[serde(deserialize_with = "duration_str")]
    pub interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(deserialize_with = "duration_str")]
    pub grace_period: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self, HubError> {
        let content = std::fs::read_to_string(path)?;
        let config: HubConfig =
            serde_yaml::from_str(&content).map_err(|e| HubError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), HubError> {
        if self.pipeline.queue_capacity == 0 {
            return Err(HubError::Config(
                "pipeline.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.batch_size == 0 {
            return Err(HubError::Config(
                "pipeline.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.storage.flush_every == 0 {
            return Err(HubError::Config(
                "storage.flush_every must be greater than zero".to_string(),
            ));
        }
        if self.listener.max_handshake_len == 0 || self.listener.max_frame_len == 0 {
            return Err(HubError::Config(
                "listener line limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration string like "250ms", "15m", "1h" or "1d".
pub fn parse_duration(s: &str) -> Result<Duration, HubError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(HubError::Config("Empty duration".to_string()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| HubError::Config(format!("Missing unit: {}", s)))?;
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| HubError::Config(format!("Invalid duration: {}", s)))?;

    if num == 0 {
        return Err(HubError::Config(format!(
            "Duration must be greater than zero: {}",
            s
        )));
    }

    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => return Err(HubError::Config(format!("Unknown unit: {}", unit))),
    };
    num.checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| HubError::Config(format!("Duration out of range: {}", s)))
}

fn duration_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load(yaml: &str) -> Result<HubConfig, HubError> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        HubConfig::load(file.path())
    }

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.listener.bind.port(), 5555);
        assert_eq!(config.listener.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.listener.max_handshake_len, 256);
        assert_eq!(config.clock.server, "pool.ntp.org:123");
        assert_eq!(config.clock.refresh_interval, Duration::from_secs(3600));
        assert_eq!(config.storage.flush_every, 100);
        assert_eq!(config.pipeline.queue_capacity, 10_000);
        assert_eq!(config.liveness.stale_after, Duration::from_secs(10));
        assert!(config.session.auto_start);
        assert_eq!(config.http.bind.port(), 8080);
    }

    #[test]
    fn test_load_partial_config() {
        let config = load(
            r#"
listener:
  bind: 127.0.0.1:6000
  handshake_timeout: 2s
clock:
  enabled: false
storage:
  data_dir: /data/sensors
  flush_interval: 500ms
liveness:
  stale_after: 30s
"#,
        )
        .unwrap();

        assert_eq!(config.listener.bind, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.listener.handshake_timeout, Duration::from_secs(2));
        // Unset fields in a present section keep their defaults.
        assert_eq!(config.listener.max_frame_len, 65536);
        assert!(!config.clock.enabled);
        assert_eq!(config.storage.data_dir, PathBuf::from("/data/sensors"));
        assert_eq!(config.storage.flush_interval, Duration::from_millis(500));
        assert_eq!(config.liveness.stale_after, Duration::from_secs(30));
        assert_eq!(config.pipeline.batch_size, 64);
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = load("{}").unwrap();
        assert_eq!(config.stats.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_load_rejects_bad_duration() {
        assert!(load("liveness:\n  stale_after: 0s\n").is_err());
        assert!(load("liveness:\n  stale_after: soon\n").is_err());
    }

    #[test]
    fn test_load_rejects_zero_capacity() {
        assert!(load("pipeline:\n  queue_capacity: 0\n").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(15 * 60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(60 * 60));
        assert_eq!(parse_duration(" 1d ").unwrap(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn test_parse_duration_rejects_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0m").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("99999999999999999d").is_err());
        assert!(parse_duration("99999999999999999999s").is_err());
    }
}
