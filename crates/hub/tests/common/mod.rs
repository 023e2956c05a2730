//! Shared fixtures for hub end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use sensorhub_hub::{Hub, HubConfig, StatusEvent};
use sensorhub_protocol::HandshakeAck;
use sensorhub_timesync::{ClockError, OffsetSample, TimeReference};

/// Time reference with a fixed answer, or one that is always unreachable.
pub struct MockReference {
    offset_nanos: Option<i64>,
}

impl MockReference {
    pub fn ahead(offset: Duration) -> Arc<dyn TimeReference> {
        Arc::new(Self {
            offset_nanos: Some(offset.as_nanos() as i64),
        })
    }

    pub fn unreachable() -> Arc<dyn TimeReference> {
        Arc::new(Self { offset_nanos: None })
    }
}

#[async_trait]
impl TimeReference for MockReference {
    fn name(&self) -> &str {
        "mock"
    }

    async fn measure(&self) -> Result<OffsetSample, ClockError> {
        match self.offset_nanos {
            Some(offset_nanos) => Ok(OffsetSample {
                offset_nanos,
                round_trip: Duration::from_millis(1),
            }),
            None => Err(ClockError::Timeout(Duration::from_millis(10))),
        }
    }
}

/// Loopback hub rooted in `data_dir` with fast timers.
pub fn test_config(data_dir: &Path) -> HubConfig {
    let mut config = HubConfig::default();
    config.listener.bind = "127.0.0.1:0".parse().unwrap();
    config.listener.handshake_timeout = Duration::from_millis(300);
    config.listener.read_timeout = Duration::from_millis(50);
    config.storage.data_dir = data_dir.to_path_buf();
    config.storage.flush_every = 1;
    config.storage.flush_interval = Duration::from_millis(20);
    config.pipeline.poll_timeout = Duration::from_millis(20);
    config.liveness.scan_interval = Duration::from_millis(50);
    config.liveness.stale_after = Duration::from_millis(400);
    config.shutdown.grace_period = Duration::from_secs(2);
    config
}

pub async fn start_hub(data_dir: &Path, reference: Option<Arc<dyn TimeReference>>) -> Hub {
    Hub::start_with_reference(test_config(data_dir), reference)
        .await
        .unwrap()
}

pub struct TestProducer {
    pub ack: HandshakeAck,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestProducer {
    /// Connect and complete the handshake for `sensor`.
    pub async fn connect(addr: SocketAddr, sensor: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut writer) = stream.into_split();
        writer
            .write_all(format!("SENSOR:{}\n", sensor).as_bytes())
            .await
            .unwrap();

        let mut reader = BufReader::new(read);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("ack timed out")
            .unwrap();
        let ack = HandshakeAck::decode(line.as_bytes()).unwrap();

        Self {
            ack,
            reader,
            writer,
        }
    }

    pub async fn send(&mut self, frame: &str) {
        self.writer.write_all(frame.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Wait for the hub to close the connection.
    pub async fn closed(mut self) -> bool {
        let mut buf = String::new();
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.reader.read_line(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub fn persisted(hub: &Hub, sensor: &str) -> u64 {
    hub.state()
        .dispatcher
        .status()
        .iter()
        .find(|s| s.sensor.tag() == sensor)
        .map_or(0, |s| s.counters.persisted)
}

pub fn received(hub: &Hub, sensor: &str) -> u64 {
    hub.state()
        .dispatcher
        .status()
        .iter()
        .find(|s| s.sensor.tag() == sensor)
        .map_or(0, |s| s.counters.received)
}

pub fn session_dir(hub: &Hub) -> PathBuf {
    hub.state().sessions.current_dir().expect("no active session")
}

/// Data rows of a store, split on commas, header removed.
pub fn read_rows(path: &Path) -> Vec<Vec<String>> {
    let content = std::fs::read_to_string(path).unwrap();
    let mut lines = content.lines();
    lines.next();
    lines
        .map(|l| l.split(',').map(str::to_string).collect())
        .collect()
}

pub fn header(path: &Path) -> String {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Next event satisfying `pred`, skipping others, or `None` on timeout.
pub async fn next_event<F>(
    rx: &mut broadcast::Receiver<StatusEvent>,
    timeout: Duration,
    mut pred: F,
) -> Option<StatusEvent>
where
    F: FnMut(&StatusEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}
