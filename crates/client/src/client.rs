//! One producer connection to the hub

use serde_json::{Map, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use sensorhub_protocol::{format_handshake, HandshakeAck, LineFramer, SensorType};
use sensorhub_timesync::local_nanos;

use crate::error::ClientError;

/// Default wait for connect plus ack
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest ack line we accept from the hub
const MAX_ACK_LEN: usize = 1024;

pub struct ProducerClient {
    sensor: SensorType,
    stream: TcpStream,
    ack: HandshakeAck,
    /// Hub's disciplined time minus our local time, in seconds
    offset_secs: f64,
    stamp_timestamps: bool,
    sent: u64,
}

impl ProducerClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A, sensor: SensorType) -> Result<Self, ClientError> {
        Self::connect_timeout(addr, sensor, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect, send the handshake and wait for the hub's ack.
    pub async fn connect_timeout<A: ToSocketAddrs>(
        addr: A,
        sensor: SensorType,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        tokio::time::timeout(timeout, Self::handshake(addr, sensor))
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    async fn handshake<A: ToSocketAddrs>(addr: A, sensor: SensorType) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream
            .write_all(format_handshake(&sensor).as_bytes())
            .await?;

        let mut framer = LineFramer::new(MAX_ACK_LEN);
        let line = loop {
            if let Some(line) = framer.next_line() {
                break line?;
            }
            if stream.read_buf(framer.buffer_mut()).await? == 0 {
                return Err(ClientError::Closed);
            }
        };

        let ack = HandshakeAck::decode(&line)?;
        let local = local_nanos() as f64 / 1_000_000_000.0;
        let offset_secs = ack.ntp_time - local;
        info!(
            sensor = %sensor,
            offset_secs,
            "Connected to hub"
        );

        Ok(Self {
            sensor,
            stream,
            ack,
            offset_secs,
            stamp_timestamps: true,
            sent: 0,
        })
    }

    /// Whether `send` adds a `timestamp` to frames that lack one.
    pub fn with_timestamps(mut self, stamp: bool) -> Self {
        self.stamp_timestamps = stamp;
        self
    }

    pub fn sensor(&self) -> &SensorType {
        &self.sensor
    }

    pub fn ack(&self) -> &HandshakeAck {
        &self.ack
    }

    pub fn offset_secs(&self) -> f64 {
        self.offset_secs
    }

    /// Local clock corrected by the offset learned at handshake.
    pub fn timestamp(&self) -> f64 {
        local_nanos() as f64 / 1_000_000_000.0 + self.offset_secs
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Write one data frame.
    pub async fn send(&mut self, mut fields: Map<String, Value>) -> Result<(), ClientError> {
        if self.stamp_timestamps && !fields.contains_key("timestamp") {
            fields.insert("timestamp".to_string(), Value::from(self.timestamp()));
        }
        self.write_frame(&Value::Object(fields)).await?;
        self.sent += 1;
        Ok(())
    }

    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        self.write_frame(&serde_json::json!({"type": "heartbeat"}))
            .await
    }

    async fn write_frame(&mut self, frame: &Value) -> Result<(), ClientError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        debug!(sensor = %self.sensor, bytes = line.len(), "frame sent");
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Accept one connection, check the handshake and answer with `ack`.
    async fn fake_hub(ack: Option<String>) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = vec![lines.next_line().await.unwrap().unwrap()];
            let Some(ack) = ack else {
                return seen;
            };
            write.write_all(ack.as_bytes()).await.unwrap();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line);
            }
            seen
        });
        (addr, handle)
    }

    fn ack_ahead(secs: f64) -> String {
        let now = local_nanos() as f64 / 1e9;
        let ack = HandshakeAck::connected(now + secs, now);
        String::from_utf8(ack.encode().unwrap()).unwrap()
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_connect_derives_offset_and_stamps() {
        let (addr, hub) = fake_hub(Some(ack_ahead(2.0))).await;

        let mut client = ProducerClient::connect(addr, SensorType::Fsr).await.unwrap();
        assert!((client.offset_secs() - 2.0).abs() < 0.1);

        client
            .send(fields(serde_json::json!({"force": 1.5, "raw": 150})))
            .await
            .unwrap();
        client
            .send(fields(serde_json::json!({"force": 2.5, "raw": 250, "timestamp": 12.5})))
            .await
            .unwrap();
        client.heartbeat().await.unwrap();
        assert_eq!(client.sent(), 2);
        client.close().await.unwrap();

        let seen = hub.await.unwrap();
        assert_eq!(seen[0], "SENSOR:FSR");

        let first: Value = serde_json::from_str(&seen[1]).unwrap();
        let ts = first["timestamp"].as_f64().unwrap();
        let expected = local_nanos() as f64 / 1e9 + 2.0;
        assert!((expected - ts).abs() < 1.0);

        let second: Value = serde_json::from_str(&seen[2]).unwrap();
        assert_eq!(second["timestamp"], 12.5);
        assert_eq!(seen[3], r#"{"type":"heartbeat"}"#);
    }

    #[tokio::test]
    async fn test_unstamped_frames() {
        let (addr, hub) = fake_hub(Some(ack_ahead(0.0))).await;
        let mut client = ProducerClient::connect(addr, SensorType::Microphone)
            .await
            .unwrap()
            .with_timestamps(false);
        client
            .send(fields(serde_json::json!({"rms_left": 0.1, "rms_right": 0.2})))
            .await
            .unwrap();
        client.close().await.unwrap();

        let seen = hub.await.unwrap();
        assert_eq!(seen[0], "SENSOR:MICROPHONE");
        let frame: Value = serde_json::from_str(&seen[1]).unwrap();
        assert!(frame.get("timestamp").is_none());
    }

    #[tokio::test]
    async fn test_closed_without_ack() {
        let (addr, _hub) = fake_hub(None).await;
        let err = ProducerClient::connect(addr, SensorType::Fsr)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Closed | ClientError::Io(_)));
    }

    #[tokio::test]
    async fn test_rejected_ack_status() {
        let (addr, _hub) = fake_hub(Some("{\"status\":\"error\",\"ntp_time\":0,\"server_time\":0}\n".into())).await;
        let err = ProducerClient::connect(addr, SensorType::Fsr)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let err = ProducerClient::connect_timeout(addr, SensorType::Fsr, Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Timeout(_)));
    }
}
