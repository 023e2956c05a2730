//! SNTP (RFC 4330) client reference
//!
//! One request/response exchange per measurement. The four timestamps give
//! `offset = ((t2 - t1) + (t3 - t4)) / 2` and
//! `round_trip = (t4 - t1) - (t3 - t2)`.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};

use crate::clock::local_nanos;
use crate::error::ClockError;
use crate::reference::{OffsetSample, TimeReference};

pub const DEFAULT_PORT: u16 = 123;

const PACKET_LEN: usize = 48;
/// LI = 0, VN = 3, Mode = 3 (client)
const CLIENT_HEADER: u8 = 0x1B;
const MODE_SERVER: u8 = 4;
const MODE_BROADCAST: u8 = 5;
/// Seconds between 1900-01-01 and 1970-01-01
const NTP_UNIX_OFFSET_SECS: i64 = 2_208_988_800;
const NANOS_PER_SEC: i64 = 1_000_000_000;

const ORIGINATE_AT: usize = 24;
const RECEIVE_AT: usize = 32;
const TRANSMIT_AT: usize = 40;

pub struct SntpReference {
    server: String,
    timeout: Duration,
}

impl SntpReference {
    /// `server` is `host` or `host:port`; port defaults to 123.
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        let server = server.into();
        let server = if server.contains(':') {
            server
        } else {
            format!("{}:{}", server, DEFAULT_PORT)
        };
        Self { server, timeout }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn resolve(&self) -> Result<SocketAddr, ClockError> {
        lookup_host(self.server.as_str())
            .await
            .map_err(|e| ClockError::Resolve(format!("{}: {}", self.server, e)))?
            .next()
            .ok_or_else(|| ClockError::Resolve(self.server.clone()))
    }

    async fn exchange(&self, addr: SocketAddr) -> Result<OffsetSample, ClockError> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;

        let t1 = local_nanos();
        let request = encode_request(t1);
        socket.send(&request).await?;

        let mut buf = [0u8; PACKET_LEN];
        let n = socket.recv(&mut buf).await?;
        let t4 = local_nanos();

        let reply = decode_response(&buf[..n], &request)?;
        Ok(compute_offset(t1, reply.receive_nanos, reply.transmit_nanos, t4))
    }
}

#[async_trait]
impl TimeReference for SntpReference {
    fn name(&self) -> &str {
        &self.server
    }

    async fn measure(&self) -> Result<OffsetSample, ClockError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, async {
            let addr = self.resolve().await?;
            self.exchange(addr).await
        })
        .await
        .map_err(|_| ClockError::Timeout(timeout))?
    }
}

/// Server timestamps from a validated reply, as Unix epoch nanos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SntpReply {
    pub stratum: u8,
    pub receive_nanos: i64,
    pub transmit_nanos: i64,
}

/// Client request carrying `transmit_nanos` in the transmit field, which the
/// server echoes back as the originate timestamp.
pub fn encode_request(transmit_nanos: i64) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    packet[TRANSMIT_AT..TRANSMIT_AT + 8].copy_from_slice(&unix_nanos_to_ntp(transmit_nanos).to_be_bytes());
    packet
}

pub fn decode_response(packet: &[u8], request: &[u8; PACKET_LEN]) -> Result<SntpReply, ClockError> {
    if packet.len() < PACKET_LEN {
        return Err(ClockError::InvalidResponse(format!(
            "short packet: {} bytes",
            packet.len()
        )));
    }

    let mode = packet[0] & 0x07;
    if mode != MODE_SERVER && mode != MODE_BROADCAST {
        return Err(ClockError::InvalidResponse(format!("unexpected mode {}", mode)));
    }

    let stratum = packet[1];
    if stratum == 0 {
        let code = String::from_utf8_lossy(&packet[12..16])
            .trim_end_matches('\0')
            .to_string();
        return Err(ClockError::KissOfDeath(code));
    }

    if packet[ORIGINATE_AT..ORIGINATE_AT + 8] != request[TRANSMIT_AT..TRANSMIT_AT + 8] {
        return Err(ClockError::InvalidResponse(
            "originate timestamp does not match request".to_string(),
        ));
    }

    let receive = read_timestamp(packet, RECEIVE_AT);
    let transmit = read_timestamp(packet, TRANSMIT_AT);
    if transmit == 0 {
        return Err(ClockError::InvalidResponse(
            "zero transmit timestamp".to_string(),
        ));
    }

    Ok(SntpReply {
        stratum,
        receive_nanos: ntp_to_unix_nanos(receive),
        transmit_nanos: ntp_to_unix_nanos(transmit),
    })
}

/// t1 client send, t2 server receive, t3 server transmit, t4 client receive.
pub fn compute_offset(t1: i64, t2: i64, t3: i64, t4: i64) -> OffsetSample {
    let offset_nanos = ((t2 - t1) + (t3 - t4)) / 2;
    let round_trip = ((t4 - t1) - (t3 - t2)).max(0);
    OffsetSample {
        offset_nanos,
        round_trip: Duration::from_nanos(round_trip as u64),
    }
}

fn read_timestamp(packet: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&packet[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// 32.32 fixed-point NTP timestamp from Unix epoch nanos.
pub fn unix_nanos_to_ntp(nanos: i64) -> u64 {
    let secs = nanos.div_euclid(NANOS_PER_SEC) + NTP_UNIX_OFFSET_SECS;
    let sub = nanos.rem_euclid(NANOS_PER_SEC) as u64;
    let frac = (sub << 32) / NANOS_PER_SEC as u64;
    ((secs as u64) << 32) | frac
}

pub fn ntp_to_unix_nanos(ntp: u64) -> i64 {
    let secs = (ntp >> 32) as i64 - NTP_UNIX_OFFSET_SECS;
    let frac = ntp & 0xFFFF_FFFF;
    let sub = ((frac * NANOS_PER_SEC as u64) >> 32) as i64;
    secs * NANOS_PER_SEC + sub
}
