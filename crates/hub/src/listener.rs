//! TCP accept loop and producer handshake
//!
//! The accept loop only accepts and spawns; each connection's handshake
//! runs in its own task under a deadline, so a silent or misbehaving client
//! never holds up other connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sensorhub_protocol::{parse_handshake, HandshakeAck, LineFramer, SensorType};

use crate::error::{HubError, IngestError};
use crate::events::StatusEvent;
use crate::ingest::IngestWorker;
use crate::producer::Producer;
use crate::state::HubState;
use crate::tasks::TaskGroup;

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, HubError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| HubError::Bind { addr, source })
}

pub struct ConnectionListener {
    listener: TcpListener,
    state: Arc<HubState>,
    connections: TaskGroup,
}

impl ConnectionListener {
    pub fn new(listener: TcpListener, state: Arc<HubState>, connections: TaskGroup) -> Self {
        Self {
            listener,
            state,
            connections,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until cancelled. Dropping the listener on return stops new
    /// connections at the socket level.
    pub async fn run(self, cancel: CancellationToken) {
        self.state.set_accepting(true);
        info!(addr = ?self.listener.local_addr().ok(), "Listening for producers");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&self.state);
                    let cancel = cancel.clone();
                    self.connections
                        .spawn(handle_connection(stream, addr, state, cancel));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        self.state.set_accepting(false);
        info!("Listener stopped");
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    state: Arc<HubState>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
    }
    let listener_config = &state.config.listener;
    let mut framer = LineFramer::new(listener_config.max_handshake_len);

    let handshake = tokio::select! {
        _ = cancel.cancelled() => return,
        result = read_handshake(&mut stream, &mut framer, listener_config.handshake_timeout) => result,
    };

    let sensor = match handshake {
        Ok(sensor) => sensor,
        Err(e) => {
            let rejected = state.record_rejected();
            warn!(addr = %addr, error = %e, rejected, "Rejected connection");
            // Dropping the stream closes it
            return;
        }
    };

    let producer = Arc::new(Producer::new(
        state.producers.allocate_id(),
        sensor.clone(),
        addr,
        state.clock.now_nanos(),
    ));

    if let Err(e) = send_ack(&mut stream, &state).await {
        warn!(addr = %addr, sensor = %sensor, error = %e, "Failed to send handshake ack");
        return;
    }

    framer.set_max_line_len(listener_config.max_frame_len);
    state.producers.register(Arc::clone(&producer));
    state.events.publish(StatusEvent::Connected {
        producer: producer.id(),
        sensor: sensor.clone(),
        addr,
    });

    let channel = state.dispatcher.channel(&sensor);
    let worker = IngestWorker::new(producer, channel, Arc::clone(&state), framer);
    let disconnect = worker.run(stream, cancel).await;
    debug!(addr = %addr, reason = %disconnect.as_reason(), "Connection closed");
}

/// Read the first line within `deadline` and parse it as a handshake.
/// Bytes after the newline stay in `framer` for the ingestion worker.
pub async fn read_handshake<R>(
    reader: &mut R,
    framer: &mut LineFramer,
    deadline: Duration,
) -> Result<SensorType, IngestError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(deadline, read_handshake_line(reader, framer))
        .await
        .map_err(|_| IngestError::HandshakeTimeout(deadline))?
}

async fn read_handshake_line<R>(
    reader: &mut R,
    framer: &mut LineFramer,
) -> Result<SensorType, IngestError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(line) = framer.next_line() {
            return Ok(parse_handshake(&line?)?);
        }
        let n = reader.read_buf(framer.buffer_mut()).await?;
        if n == 0 {
            return Err(IngestError::ClosedBeforeHandshake);
        }
    }
}

async fn send_ack<W>(writer: &mut W, state: &HubState) -> Result<(), IngestError>
where
    W: AsyncWrite + Unpin,
{
    let ack = HandshakeAck::connected(state.clock.now(), state.clock.local_time());
    writer.write_all(&ack.encode()?).await?;
    writer.flush().await?;
    Ok(())
}
