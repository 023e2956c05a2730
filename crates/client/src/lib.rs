//! sensorhub-client: Producer side of the sensorhub protocol
//!
//! [`ProducerClient`] is a single connection: handshake, offset derivation
//! from the hub's ack, and frame writes. [`ReconnectingProducer`] layers a
//! bounded [`Outbox`] and reconnect-with-backoff on top for long-running
//! producers.

pub mod client;
pub mod error;
pub mod outbox;
pub mod producer;

pub use client::ProducerClient;
pub use error::ClientError;
pub use outbox::Outbox;
pub use producer::ReconnectingProducer;
