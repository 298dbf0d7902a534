//! Transport-agnostic interfaces for the request/publish sockets described in
//! the wire protocol: a bidirectional, identity-addressable request socket
//! (clients connect, server binds) and a topic-filtered publish socket
//! (server binds, clients subscribe by room-id prefix).
//!
//! The reference deployment uses ZeroMQ ROUTER/PUB (see [`zmq_transport`]);
//! any transport providing the same ordering/identity/topic-filter semantics
//! can implement [`Transport`] instead.

pub mod zmq_transport;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// One frame received on the request socket: `[identity, topic, body]`.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Stable transport-level identity of the sending peer's connection.
    pub identity: Vec<u8>,
    pub topic: String,
    pub body: Vec<u8>,
}

/// The bidirectional request socket. Server binds; clients connect.
#[async_trait]
pub trait RequestSocket: Send + Sync {
    /// Wait up to `timeout` for the next inbound frame. `Ok(None)` on timeout,
    /// so callers can observe a shutdown flag between polls instead of
    /// blocking indefinitely.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<InboundFrame>>;
}

/// The fan-out publish socket. Server binds; clients subscribe by topic
/// prefix (room id).
#[async_trait]
pub trait PublishSocket: Send + Sync {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()>;
}

/// Binds the two sockets that make up the wire transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn bind_request(&self, port: u16) -> Result<Box<dyn RequestSocket>>;
    async fn bind_publish(&self, port: u16) -> Result<Box<dyn PublishSocket>>;
}
