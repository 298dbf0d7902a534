//! ZeroMQ ROUTER/PUB implementation of [`crate::Transport`].
//!
//! Each bound socket gets its own dedicated OS thread that owns the
//! (non-`Send`-friendly, blocking) `zmq::Socket` and pumps frames to/from
//! async callers over `tokio::sync::mpsc` channels. This keeps every
//! blocking `recv`/`send` off the async runtime's worker threads, mirroring
//! the "one thread per long-lived loop" rule the coordinator's own ingress
//! and broadcast loops follow.

use crate::{InboundFrame, PublishSocket, RequestSocket, Transport};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

const PUMP_POLL_TIMEOUT_MS: i64 = 100;

pub struct ZmqTransport {
    ctx: zmq::Context,
}

impl ZmqTransport {
    pub fn new() -> Self {
        Self {
            ctx: zmq::Context::new(),
        }
    }
}

impl Default for ZmqTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ZmqTransport {
    async fn bind_request(&self, port: u16) -> Result<Box<dyn RequestSocket>> {
        let ctx = self.ctx.clone();
        let socket = tokio::task::spawn_blocking(move || -> Result<zmq::Socket> {
            let socket = ctx.socket(zmq::ROUTER)?;
            socket
                .bind(&format!("tcp://*:{port}"))
                .with_context(|| format!("binding ROUTER socket on port {port}"))?;
            Ok(socket)
        })
        .await??;
        Ok(Box::new(RouterHandle::spawn(socket)))
    }

    async fn bind_publish(&self, port: u16) -> Result<Box<dyn PublishSocket>> {
        let ctx = self.ctx.clone();
        let socket = tokio::task::spawn_blocking(move || -> Result<zmq::Socket> {
            let socket = ctx.socket(zmq::PUB)?;
            socket
                .bind(&format!("tcp://*:{port}"))
                .with_context(|| format!("binding PUB socket on port {port}"))?;
            Ok(socket)
        })
        .await??;
        Ok(Box::new(PublisherHandle::spawn(socket)))
    }
}

struct RouterHandle {
    inbound: tokio::sync::Mutex<mpsc::Receiver<InboundFrame>>,
    running: Arc<AtomicBool>,
}

impl RouterHandle {
    fn spawn(socket: zmq::Socket) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(1024);
        let thread_running = running.clone();
        std::thread::Builder::new()
            .name("netsync-router-pump".into())
            .spawn(move || router_pump(socket, tx, thread_running))
            .expect("spawn router pump thread");
        Self {
            inbound: tokio::sync::Mutex::new(rx),
            running,
        }
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn router_pump(socket: zmq::Socket, tx: mpsc::Sender<InboundFrame>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match socket.poll(zmq::POLLIN, PUMP_POLL_TIMEOUT_MS) {
            Ok(n) if n > 0 => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("router poll error: {e}");
                continue;
            }
        }
        let parts = match socket.recv_multipart(0) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("router recv error: {e}");
                continue;
            }
        };
        if parts.len() < 3 {
            tracing::warn!("received incomplete frame with only {} parts", parts.len());
            continue;
        }
        let identity = parts[0].clone();
        let topic = match String::from_utf8(parts[1].clone()) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("failed to decode topic as utf-8: {e}");
                continue;
            }
        };
        let body = parts[2].clone();
        if tx
            .blocking_send(InboundFrame {
                identity,
                topic,
                body,
            })
            .is_err()
        {
            break;
        }
    }
}

#[async_trait]
impl RequestSocket for RouterHandle {
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<InboundFrame>> {
        let mut rx = self.inbound.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(anyhow!("router pump thread terminated")),
            Err(_elapsed) => Ok(None),
        }
    }
}

struct PublisherHandle {
    outbound: mpsc::Sender<(String, Vec<u8>)>,
    running: Arc<AtomicBool>,
}

impl PublisherHandle {
    fn spawn(socket: zmq::Socket) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel::<(String, Vec<u8>)>(4096);
        std::thread::Builder::new()
            .name("netsync-pub-pump".into())
            .spawn(move || publisher_pump(socket, rx))
            .expect("spawn publisher pump thread");
        Self {
            outbound: tx,
            running,
        }
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn publisher_pump(socket: zmq::Socket, mut rx: mpsc::Receiver<(String, Vec<u8>)>) {
    while let Some((topic, body)) = rx.blocking_recv() {
        if let Err(e) = socket.send_multipart([topic.into_bytes(), body], 0) {
            tracing::error!("publish failed: {e}");
        }
    }
}

#[async_trait]
impl PublishSocket for PublisherHandle {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
        self.outbound
            .send((topic.to_string(), body))
            .await
            .map_err(|_| anyhow!("publisher pump thread terminated"))
    }
}
