//! Publisher (component C8): the single fan-out path from every internal
//! producer (broadcast scheduler, NV engine, RPC router, identity registry)
//! to the publish socket.
//!
//! A bounded per-process queue with a kind-aware drop policy: the original
//! Python server instead relies on ZeroMQ's own high-water-mark on the PUB
//! socket, which has no notion of frame kind. This is a genuine redesign:
//! an application-level priority queue, guarded with `parking_lot::Mutex`
//! plus a condition-style wakeup, so that an overflowing room-transform
//! flood never pushes out an RPC or NV delta.

use netsync_transport::PublishSocket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    RoomTransform,
    Other,
}

struct QueuedFrame {
    topic: String,
    body: Vec<u8>,
    kind: FrameKind,
}

struct Queue {
    items: Mutex<VecDeque<QueuedFrame>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl Queue {
    fn push(&self, topic: String, body: Vec<u8>, kind: FrameKind) {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                let oldest_rt = items.iter().position(|f| f.kind == FrameKind::RoomTransform);
                match oldest_rt {
                    Some(idx) => {
                        items.remove(idx);
                    }
                    None => {
                        items.pop_front();
                    }
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(QueuedFrame { topic, body, kind });
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedFrame> {
        self.items.lock().pop_front()
    }
}

/// Handle producers use to enqueue outbound frames. Cheap to clone; shares
/// the queue and the running flag with the worker loop.
#[derive(Clone)]
pub struct Publisher {
    queue: Arc<Queue>,
    running: Arc<AtomicBool>,
}

impl Publisher {
    /// Spawns the worker task that drains the queue onto `socket` and
    /// returns a handle for producers. The worker exits once `stop` is
    /// called and the queue has drained.
    pub fn spawn(socket: Box<dyn PublishSocket>, capacity: usize) -> Self {
        let queue = Arc::new(Queue {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        let running = Arc::new(AtomicBool::new(true));

        let worker_queue = queue.clone();
        let worker_running = running.clone();
        tokio::spawn(async move {
            loop {
                match worker_queue.pop() {
                    Some(frame) => {
                        if let Err(err) = socket.publish(&frame.topic, frame.body).await {
                            tracing::error!(topic = %frame.topic, %err, "publish failed");
                        }
                    }
                    None => {
                        if !worker_running.load(Ordering::Relaxed) {
                            break;
                        }
                        worker_queue.notify.notified().await;
                    }
                }
            }
        });

        Self { queue, running }
    }

    pub fn publish_room_transform(&self, room_id: &str, body: Vec<u8>) {
        self.queue.push(room_id.to_string(), body, FrameKind::RoomTransform);
    }

    pub fn publish_other(&self, topic: &str, body: Vec<u8>) {
        self.queue.push(topic.to_string(), body, FrameKind::Other);
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.queue.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingSocket {
        received: Arc<StdMutex<Vec<(String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl PublishSocket for RecordingSocket {
        async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
            self.received.lock().unwrap().push((topic.to_string(), body));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drains_frames_in_order() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let socket = RecordingSocket { received: received.clone() };
        let publisher = Publisher::spawn(Box::new(socket), 10);

        publisher.publish_room_transform("r1", vec![1]);
        publisher.publish_other("r1", vec![2]);
        publisher.publish_room_transform("r1", vec![3]);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let got = received.lock().unwrap().clone();
        assert_eq!(got, vec![("r1".to_string(), vec![1]), ("r1".to_string(), vec![2]), ("r1".to_string(), vec![3])]);
    }

    #[test]
    fn overflow_drops_oldest_room_transform_before_other_kinds() {
        let queue = Queue {
            items: Mutex::new(VecDeque::new()),
            capacity: 2,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        };
        queue.push("r1".into(), vec![1], FrameKind::RoomTransform);
        queue.push("r1".into(), vec![2], FrameKind::Other);
        // queue full: pushing a third frame must evict the RoomTransform, not Other.
        queue.push("r1".into(), vec![3], FrameKind::RoomTransform);

        let remaining: Vec<FrameKind> = queue.items.lock().iter().map(|f| f.kind).collect();
        assert_eq!(remaining, vec![FrameKind::Other, FrameKind::RoomTransform]);
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
    }
}
