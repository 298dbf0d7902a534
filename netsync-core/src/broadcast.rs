//! Adaptive broadcast scheduler (component C5).
//!
//! Each room is polled once per tick, and the dirty/idle dual-rate decision
//! below is the whole of the emission policy.
//! Serialization reuses [`crate::registry::Room::room_transform_frame`],
//! which concatenates cached per-client bodies rather than re-walking any
//! decoded state, so a tick never re-serializes an unchanged client.

use crate::publisher::Publisher;
use crate::registry::IdentityRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    pub tick: Duration,
    pub dirty_threshold: Duration,
    pub idle_broadcast_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            dirty_threshold: Duration::from_millis(50),
            idle_broadcast_interval: Duration::from_millis(500),
        }
    }
}

/// One pass over every known room, deciding per-room whether to emit.
/// Kept as a free function (rather than a method) so the periodic loop in
/// `netsync-server` can call it directly inside a `tokio::time::interval`
/// without owning a scheduler struct.
pub struct BroadcastScheduler {
    registry: Arc<IdentityRegistry>,
    publisher: Publisher,
    config: BroadcastConfig,
    skipped_broadcasts: AtomicU64,
}

impl BroadcastScheduler {
    pub fn new(registry: Arc<IdentityRegistry>, publisher: Publisher, config: BroadcastConfig) -> Self {
        Self {
            registry,
            publisher,
            config,
            skipped_broadcasts: AtomicU64::new(0),
        }
    }

    pub fn skipped_broadcasts(&self) -> u64 {
        self.skipped_broadcasts.load(Ordering::Relaxed)
    }

    pub fn tick_interval(&self) -> Duration {
        self.config.tick
    }

    /// Evaluates every room once. Intended to be called on a fixed tick by
    /// the owning loop; never sleeps itself.
    pub fn tick(&self) {
        let now = Instant::now();
        for room_id in self.registry.room_ids() {
            let emission = self.registry.with_room(&room_id, false, |room| {
                if room.visible_client_count() == 0 {
                    return None;
                }
                let elapsed = now.duration_since(room.last_broadcast);
                let threshold = if room.dirty {
                    self.config.dirty_threshold
                } else {
                    self.config.idle_broadcast_interval
                };
                if elapsed < threshold {
                    return None;
                }
                let frame = room.room_transform_frame().ok()?;
                room.dirty = false;
                room.last_broadcast = now;
                Some(frame)
            });

            match emission {
                Some(Some(frame)) => self.publisher.publish_room_transform(&room_id, frame),
                Some(None) => {
                    self.skipped_broadcasts.fetch_add(1, Ordering::Relaxed);
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientTransform, Transform};
    use crate::registry::RegistryLimits;
    use anyhow::Result;
    use async_trait::async_trait;
    use netsync_transport::PublishSocket;
    use std::sync::Mutex as StdMutex;

    fn limits() -> RegistryLimits {
        RegistryLimits {
            device_id_expiry: Duration::from_secs(300),
            delta_ring_size: 10_000,
            max_global_vars: 100,
            max_client_vars: 100,
            max_var_name_bytes: 64,
            max_var_value_bytes: 1024,
        }
    }

    struct RecordingSocket {
        received: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl PublishSocket for RecordingSocket {
        async fn publish(&self, topic: &str, _body: Vec<u8>) -> Result<()> {
            self.received.lock().unwrap().push(topic.to_string());
            Ok(())
        }
    }

    fn transform(device_id: &str) -> ClientTransform {
        ClientTransform {
            device_id: device_id.to_string(),
            physical: Transform::ZERO,
            head: Transform::ZERO,
            right_hand: Transform::ZERO,
            left_hand: Transform::ZERO,
            virtuals: vec![],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dirty_room_emits_after_dirty_threshold_only() {
        let registry = Arc::new(IdentityRegistry::new(limits()));
        let received = Arc::new(StdMutex::new(Vec::new()));
        let publisher = Publisher::spawn(Box::new(RecordingSocket { received: received.clone() }), 100);
        let config = BroadcastConfig {
            tick: Duration::from_millis(10),
            dirty_threshold: Duration::from_millis(30),
            idle_broadcast_interval: Duration::from_millis(200),
        };
        let scheduler = BroadcastScheduler::new(registry.clone(), publisher, config);

        registry.apply_client_transform("r1", &transform("dev-a")).unwrap();
        registry.with_room("r1", false, |room| room.last_broadcast = Instant::now());

        scheduler.tick();
        assert_eq!(scheduler.skipped_broadcasts(), 1);

        registry.with_room("r1", false, |room| {
            room.last_broadcast = Instant::now() - Duration::from_millis(40);
            room.dirty = true;
        });
        scheduler.tick();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_room_never_broadcasts() {
        let registry = Arc::new(IdentityRegistry::new(limits()));
        let received = Arc::new(StdMutex::new(Vec::new()));
        let publisher = Publisher::spawn(Box::new(RecordingSocket { received: received.clone() }), 100);
        let scheduler = BroadcastScheduler::new(registry.clone(), publisher, BroadcastConfig::default());

        registry.with_room("empty-room", true, |_| ());
        scheduler.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(received.lock().unwrap().is_empty());
        assert_eq!(scheduler.skipped_broadcasts(), 0);
    }
}
