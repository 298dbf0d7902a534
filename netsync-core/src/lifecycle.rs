//! Lifecycle manager (component C9): periodic sweeps for client timeout,
//! empty-room expiry, and stale device-ID purge.
//!
//! Grounded on `server.py`'s `_periodic_loop` (client timeout + empty-group
//! cleanup) and `_cleanup_expired_device_id_mappings` (device-ID purge on a
//! separate, longer cadence). Both sweeps are pure calls into
//! [`crate::registry::IdentityRegistry`]; this module only owns the timing
//! and the DeviceIdMapping rebroadcast that a client-timeout sweep triggers.

use crate::codec;
use crate::protocol::Message;
use crate::publisher::Publisher;
use crate::registry::IdentityRegistry;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub sweep_interval: Duration,
    pub client_timeout: Duration,
    pub empty_room_expiry: Duration,
    pub device_id_cleanup_interval: Duration,
    pub device_id_expiry: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            client_timeout: Duration::from_secs(1),
            empty_room_expiry: Duration::from_secs(86_400),
            device_id_cleanup_interval: Duration::from_secs(60),
            device_id_expiry: Duration::from_secs(300),
        }
    }
}

pub struct LifecycleManager {
    registry: Arc<IdentityRegistry>,
    publisher: Publisher,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(registry: Arc<IdentityRegistry>, publisher: Publisher, config: LifecycleConfig) -> Self {
        Self { registry, publisher, config }
    }

    /// One client-timeout + empty-room pass. Any room that lost a client
    /// gets a fresh DeviceIdMapping published to reflect the new membership.
    pub fn sweep_clients_and_rooms(&self) {
        let affected = self.registry.sweep_timed_out_clients(self.config.client_timeout);
        for room_id in affected {
            let mapping = self.registry.with_room(&room_id, false, |room| room.device_id_mapping_payload());
            if let Some(mapping) = mapping {
                if let Ok(bytes) = codec::encode(&Message::DeviceIdMapping(mapping)) {
                    self.publisher.publish_other(&room_id, bytes);
                }
            }
        }
        self.registry.sweep_room_lifecycle(self.config.empty_room_expiry);
    }

    /// The longer-cadence device-ID purge, run on its own tick by the
    /// owning loop.
    pub fn sweep_expired_device_ids(&self) {
        self.registry.purge_expired_device_ids(self.config.device_id_expiry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;
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
        received: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl PublishSocket for RecordingSocket {
        async fn publish(&self, _topic: &str, body: Vec<u8>) -> Result<()> {
            self.received.lock().unwrap().push(body);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_client_triggers_device_id_mapping_rebroadcast() {
        let registry = Arc::new(IdentityRegistry::new(limits()));
        let received = Arc::new(StdMutex::new(Vec::new()));
        let publisher = Publisher::spawn(Box::new(RecordingSocket { received: received.clone() }), 100);
        let manager = LifecycleManager::new(registry.clone(), publisher, LifecycleConfig {
            client_timeout: Duration::from_millis(10),
            ..LifecycleConfig::default()
        });

        registry
            .apply_client_transform("r1", &ClientTransform {
                device_id: "dev-a".to_string(),
                physical: Transform::ZERO,
                head: Transform::ZERO,
                right_hand: Transform::ZERO,
                left_hand: Transform::ZERO,
                virtuals: vec![],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.sweep_clients_and_rooms();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let bodies = received.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        let (msg, _) = decode(&bodies[0]).unwrap();
        match msg {
            Message::DeviceIdMapping(mapping) => assert!(mapping.entries.is_empty()),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
