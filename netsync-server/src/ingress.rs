//! Ingress dispatcher (component C4) and the NV flush loop (part of C7's
//! own cadence). Kept in one file because both read frames/pending state
//! off the same `IdentityRegistry` and neither touches a socket beyond the
//! `RequestSocket`/`Publisher` handles passed in.

use netsync_core::codec;
use netsync_core::discovery::AppIdGate;
use netsync_core::nv::{self, DeltaAckPayload, DeviceRateMonitor, SetOutcome};
use netsync_core::protocol::{
    ClientTransform, ClientVarSet, Hello, Message, Rpc, RpcTargeted, MAX_APP_ID_BYTES, MAX_DEVICE_ID_BYTES,
};
use netsync_core::publisher::Publisher;
use netsync_core::registry::IdentityRegistry;
use netsync_core::rpc;
use netsync_transport::{InboundFrame, RequestSocket};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct HandshakeCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
}

enum ConnState {
    AwaitingHello,
    Denied,
    Active { device_id: String, room_id: String },
}

fn handle_hello_attempt(body: &[u8], gate: &AppIdGate) -> Result<Hello, &'static str> {
    let hello = codec::decode_hello(body).map_err(|_| "first frame is not a valid Hello")?;
    if hello.app_id.len() > MAX_APP_ID_BYTES {
        return Err("appId exceeds 128 bytes");
    }
    if hello.device_id.len() > MAX_DEVICE_ID_BYTES {
        return Err("deviceId exceeds 64 bytes");
    }
    if !gate.permits(&hello.app_id) {
        return Err("appId not permitted");
    }
    Ok(hello)
}

/// Resolves the first frame on a connection into its next `ConnState`,
/// bumping `counters` exactly once per attempt. A frame that isn't a valid
/// Hello, or a Hello the gate rejects, denies the identity; anything else
/// opens it.
fn process_handshake_frame(
    frame: &InboundFrame,
    gate: &AppIdGate,
    registry: &IdentityRegistry,
    counters: &HandshakeCounters,
) -> ConnState {
    match handle_hello_attempt(&frame.body, gate) {
        Ok(hello) => {
            registry.mark_seen(&hello.device_id);
            counters.allowed.fetch_add(1, Ordering::Relaxed);
            ConnState::Active {
                device_id: hello.device_id,
                room_id: frame.topic.clone(),
            }
        }
        Err(reason) => {
            counters.denied.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(reason, "handshake denied");
            ConnState::Denied
        }
    }
}

fn handle_client_transform(transform: ClientTransform, room_id: &str, registry: &IdentityRegistry, publisher: &Publisher) {
    match registry.apply_client_transform(room_id, &transform) {
        Ok(accepted) => {
            if accepted.newly_visible {
                if let Some(mapping) = registry.with_room(room_id, false, |room| room.device_id_mapping_payload()) {
                    if let Ok(bytes) = codec::encode(&Message::DeviceIdMapping(mapping)) {
                        publisher.publish_other(room_id, bytes);
                    }
                }
            }
        }
        Err(err) => tracing::warn!(room_id, %err, "client number assignment failed"),
    }
}

fn handle_rpc(rpc_msg: Rpc, device_id: &str, room_id: &str, registry: &IdentityRegistry, publisher: &Publisher) {
    let sender_client_no = registry.client_no_of(room_id, device_id).unwrap_or(0);
    match rpc::route_broadcast(sender_client_no, &rpc_msg.function_name, &rpc_msg.arguments_json) {
        Ok(bytes) => publisher.publish_other(room_id, bytes),
        Err(err) => tracing::warn!(room_id, %err, "dropping malformed rpc"),
    }
}

fn handle_rpc_targeted(rpc_msg: RpcTargeted, device_id: &str, room_id: &str, registry: &IdentityRegistry, publisher: &Publisher) {
    let sender_client_no = registry.client_no_of(room_id, device_id).unwrap_or(0);
    match rpc::route_targeted(sender_client_no, rpc_msg.target_client_nos, &rpc_msg.function_name, &rpc_msg.arguments_json) {
        Ok(bytes) => publisher.publish_other(room_id, bytes),
        Err(err) => tracing::warn!(room_id, %err, "dropping malformed targeted rpc"),
    }
}

fn monitor_rate(device_id: &str, rate_monitor: &Mutex<DeviceRateMonitor>, threshold: u32) {
    let count = rate_monitor.lock().record(device_id);
    if count as u32 > threshold {
        tracing::warn!(device_id, count, threshold, "device exceeds NV request rate threshold (monitoring only)");
    }
}

fn log_set_outcome(room_id: &str, name: &str, outcome: SetOutcome) {
    if let SetOutcome::RejectedLimit = outcome {
        tracing::warn!(room_id, name, "NV set rejected: variable limit reached");
    }
}

fn handle_global_var_set(
    msg: netsync_core::protocol::GlobalVarSet,
    device_id: &str,
    room_id: &str,
    registry: &IdentityRegistry,
    rate_monitor: &Mutex<DeviceRateMonitor>,
    nv_monitor_threshold: u32,
) {
    monitor_rate(device_id, rate_monitor, nv_monitor_threshold);
    let sender_client_no = registry.client_no_of(room_id, device_id).unwrap_or(msg.sender_client_no);
    let outcome = registry.with_room(room_id, false, |room| {
        room.nv.set_global(&msg.name, &msg.value, msg.timestamp, sender_client_no)
    });
    if let Some(outcome) = outcome {
        log_set_outcome(room_id, &msg.name, outcome);
    }
}

fn handle_client_var_set(
    msg: ClientVarSet,
    device_id: &str,
    room_id: &str,
    registry: &IdentityRegistry,
    rate_monitor: &Mutex<DeviceRateMonitor>,
    nv_monitor_threshold: u32,
) {
    monitor_rate(device_id, rate_monitor, nv_monitor_threshold);
    let sender_client_no = registry.client_no_of(room_id, device_id).unwrap_or(msg.sender_client_no);
    let outcome = registry.with_room(room_id, false, |room| {
        room.nv.set_client(msg.target_client_no, &msg.name, &msg.value, msg.timestamp, sender_client_no)
    });
    if let Some(outcome) = outcome {
        log_set_outcome(room_id, &msg.name, outcome);
    }
}

fn handle_delta_ack(body: &[u8], room_id: &str, registry: &IdentityRegistry, publisher: &Publisher) {
    let payload: DeltaAckPayload = match nv::decode_msgpack_body(&body[1..]) {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(room_id, %err, "dropping malformed DeltaAck");
            return;
        }
    };
    let snapshot = registry.with_room(room_id, false, |room| {
        room.nv
            .requires_resync(payload.last_seq as i64)
            .then(|| room.nv.build_snapshot_payload())
    });
    if let Some(Some(snapshot)) = snapshot {
        if let Ok(bytes) = nv::encode_msgpack_message(nv::SNAPSHOT_TAG, &snapshot) {
            publisher.publish_other(room_id, bytes);
        }
    }
}

fn dispatch_message(
    frame: &InboundFrame,
    device_id: &str,
    room_id: &str,
    registry: &IdentityRegistry,
    publisher: &Publisher,
    rate_monitor: &Mutex<DeviceRateMonitor>,
    nv_monitor_threshold: u32,
) {
    if frame.body.is_empty() {
        return;
    }
    if frame.body[0] == nv::DELTA_ACK_TAG {
        handle_delta_ack(&frame.body, room_id, registry, publisher);
        return;
    }

    match codec::decode(&frame.body) {
        Ok((Message::ClientTransform(t), _)) => handle_client_transform(t, room_id, registry, publisher),
        Ok((Message::Rpc(r), _)) => handle_rpc(r, device_id, room_id, registry, publisher),
        Ok((Message::RpcTargeted(r), _)) => handle_rpc_targeted(r, device_id, room_id, registry, publisher),
        Ok((Message::GlobalVarSet(v), _)) => {
            handle_global_var_set(v, device_id, room_id, registry, rate_monitor, nv_monitor_threshold)
        }
        Ok((Message::ClientVarSet(v), _)) => {
            handle_client_var_set(v, device_id, room_id, registry, rate_monitor, nv_monitor_threshold)
        }
        Ok((other, _)) => {
            tracing::warn!(room_id, kind = ?other.kind(), "unexpected message kind from client, ignoring");
        }
        Err(err) => {
            tracing::warn!(room_id, %err, "dropping malformed frame");
        }
    }
}

/// The main per-frame receive loop. Runs until `running` is cleared.
pub async fn run_ingress_loop(
    socket: Box<dyn RequestSocket>,
    registry: Arc<IdentityRegistry>,
    publisher: Publisher,
    gate: AppIdGate,
    nv_monitor_threshold: u32,
    running: Arc<AtomicBool>,
) {
    let mut connections: HashMap<Vec<u8>, ConnState> = HashMap::new();
    let rate_monitor = Mutex::new(DeviceRateMonitor::new());
    let counters = HandshakeCounters::default();

    while running.load(Ordering::Relaxed) {
        let frame = match socket.recv_timeout(Duration::from_millis(100)).await {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                tracing::error!(%err, "request socket receive failed");
                continue;
            }
        };

        let state = connections.entry(frame.identity.clone()).or_insert(ConnState::AwaitingHello);
        match state {
            ConnState::Denied => {}
            ConnState::AwaitingHello => {
                *state = process_handshake_frame(&frame, &gate, &registry, &counters);
            }
            ConnState::Active { device_id, room_id } => {
                dispatch_message(&frame, device_id, room_id, &registry, &publisher, &rate_monitor, nv_monitor_threshold);
            }
        }
    }
}

/// Flushes each room's pending NV deltas (and any pending name-table
/// additions ahead of them) on a fixed cadence.
pub async fn run_nv_flush_loop(registry: Arc<IdentityRegistry>, publisher: Publisher, interval: Duration, running: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(interval);
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        for room_id in registry.room_ids() {
            let frames = registry.with_room(&room_id, false, |room| {
                let mut out = Vec::new();
                if let Some(name_delta) = room.nv.collect_name_table_delta() {
                    if let Ok(bytes) = nv::encode_msgpack_message(nv::NAME_TABLE_DELTA_TAG, &name_delta) {
                        out.push(bytes);
                    }
                }
                if let Some(delta) = room.nv.collect_delta_payload() {
                    if let Ok(bytes) = nv::encode_msgpack_message(nv::DELTA_TAG, &delta) {
                        out.push(bytes);
                    }
                }
                out
            });
            if let Some(frames) = frames {
                for bytes in frames {
                    publisher.publish_other(&room_id, bytes);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_core::registry::RegistryLimits;

    fn registry() -> IdentityRegistry {
        IdentityRegistry::new(RegistryLimits {
            device_id_expiry: Duration::from_secs(300),
            delta_ring_size: 10_000,
            max_global_vars: 100,
            max_client_vars: 100,
            max_var_name_bytes: 64,
            max_var_value_bytes: 1024,
        })
    }

    fn hello_body(app_id: &str, device_id: &str) -> Vec<u8> {
        codec::encode_hello(&Hello {
            app_id: app_id.to_string(),
            device_id: device_id.to_string(),
        })
        .unwrap()
    }

    fn hello_frame(app_id: &str, device_id: &str, room_id: &str) -> InboundFrame {
        InboundFrame {
            identity: device_id.as_bytes().to_vec(),
            topic: room_id.to_string(),
            body: hello_body(app_id, device_id),
        }
    }

    #[test]
    fn gate_denies_wrong_app_id_and_allows_permitted_one() {
        let gate = AppIdGate::new(vec!["com.styly.prod".to_string()]);
        assert_eq!(
            handle_hello_attempt(&hello_body("com.other", "dev1"), &gate),
            Err("appId not permitted")
        );
        let hello = handle_hello_attempt(&hello_body("com.styly.prod", "dev1"), &gate).unwrap();
        assert_eq!(hello.device_id, "dev1");
    }

    #[test]
    fn non_hello_first_frame_is_denied() {
        let gate = AppIdGate::default();
        assert!(handle_hello_attempt(&[0xff, 0x00, 0x01], &gate).is_err());
    }

    #[test]
    fn denied_handshake_increases_denied_counter_by_exactly_one() {
        let gate = AppIdGate::new(vec!["com.styly.prod".to_string()]);
        let registry = registry();
        let counters = HandshakeCounters::default();

        let frame = hello_frame("com.other", "dev1", "room1");
        let state = process_handshake_frame(&frame, &gate, &registry, &counters);

        assert!(matches!(state, ConnState::Denied));
        assert_eq!(counters.denied.load(Ordering::Relaxed), 1);
        assert_eq!(counters.allowed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn permitted_handshake_increases_allowed_counter_and_opens_the_identity() {
        let gate = AppIdGate::new(vec!["com.styly.prod".to_string()]);
        let registry = registry();
        let counters = HandshakeCounters::default();

        let frame = hello_frame("com.styly.prod", "dev1", "room1");
        let state = process_handshake_frame(&frame, &gate, &registry, &counters);

        match state {
            ConnState::Active { device_id, room_id } => {
                assert_eq!(device_id, "dev1");
                assert_eq!(room_id, "room1");
            }
            _ => panic!("expected an active connection"),
        }
        assert_eq!(counters.allowed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.denied.load(Ordering::Relaxed), 0);
    }
}
