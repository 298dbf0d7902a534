//! Identity & room registry (component C3): device-ID ↔ client-number
//! mapping, room membership, and the per-room NV state that hangs off it.
//!
//! Grounded on `server.py`'s `groups`/`group_device_id_to_client_no`/
//! `group_client_no_to_device_id`/`device_id_last_seen` structures, folded
//! into one `Room` record. A single `parking_lot::Mutex` guards everything
//! here; every public method does its work and returns before the caller
//! touches a socket, so the lock is never held across I/O.

use crate::codec::encode_client_transform_entry;
use crate::error::RoomError;
use crate::nv::NvState;
use crate::protocol::{ClientTransform, ClientTransformEntry, DeviceIdMapping, DeviceIdMappingEntry};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const PROTOCOL_VERSION: (u8, u8, u8) = (1, 0, 0);

#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    pub device_id_expiry: Duration,
    pub delta_ring_size: usize,
    pub max_global_vars: usize,
    pub max_client_vars: usize,
    pub max_var_name_bytes: usize,
    pub max_var_value_bytes: usize,
}

/// One device's state within a room.
pub struct ClientRecord {
    pub client_no: u16,
    pub last_update: Instant,
    pub stealth: bool,
    /// Short-form bytes for this client, ready to splice into a
    /// `RoomTransform` frame. `None` until the first transform is accepted.
    cached_payload: Option<Vec<u8>>,
}

/// A named broadcast domain: membership, mappings, dirty/broadcast timing,
/// and NV state. The two device-ID / client-number maps are kept as mutual
/// inverses at all times.
pub struct Room {
    pub room_id: String,
    clients: IndexMap<String, ClientRecord>,
    device_to_no: HashMap<String, u16>,
    no_to_device: HashMap<u16, String>,
    next_client_no: u32,
    pub dirty: bool,
    pub last_broadcast: Instant,
    pub empty_since: Option<Instant>,
    pub nv: NvState,
}

impl Room {
    fn new(room_id: &str, limits: &RegistryLimits) -> Self {
        Self {
            room_id: room_id.to_string(),
            clients: IndexMap::new(),
            device_to_no: HashMap::new(),
            no_to_device: HashMap::new(),
            next_client_no: 1,
            dirty: false,
            last_broadcast: Instant::now(),
            empty_since: None,
            nv: NvState::with_limits(
                room_id,
                limits.delta_ring_size,
                limits.max_global_vars,
                limits.max_client_vars,
                limits.max_var_name_bytes,
                limits.max_var_value_bytes,
            ),
        }
    }

    fn reclaim_client_no(&mut self, device_last_seen: &HashMap<String, Instant>, expiry: Duration) -> Option<u16> {
        let now = Instant::now();
        let stale = self.no_to_device.iter().find_map(|(no, device_id)| {
            let expired = match device_last_seen.get(device_id) {
                None => true,
                Some(seen) => now.duration_since(*seen) > expiry,
            };
            expired.then_some((*no, device_id.clone()))
        });
        let (no, device_id) = stale?;
        self.no_to_device.remove(&no);
        self.device_to_no.remove(&device_id);
        self.clients.shift_remove(&device_id);
        Some(no)
    }

    /// Non-stealth clients, in join order, for broadcast/mapping payloads.
    fn visible_clients(&self) -> impl Iterator<Item = (&String, &ClientRecord)> {
        self.clients.iter().filter(|(_, c)| !c.stealth)
    }

    pub fn device_id_mapping_payload(&self) -> DeviceIdMapping {
        let (major, minor, patch) = PROTOCOL_VERSION;
        DeviceIdMapping {
            protocol_major: major,
            protocol_minor: minor,
            protocol_patch: patch,
            entries: self
                .visible_clients()
                .map(|(device_id, c)| DeviceIdMappingEntry {
                    client_no: c.client_no,
                    stealth: false,
                    device_id: device_id.clone(),
                })
                .collect(),
        }
    }

    /// Concatenates cached per-client bodies for every non-stealth client,
    /// in insertion order, prefixed by the `RoomTransform` header. Empty
    /// rooms are the caller's responsibility to skip.
    pub fn room_transform_frame(&self) -> Result<Vec<u8>, crate::error::CodecError> {
        let cached: Vec<&[u8]> = self
            .visible_clients()
            .filter_map(|(_, c)| c.cached_payload.as_deref())
            .collect();
        let mut buf = crate::codec::encode_room_transform_header(&self.room_id, cached.len() as u16)?;
        for bytes in cached {
            buf.extend_from_slice(bytes);
        }
        Ok(buf)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn visible_client_count(&self) -> usize {
        self.visible_clients().count()
    }
}

struct Inner {
    rooms: HashMap<String, Room>,
    device_last_seen: HashMap<String, Instant>,
}

/// The registry. Cloneable handle pattern: wrap in `Arc` at the call site
/// (it already owns its lock internally).
pub struct IdentityRegistry {
    inner: Mutex<Inner>,
    limits: RegistryLimits,
}

/// Result of accepting a `ClientTransform`, returned so the caller (the
/// ingress dispatcher) knows whether a DeviceIdMapping rebroadcast is due.
pub struct TransformAccepted {
    pub client_no: u16,
    pub newly_visible: bool,
}

impl IdentityRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rooms: HashMap::new(),
                device_last_seen: HashMap::new(),
            }),
            limits,
        }
    }

    /// Runs `f` with exclusive access to `room_id`'s room, creating it
    /// lazily if `create` is true. Keeps serialization of any payload built
    /// inside `f` safely inside the lock; `f` must never perform I/O.
    pub fn with_room<R>(&self, room_id: &str, create: bool, f: impl FnOnce(&mut Room) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        if create && !inner.rooms.contains_key(room_id) {
            let room = Room::new(room_id, &self.limits);
            inner.rooms.insert(room_id.to_string(), room);
        }
        inner.rooms.get_mut(room_id).map(f)
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.inner.lock().rooms.keys().cloned().collect()
    }

    pub fn mark_seen(&self, device_id: &str) {
        self.inner
            .lock()
            .device_last_seen
            .insert(device_id.to_string(), Instant::now());
    }

    /// Returns the device's existing client number in `room_id`, or
    /// allocates one. Reclaims an expired slot when the 16-bit counter
    /// would overflow; fails with [`RoomError::RoomExhausted`] if nothing
    /// is reclaimable.
    pub fn get_or_assign_client_no(&self, room_id: &str, device_id: &str) -> Result<u16, RoomError> {
        let mut inner = self.inner.lock();
        inner.device_last_seen.insert(device_id.to_string(), Instant::now());
        let expiry = self.limits.device_id_expiry;
        let device_last_seen = inner.device_last_seen.clone();
        let limits = self.limits;
        let room = inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id, &limits));

        if let Some(no) = room.device_to_no.get(device_id) {
            return Ok(*no);
        }

        let client_no = if room.next_client_no > u16::MAX as u32 {
            room.reclaim_client_no(&device_last_seen, expiry)
                .ok_or(RoomError::RoomExhausted)?
        } else {
            let no = room.next_client_no as u16;
            room.next_client_no += 1;
            no
        };

        room.device_to_no.insert(device_id.to_string(), client_no);
        room.no_to_device.insert(client_no, device_id.to_string());
        Ok(client_no)
    }

    pub fn device_id_of(&self, room_id: &str, client_no: u16) -> Option<String> {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .and_then(|r| r.no_to_device.get(&client_no).cloned())
    }

    pub fn client_no_of(&self, room_id: &str, device_id: &str) -> Option<u16> {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .and_then(|r| r.device_to_no.get(device_id).copied())
    }

    /// Applies an accepted `ClientTransform`: resolves the client number,
    /// marks the room dirty, stores the cached short-form payload, and
    /// reports whether this is the device's first non-stealth appearance
    /// (the trigger for a DeviceIdMapping rebroadcast).
    pub fn apply_client_transform(
        &self,
        room_id: &str,
        transform: &ClientTransform,
    ) -> Result<TransformAccepted, RoomError> {
        let stealth = transform.is_stealth();
        let client_no = self.get_or_assign_client_no(room_id, &transform.device_id)?;

        let mut inner = self.inner.lock();
        let room = inner.rooms.get_mut(room_id).expect("room created by get_or_assign_client_no");

        let was_present = room.clients.contains_key(&transform.device_id);
        let was_visible = room
            .clients
            .get(&transform.device_id)
            .map(|c| !c.stealth)
            .unwrap_or(false);

        let entry = ClientTransformEntry {
            client_no,
            physical: transform.physical,
            head: transform.head,
            right_hand: transform.right_hand,
            left_hand: transform.left_hand,
            virtuals: transform.virtuals.clone(),
        };
        let cached_payload = (!stealth).then(|| encode_client_transform_entry(&entry));

        room.clients.insert(
            transform.device_id.clone(),
            ClientRecord {
                client_no,
                last_update: Instant::now(),
                stealth,
                cached_payload,
            },
        );
        if !stealth {
            room.dirty = true;
        }
        room.empty_since = None;

        let newly_visible = !stealth && (!was_present || !was_visible);
        Ok(TransformAccepted { client_no, newly_visible })
    }

    /// Removes every client whose `last_update` is older than
    /// `client_timeout` from every room. Returns the room IDs that lost at
    /// least one client (they need their dirty bit set and a
    /// DeviceIdMapping rebroadcast).
    pub fn sweep_timed_out_clients(&self, client_timeout: Duration) -> Vec<String> {
        let mut affected = Vec::new();
        let mut inner = self.inner.lock();
        let now = Instant::now();
        for (room_id, room) in inner.rooms.iter_mut() {
            let expired: Vec<String> = room
                .clients
                .iter()
                .filter(|(_, c)| now.duration_since(c.last_update) > client_timeout)
                .map(|(device_id, _)| device_id.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            for device_id in &expired {
                room.clients.shift_remove(device_id);
                if let Some(no) = room.device_to_no.remove(device_id) {
                    room.no_to_device.remove(&no);
                }
            }
            room.dirty = true;
            affected.push(room_id.clone());
        }
        affected
    }

    /// Marks rooms empty/non-empty and destroys rooms that have been empty
    /// past `empty_room_expiry`.
    pub fn sweep_room_lifecycle(&self, empty_room_expiry: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.rooms.retain(|_, room| {
            if room.clients.is_empty() {
                match room.empty_since {
                    None => {
                        room.empty_since = Some(now);
                        true
                    }
                    Some(since) => now.duration_since(since) <= empty_room_expiry,
                }
            } else {
                room.empty_since = None;
                true
            }
        });
    }

    /// Purges process-wide device-ID entries unseen for longer than
    /// `device_id_expiry`, and any residual room mapping for them.
    pub fn purge_expired_device_ids(&self, device_id_expiry: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .device_last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > device_id_expiry)
            .map(|(device_id, _)| device_id.clone())
            .collect();
        for device_id in &expired {
            inner.device_last_seen.remove(device_id);
        }
        for room in inner.rooms.values_mut() {
            for device_id in &expired {
                if let Some(no) = room.device_to_no.remove(device_id) {
                    room.no_to_device.remove(&no);
                }
                room.clients.shift_remove(device_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Transform;

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

    fn stealth_transform(device_id: &str) -> ClientTransform {
        let nan = Transform {
            pos_x: f32::NAN,
            pos_y: f32::NAN,
            pos_z: f32::NAN,
            rot_x: f32::NAN,
            rot_y: f32::NAN,
            rot_z: f32::NAN,
        };
        ClientTransform {
            device_id: device_id.to_string(),
            physical: nan,
            head: nan,
            right_hand: nan,
            left_hand: nan,
            virtuals: vec![],
        }
    }

    #[test]
    fn device_to_client_no_mapping_is_a_mutual_inverse() {
        let registry = IdentityRegistry::new(limits());
        let no_a = registry.get_or_assign_client_no("r1", "dev-a").unwrap();
        let no_b = registry.get_or_assign_client_no("r1", "dev-b").unwrap();
        assert_ne!(no_a, no_b);
        assert_eq!(registry.device_id_of("r1", no_a).unwrap(), "dev-a");
        assert_eq!(registry.client_no_of("r1", "dev-a").unwrap(), no_a);
        // repeat calls are stable
        assert_eq!(registry.get_or_assign_client_no("r1", "dev-a").unwrap(), no_a);
    }

    #[test]
    fn stealth_client_is_tracked_but_never_broadcast() {
        let registry = IdentityRegistry::new(limits());
        let accepted = registry
            .apply_client_transform("r1", &stealth_transform("dev-stealth"))
            .unwrap();
        assert!(!accepted.newly_visible);
        registry
            .apply_client_transform("r1", &transform("dev-visible"))
            .unwrap();

        let frame = registry.with_room("r1", false, |room| room.room_transform_frame().unwrap()).unwrap();
        // header: tag(1) + roomIdLen(1) + "r1"(2) + clientCount(2) = 6 bytes,
        // then exactly one client entry follows.
        assert_eq!(frame[6], 0); // absence of a second clientNo byte pair would panic on index if two were present
        let mapping = registry.with_room("r1", false, |room| room.device_id_mapping_payload()).unwrap();
        assert_eq!(mapping.entries.len(), 1);
        assert_eq!(mapping.entries[0].device_id, "dev-visible");
    }

    #[test]
    fn timed_out_clients_are_swept_and_room_marked_dirty() {
        let registry = IdentityRegistry::new(limits());
        registry.apply_client_transform("r1", &transform("dev-a")).unwrap();
        registry.with_room("r1", false, |room| {
            room.clients.get_mut("dev-a").unwrap().last_update =
                Instant::now() - Duration::from_secs(10);
        });
        let affected = registry.sweep_timed_out_clients(Duration::from_secs(1));
        assert_eq!(affected, vec!["r1".to_string()]);
        assert_eq!(registry.with_room("r1", false, |room| room.client_count()), Some(0));
    }

    #[test]
    fn empty_room_is_destroyed_after_expiry() {
        let registry = IdentityRegistry::new(limits());
        registry.apply_client_transform("r1", &transform("dev-a")).unwrap();
        registry.sweep_timed_out_clients(Duration::from_secs(0));
        registry.with_room("r1", false, |room| {
            room.empty_since = Some(Instant::now() - Duration::from_secs(100));
        });
        registry.sweep_room_lifecycle(Duration::from_secs(1));
        assert!(registry.with_room("r1", false, |_| ()).is_none());
    }
}
