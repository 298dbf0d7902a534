//! Message types for the room synchronization hub.
//!
//! This module defines the decoded, transport-agnostic form of every message
//! kind carried over the wire. Encoding/decoding to bytes lives in
//! [`crate::codec`]; this module only describes the shapes and the
//! invariants a valid instance must uphold (lengths, caps).
//!
//! # Design goals
//! - **Sealed kind tag**: `Message` is a single enum; once past the decoder
//!   boundary nothing is untyped.
//! - **No `isLocalSpace` on the wire**: inferred true only for the physical
//!   slot, see [`Transform`].
//! - **Caps enforced at construction, not at use**: virtuals/targets/name
//!   lengths are clamped or rejected where a message is built, not
//!   re-checked by every consumer.

pub const MAX_VIRTUAL_TRANSFORMS: usize = 50;
pub const MAX_RPC_TARGETS: usize = 100;
pub const MAX_FUNCTION_NAME_BYTES: usize = 255;
pub const MAX_APP_ID_BYTES: usize = 128;
pub const MAX_DEVICE_ID_BYTES: usize = 64;
pub const MAX_VAR_NAME_BYTES: usize = 64;
pub const MAX_VAR_VALUE_BYTES: usize = 1024;

/// A single-byte wire tag identifying a message's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    ClientTransform,
    RoomTransform,
    Rpc,
    DeviceIdMapping,
    GlobalVarSet,
    GlobalVarSync,
    ClientVarSet,
    ClientVarSync,
    RpcTargeted,
    Hello,
    Snapshot,
    Delta,
    DeltaAck,
    NameTableFull,
    NameTableDelta,
    NameTableDigest,
}

impl Kind {
    /// Maps a kind to its single-byte wire tag. `Hello` has no numeric tag
    /// of its own on the wire; it is recognized structurally as the first
    /// frame on a connection (see `codec::decode_hello`).
    pub fn tag(self) -> Option<u8> {
        match self {
            Kind::ClientTransform => Some(1),
            Kind::RoomTransform => Some(2),
            Kind::Rpc => Some(3),
            Kind::DeviceIdMapping => Some(6),
            Kind::GlobalVarSet => Some(7),
            Kind::GlobalVarSync => Some(8),
            Kind::ClientVarSet => Some(9),
            Kind::ClientVarSync => Some(10),
            Kind::RpcTargeted => Some(11),
            Kind::Hello => None,
            Kind::Snapshot => Some(0x20),
            Kind::Delta => Some(0x21),
            Kind::DeltaAck => Some(0x22),
            Kind::NameTableFull => Some(0x30),
            Kind::NameTableDelta => Some(0x31),
            Kind::NameTableDigest => Some(0x32),
        }
    }

    pub fn from_tag(tag: u8) -> Option<Kind> {
        match tag {
            1 => Some(Kind::ClientTransform),
            2 => Some(Kind::RoomTransform),
            3 => Some(Kind::Rpc),
            6 => Some(Kind::DeviceIdMapping),
            7 => Some(Kind::GlobalVarSet),
            8 => Some(Kind::GlobalVarSync),
            9 => Some(Kind::ClientVarSet),
            10 => Some(Kind::ClientVarSync),
            11 => Some(Kind::RpcTargeted),
            0x20 => Some(Kind::Snapshot),
            0x21 => Some(Kind::Delta),
            0x22 => Some(Kind::DeltaAck),
            0x30 => Some(Kind::NameTableFull),
            0x31 => Some(Kind::NameTableDelta),
            0x32 => Some(Kind::NameTableDigest),
            _ => None,
        }
    }
}

/// Six floats describing a pose. `is_local_space` only carries meaning for
/// the physical slot of a [`ClientTransform`] and is never serialized; the
/// decoder infers it positionally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub pos_x: f32,
    pub pos_y: f32,
    pub pos_z: f32,
    pub rot_x: f32,
    pub rot_y: f32,
    pub rot_z: f32,
}

impl Transform {
    pub const ZERO: Transform = Transform {
        pos_x: 0.0,
        pos_y: 0.0,
        pos_z: 0.0,
        rot_x: 0.0,
        rot_y: 0.0,
        rot_z: 0.0,
    };

    /// True when all six components are NaN, the per-slot half of stealth
    /// detection (the other half is "virtuals empty", checked at the
    /// [`ClientTransform`] level).
    pub fn is_all_nan(&self) -> bool {
        self.pos_x.is_nan()
            && self.pos_y.is_nan()
            && self.pos_z.is_nan()
            && self.rot_x.is_nan()
            && self.rot_y.is_nan()
            && self.rot_z.is_nan()
    }
}

/// A client's own pose update, sent device-ID-addressed before the server
/// has assigned (or while it still remembers) a client number.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientTransform {
    pub device_id: String,
    pub physical: Transform,
    pub head: Transform,
    pub right_hand: Transform,
    pub left_hand: Transform,
    /// Auxiliary tracked objects, clamped to [`MAX_VIRTUAL_TRANSFORMS`] by
    /// the encoder.
    pub virtuals: Vec<Transform>,
}

impl ClientTransform {
    /// Stealth convention: every named slot is all-NaN and there are no
    /// virtuals. Tracked for identity purposes but excluded from broadcast.
    pub fn is_stealth(&self) -> bool {
        self.virtuals.is_empty()
            && self.physical.is_all_nan()
            && self.head.is_all_nan()
            && self.right_hand.is_all_nan()
            && self.left_hand.is_all_nan()
    }
}

/// One client's pose as carried inside a [`RoomTransform`] broadcast: the
/// "short form" addressed by client number instead of device ID.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientTransformEntry {
    pub client_no: u16,
    pub physical: Transform,
    pub head: Transform,
    pub right_hand: Transform,
    pub left_hand: Transform,
    pub virtuals: Vec<Transform>,
}

/// Coalesced room snapshot published by the broadcast scheduler. Built by
/// concatenating cached per-client bodies, never by re-decoding; see
/// `broadcast::BroadcastScheduler`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomTransform {
    pub room_id: String,
    pub clients: Vec<ClientTransformEntry>,
}

/// Broadcast or targeted remote procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct Rpc {
    pub sender_client_no: u16,
    pub function_name: String,
    /// Opaque to the server; conventionally JSON but never parsed here.
    pub arguments_json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcTargeted {
    pub sender_client_no: u16,
    /// Capped at [`MAX_RPC_TARGETS`].
    pub target_client_nos: Vec<u16>,
    pub function_name: String,
    pub arguments_json: String,
}

/// One entry in a [`DeviceIdMapping`] broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdMappingEntry {
    pub client_no: u16,
    pub stealth: bool,
    pub device_id: String,
}

/// Full device-ID ↔ client-number mapping for a room, excluding stealth
/// entries. Carries a protocol-version header ahead of the kind tag.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdMapping {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub protocol_patch: u8,
    pub entries: Vec<DeviceIdMappingEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVarSet {
    pub sender_client_no: u16,
    pub name: String,
    pub value: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVarEntry {
    pub name: String,
    pub value: String,
    pub timestamp: f64,
    pub last_writer_client_no: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVarSync {
    pub entries: Vec<GlobalVarEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientVarSet {
    pub sender_client_no: u16,
    pub target_client_no: u16,
    pub name: String,
    pub value: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientVarBlock {
    pub client_no: u16,
    pub vars: Vec<GlobalVarEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientVarSync {
    pub clients: Vec<ClientVarBlock>,
}

/// First frame on a connection. Anything else as the first frame, or a
/// Hello that fails the application-identity gate, closes the identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub app_id: String,
    pub device_id: String,
}

/// Full top-level message enum. Once a frame has been decoded into this
/// enum, handlers match on it directly; nothing downstream re-parses bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ClientTransform(ClientTransform),
    RoomTransform(RoomTransform),
    Rpc(Rpc),
    RpcTargeted(RpcTargeted),
    DeviceIdMapping(DeviceIdMapping),
    GlobalVarSet(GlobalVarSet),
    GlobalVarSync(GlobalVarSync),
    ClientVarSet(ClientVarSet),
    ClientVarSync(ClientVarSync),
    Hello(Hello),
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::ClientTransform(_) => Kind::ClientTransform,
            Message::RoomTransform(_) => Kind::RoomTransform,
            Message::Rpc(_) => Kind::Rpc,
            Message::RpcTargeted(_) => Kind::RpcTargeted,
            Message::DeviceIdMapping(_) => Kind::DeviceIdMapping,
            Message::GlobalVarSet(_) => Kind::GlobalVarSet,
            Message::GlobalVarSync(_) => Kind::GlobalVarSync,
            Message::ClientVarSet(_) => Kind::ClientVarSet,
            Message::ClientVarSync(_) => Kind::ClientVarSync,
            Message::Hello(_) => Kind::Hello,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stealth_requires_all_slots_nan_and_no_virtuals() {
        let nan = Transform {
            pos_x: f32::NAN,
            pos_y: f32::NAN,
            pos_z: f32::NAN,
            rot_x: f32::NAN,
            rot_y: f32::NAN,
            rot_z: f32::NAN,
        };
        let stealthy = ClientTransform {
            device_id: "dev-a".into(),
            physical: nan,
            head: nan,
            right_hand: nan,
            left_hand: nan,
            virtuals: vec![],
        };
        assert!(stealthy.is_stealth());

        let mut not_stealthy = stealthy.clone();
        not_stealthy.virtuals.push(Transform::ZERO);
        assert!(!not_stealthy.is_stealth());

        let mut partially_real = stealthy.clone();
        partially_real.physical = Transform::ZERO;
        assert!(!partially_real.is_stealth());
    }

    #[test]
    fn kind_tag_roundtrip() {
        for kind in [
            Kind::ClientTransform,
            Kind::RoomTransform,
            Kind::Rpc,
            Kind::DeviceIdMapping,
            Kind::GlobalVarSet,
            Kind::GlobalVarSync,
            Kind::ClientVarSet,
            Kind::ClientVarSync,
            Kind::RpcTargeted,
            Kind::Snapshot,
            Kind::Delta,
            Kind::DeltaAck,
            Kind::NameTableFull,
            Kind::NameTableDelta,
            Kind::NameTableDigest,
        ] {
            let tag = kind.tag().expect("kind has a wire tag");
            assert_eq!(Kind::from_tag(tag), Some(kind));
        }
    }
}
