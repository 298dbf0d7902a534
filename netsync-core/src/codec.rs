//! Binary wire codec for the fixed-layout message kinds (1, 2, 3, 6-11, and
//! the Hello handshake). The MessagePack-encoded NV delta protocol messages
//! (Snapshot, Delta, DeltaAck, NameTable*) are encoded/decoded in
//! [`crate::nv`], next to the structs they carry.
//!
//! Every string field is length-prefixed: a 1-byte prefix for short fields
//! (names, device IDs), a 2-byte prefix for `argumentsJson` and NV values.
//! All multi-byte integers and floats are little-endian. Decoding never
//! panics on malformed input; every failure is a [`CodecError`].

use crate::error::CodecError;
use crate::protocol::*;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.pos + n > self.data.len() {
            Err(CodecError::Truncated {
                needed: self.pos + n,
                got: self.data.len(),
            })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn f32(&mut self) -> Result<f32, CodecError> {
        self.need(4)?;
        let bytes: [u8; 4] = self.data[self.pos..self.pos + 4].try_into().unwrap();
        self.pos += 4;
        Ok(f32::from_le_bytes(bytes))
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        self.need(8)?;
        let bytes: [u8; 8] = self.data[self.pos..self.pos + 8].try_into().unwrap();
        self.pos += 8;
        Ok(f64::from_le_bytes(bytes))
    }

    fn transform(&mut self) -> Result<Transform, CodecError> {
        Ok(Transform {
            pos_x: self.f32()?,
            pos_y: self.f32()?,
            pos_z: self.f32()?,
            rot_x: self.f32()?,
            rot_y: self.f32()?,
            rot_z: self.f32()?,
        })
    }

    fn string(&mut self, ushort: bool) -> Result<String, CodecError> {
        let len = if ushort {
            self.u16()? as usize
        } else {
            self.u8()? as usize
        };
        self.need(len)?;
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn transform(&mut self, t: &Transform) {
        self.f32(t.pos_x);
        self.f32(t.pos_y);
        self.f32(t.pos_z);
        self.f32(t.rot_x);
        self.f32(t.rot_y);
        self.f32(t.rot_z);
    }

    /// Writes a length-prefixed string. Returns an error instead of
    /// truncating when the source exceeds the prefix's capacity, matching
    /// the "any source field exceeding its prefix's capacity is an encoding
    /// error" rule for fields that are not explicitly documented as
    /// clamped elsewhere (virtuals, NV name/value truncation are handled
    /// by their callers before reaching the codec).
    fn string(
        &mut self,
        field: &'static str,
        s: &str,
        ushort: bool,
    ) -> Result<(), CodecError> {
        let bytes = s.as_bytes();
        let max = if ushort { u16::MAX as usize } else { u8::MAX as usize };
        if bytes.len() > max {
            return Err(CodecError::FieldTooLong {
                field,
                len: bytes.len(),
            });
        }
        if ushort {
            self.u16(bytes.len() as u16);
        } else {
            self.u8(bytes.len() as u8);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

fn clamp_virtuals(virtuals: &[Transform]) -> &[Transform] {
    let n = virtuals.len().min(MAX_VIRTUAL_TRANSFORMS);
    &virtuals[..n]
}

fn write_virtuals(w: &mut Writer, virtuals: &[Transform]) {
    let clamped = clamp_virtuals(virtuals);
    w.u8(clamped.len() as u8);
    for t in clamped {
        w.transform(t);
    }
}

fn read_virtuals(r: &mut Reader) -> Result<Vec<Transform>, CodecError> {
    let count = r.u8()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(r.transform()?);
    }
    Ok(out)
}

pub fn encode_client_transform(msg: &ClientTransform) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.u8(Kind::ClientTransform.tag().unwrap());
    w.string("deviceId", &msg.device_id, false)?;
    w.transform(&msg.physical);
    w.transform(&msg.head);
    w.transform(&msg.right_hand);
    w.transform(&msg.left_hand);
    write_virtuals(&mut w, &msg.virtuals);
    Ok(w.into_vec())
}

fn decode_client_transform(r: &mut Reader) -> Result<ClientTransform, CodecError> {
    let device_id = r.string(false)?;
    let physical = r.transform()?;
    let head = r.transform()?;
    let right_hand = r.transform()?;
    let left_hand = r.transform()?;
    let virtuals = read_virtuals(r)?;
    Ok(ClientTransform {
        device_id,
        physical,
        head,
        right_hand,
        left_hand,
        virtuals,
    })
}

/// Encodes the short-form per-client body that appears inside a
/// [`RoomTransform`] (client number instead of device ID). The broadcast
/// scheduler caches exactly these bytes per client so a tick only has to
/// concatenate them, never re-walk every client's transform fields.
pub fn encode_client_transform_entry(entry: &ClientTransformEntry) -> Vec<u8> {
    let mut w = Writer::new();
    w.u16(entry.client_no);
    w.transform(&entry.physical);
    w.transform(&entry.head);
    w.transform(&entry.right_hand);
    w.transform(&entry.left_hand);
    write_virtuals(&mut w, &entry.virtuals);
    w.into_vec()
}

/// Encodes the `<kind><roomIdLen><roomId><clientCount>` prefix of a
/// `RoomTransform` frame; callers append `client_count` cached
/// [`encode_client_transform_entry`] bodies after this.
pub fn encode_room_transform_header(room_id: &str, client_count: u16) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.u8(Kind::RoomTransform.tag().unwrap());
    w.string("roomId", room_id, false)?;
    w.u16(client_count);
    Ok(w.into_vec())
}

pub fn encode_room_transform(msg: &RoomTransform) -> Result<Vec<u8>, CodecError> {
    let mut buf = encode_room_transform_header(&msg.room_id, msg.clients.len() as u16)?;
    for c in &msg.clients {
        buf.extend(encode_client_transform_entry(c));
    }
    Ok(buf)
}

fn decode_room_transform(r: &mut Reader) -> Result<RoomTransform, CodecError> {
    let room_id = r.string(false)?;
    let count = r.u16()? as usize;
    let mut clients = Vec::with_capacity(count);
    for _ in 0..count {
        let client_no = r.u16()?;
        let physical = r.transform()?;
        let head = r.transform()?;
        let right_hand = r.transform()?;
        let left_hand = r.transform()?;
        let virtuals = read_virtuals(r)?;
        clients.push(ClientTransformEntry {
            client_no,
            physical,
            head,
            right_hand,
            left_hand,
            virtuals,
        });
    }
    Ok(RoomTransform { room_id, clients })
}

pub fn encode_rpc(msg: &Rpc) -> Result<Vec<u8>, CodecError> {
    if msg.function_name.as_bytes().len() > MAX_FUNCTION_NAME_BYTES {
        return Err(CodecError::FieldTooLong {
            field: "functionName",
            len: msg.function_name.as_bytes().len(),
        });
    }
    let mut w = Writer::new();
    w.u8(Kind::Rpc.tag().unwrap());
    w.u16(msg.sender_client_no);
    w.string("functionName", &msg.function_name, false)?;
    w.string("argumentsJson", &msg.arguments_json, true)?;
    Ok(w.into_vec())
}

fn decode_rpc(r: &mut Reader) -> Result<Rpc, CodecError> {
    let sender_client_no = r.u16()?;
    let function_name = r.string(false)?;
    let arguments_json = r.string(true)?;
    Ok(Rpc {
        sender_client_no,
        function_name,
        arguments_json,
    })
}

pub fn encode_rpc_targeted(msg: &RpcTargeted) -> Result<Vec<u8>, CodecError> {
    if msg.target_client_nos.len() > MAX_RPC_TARGETS {
        return Err(CodecError::FieldTooLong {
            field: "targetClientNos",
            len: msg.target_client_nos.len(),
        });
    }
    if msg.function_name.as_bytes().len() > MAX_FUNCTION_NAME_BYTES {
        return Err(CodecError::FieldTooLong {
            field: "functionName",
            len: msg.function_name.as_bytes().len(),
        });
    }
    let mut w = Writer::new();
    w.u8(Kind::RpcTargeted.tag().unwrap());
    w.u16(msg.sender_client_no);
    w.u16(msg.target_client_nos.len() as u16);
    for t in &msg.target_client_nos {
        w.u16(*t);
    }
    w.string("functionName", &msg.function_name, false)?;
    w.string("argumentsJson", &msg.arguments_json, true)?;
    Ok(w.into_vec())
}

fn decode_rpc_targeted(r: &mut Reader) -> Result<RpcTargeted, CodecError> {
    let sender_client_no = r.u16()?;
    let target_count = r.u16()? as usize;
    let mut target_client_nos = Vec::with_capacity(target_count);
    for _ in 0..target_count {
        target_client_nos.push(r.u16()?);
    }
    let function_name = r.string(false)?;
    let arguments_json = r.string(true)?;
    Ok(RpcTargeted {
        sender_client_no,
        target_client_nos,
        function_name,
        arguments_json,
    })
}

pub fn encode_device_id_mapping(msg: &DeviceIdMapping) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.u8(Kind::DeviceIdMapping.tag().unwrap());
    w.u8(msg.protocol_major);
    w.u8(msg.protocol_minor);
    w.u8(msg.protocol_patch);
    w.u16(msg.entries.len() as u16);
    for e in &msg.entries {
        w.u16(e.client_no);
        w.u8(if e.stealth { 1 } else { 0 });
        w.string("deviceId", &e.device_id, false)?;
    }
    Ok(w.into_vec())
}

fn decode_device_id_mapping(r: &mut Reader) -> Result<DeviceIdMapping, CodecError> {
    let protocol_major = r.u8()?;
    let protocol_minor = r.u8()?;
    let protocol_patch = r.u8()?;
    let count = r.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let client_no = r.u16()?;
        let stealth = r.u8()? != 0;
        let device_id = r.string(false)?;
        entries.push(DeviceIdMappingEntry {
            client_no,
            stealth,
            device_id,
        });
    }
    Ok(DeviceIdMapping {
        protocol_major,
        protocol_minor,
        protocol_patch,
        entries,
    })
}

pub fn encode_global_var_set(msg: &GlobalVarSet) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.u8(Kind::GlobalVarSet.tag().unwrap());
    w.u16(msg.sender_client_no);
    w.string("name", &msg.name, false)?;
    w.string("value", &msg.value, true)?;
    w.f64(msg.timestamp);
    Ok(w.into_vec())
}

fn decode_global_var_set(r: &mut Reader) -> Result<GlobalVarSet, CodecError> {
    let sender_client_no = r.u16()?;
    let name = r.string(false)?;
    let value = r.string(true)?;
    let timestamp = r.f64()?;
    Ok(GlobalVarSet {
        sender_client_no,
        name,
        value,
        timestamp,
    })
}

fn write_global_var_entry(w: &mut Writer, e: &GlobalVarEntry) -> Result<(), CodecError> {
    w.string("name", &e.name, false)?;
    w.string("value", &e.value, true)?;
    w.f64(e.timestamp);
    w.u16(e.last_writer_client_no);
    Ok(())
}

fn read_global_var_entry(r: &mut Reader) -> Result<GlobalVarEntry, CodecError> {
    let name = r.string(false)?;
    let value = r.string(true)?;
    let timestamp = r.f64()?;
    let last_writer_client_no = r.u16()?;
    Ok(GlobalVarEntry {
        name,
        value,
        timestamp,
        last_writer_client_no,
    })
}

pub fn encode_global_var_sync(msg: &GlobalVarSync) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.u8(Kind::GlobalVarSync.tag().unwrap());
    w.u16(msg.entries.len() as u16);
    for e in &msg.entries {
        write_global_var_entry(&mut w, e)?;
    }
    Ok(w.into_vec())
}

fn decode_global_var_sync(r: &mut Reader) -> Result<GlobalVarSync, CodecError> {
    let count = r.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(read_global_var_entry(r)?);
    }
    Ok(GlobalVarSync { entries })
}

pub fn encode_client_var_set(msg: &ClientVarSet) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.u8(Kind::ClientVarSet.tag().unwrap());
    w.u16(msg.sender_client_no);
    w.u16(msg.target_client_no);
    w.string("name", &msg.name, false)?;
    w.string("value", &msg.value, true)?;
    w.f64(msg.timestamp);
    Ok(w.into_vec())
}

fn decode_client_var_set(r: &mut Reader) -> Result<ClientVarSet, CodecError> {
    let sender_client_no = r.u16()?;
    let target_client_no = r.u16()?;
    let name = r.string(false)?;
    let value = r.string(true)?;
    let timestamp = r.f64()?;
    Ok(ClientVarSet {
        sender_client_no,
        target_client_no,
        name,
        value,
        timestamp,
    })
}

pub fn encode_client_var_sync(msg: &ClientVarSync) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.u8(Kind::ClientVarSync.tag().unwrap());
    w.u16(msg.clients.len() as u16);
    for block in &msg.clients {
        w.u16(block.client_no);
        w.u16(block.vars.len() as u16);
        for e in &block.vars {
            write_global_var_entry(&mut w, e)?;
        }
    }
    Ok(w.into_vec())
}

fn decode_client_var_sync(r: &mut Reader) -> Result<ClientVarSync, CodecError> {
    let client_count = r.u16()? as usize;
    let mut clients = Vec::with_capacity(client_count);
    for _ in 0..client_count {
        let client_no = r.u16()?;
        let var_count = r.u16()? as usize;
        let mut vars = Vec::with_capacity(var_count);
        for _ in 0..var_count {
            vars.push(read_global_var_entry(r)?);
        }
        clients.push(ClientVarBlock { client_no, vars });
    }
    Ok(ClientVarSync { clients })
}

/// Decodes the Hello handshake frame. Structurally recognized (no kind
/// tag of its own); callers decide a frame is a Hello by it being the
/// first frame seen from a given transport identity.
pub fn decode_hello(data: &[u8]) -> Result<Hello, CodecError> {
    let mut r = Reader::new(data);
    let app_id = r.string(false)?;
    let device_id = r.string(false)?;
    Ok(Hello { app_id, device_id })
}

pub fn encode_hello(msg: &Hello) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.string("appId", &msg.app_id, false)?;
    w.string("deviceId", &msg.device_id, false)?;
    Ok(w.into_vec())
}

/// Decodes a framed body into a [`Message`], returning the raw body
/// verbatim alongside it. The raw bytes are only meaningful for
/// `ClientTransform`, where the broadcast scheduler reuses them unchanged
/// as the cached per-client payload; callers may ignore them otherwise.
pub fn decode(data: &[u8]) -> Result<(Message, &[u8]), CodecError> {
    if data.is_empty() {
        return Err(CodecError::Truncated { needed: 1, got: 0 });
    }
    let tag = data[0];
    let kind = Kind::from_tag(tag).ok_or(CodecError::UnknownKind(tag))?;
    let mut r = Reader::new(&data[1..]);
    let message = match kind {
        Kind::ClientTransform => Message::ClientTransform(decode_client_transform(&mut r)?),
        Kind::RoomTransform => Message::RoomTransform(decode_room_transform(&mut r)?),
        Kind::Rpc => Message::Rpc(decode_rpc(&mut r)?),
        Kind::RpcTargeted => Message::RpcTargeted(decode_rpc_targeted(&mut r)?),
        Kind::DeviceIdMapping => Message::DeviceIdMapping(decode_device_id_mapping(&mut r)?),
        Kind::GlobalVarSet => Message::GlobalVarSet(decode_global_var_set(&mut r)?),
        Kind::GlobalVarSync => Message::GlobalVarSync(decode_global_var_sync(&mut r)?),
        Kind::ClientVarSet => Message::ClientVarSet(decode_client_var_set(&mut r)?),
        Kind::ClientVarSync => Message::ClientVarSync(decode_client_var_sync(&mut r)?),
        Kind::Hello | Kind::Snapshot | Kind::Delta | Kind::DeltaAck | Kind::NameTableFull
        | Kind::NameTableDelta | Kind::NameTableDigest => {
            return Err(CodecError::UnknownKind(tag));
        }
    };
    let _ = r.remaining();
    Ok((message, data))
}

pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    match message {
        Message::ClientTransform(m) => encode_client_transform(m),
        Message::RoomTransform(m) => encode_room_transform(m),
        Message::Rpc(m) => encode_rpc(m),
        Message::RpcTargeted(m) => encode_rpc_targeted(m),
        Message::DeviceIdMapping(m) => encode_device_id_mapping(m),
        Message::GlobalVarSet(m) => encode_global_var_set(m),
        Message::GlobalVarSync(m) => encode_global_var_sync(m),
        Message::ClientVarSet(m) => encode_client_var_set(m),
        Message::ClientVarSync(m) => encode_client_var_sync(m),
        Message::Hello(m) => encode_hello(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transform(seed: f32) -> Transform {
        Transform {
            pos_x: seed,
            pos_y: seed + 1.0,
            pos_z: seed + 2.0,
            rot_x: seed + 3.0,
            rot_y: seed + 4.0,
            rot_z: seed + 5.0,
        }
    }

    #[test]
    fn client_transform_roundtrips() {
        let msg = ClientTransform {
            device_id: "device-a".into(),
            physical: sample_transform(0.0),
            head: sample_transform(10.0),
            right_hand: sample_transform(20.0),
            left_hand: sample_transform(30.0),
            virtuals: vec![sample_transform(40.0), sample_transform(50.0)],
        };
        let encoded = encode_client_transform(&msg).unwrap();
        let (decoded, raw) = decode(&encoded).unwrap();
        assert_eq!(raw, encoded.as_slice());
        match decoded {
            Message::ClientTransform(got) => assert_eq!(got, msg),
            _ => panic!("wrong kind decoded"),
        }
    }

    #[test]
    fn virtuals_beyond_fifty_are_clamped_on_encode() {
        let msg = ClientTransform {
            device_id: "d".into(),
            physical: Transform::ZERO,
            head: Transform::ZERO,
            right_hand: Transform::ZERO,
            left_hand: Transform::ZERO,
            virtuals: (0..51).map(|i| sample_transform(i as f32)).collect(),
        };
        let encoded = encode_client_transform(&msg).unwrap();
        let (decoded, _) = decode(&encoded).unwrap();
        match decoded {
            Message::ClientTransform(got) => assert_eq!(got.virtuals.len(), MAX_VIRTUAL_TRANSFORMS),
            _ => panic!("wrong kind decoded"),
        }
    }

    #[test]
    fn rpc_targeted_roundtrips_and_rejects_overlong_function_name() {
        let msg = RpcTargeted {
            sender_client_no: 1,
            target_client_nos: vec![2, 3, 5],
            function_name: "Ping".into(),
            arguments_json: "[]".into(),
        };
        let encoded = encode_rpc_targeted(&msg).unwrap();
        let (decoded, _) = decode(&encoded).unwrap();
        match decoded {
            Message::RpcTargeted(got) => assert_eq!(got, msg),
            _ => panic!("wrong kind decoded"),
        }

        let overlong = RpcTargeted {
            function_name: "x".repeat(256),
            ..msg
        };
        assert!(matches!(
            encode_rpc_targeted(&overlong),
            Err(CodecError::FieldTooLong { field: "functionName", .. })
        ));
    }

    #[test]
    fn hello_roundtrips() {
        let msg = Hello {
            app_id: "com.styly.prod".into(),
            device_id: "device-a".into(),
        };
        let encoded = encode_hello(&msg).unwrap();
        let decoded = decode_hello(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_frame_is_a_codec_error_not_a_panic() {
        let err = decode(&[Kind::ClientTransform.tag().unwrap()]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn unknown_kind_tag_is_rejected() {
        let err = decode(&[0xEE]).unwrap_err();
        assert_eq!(err, CodecError::UnknownKind(0xEE));
    }

    #[test]
    fn global_var_sync_roundtrips() {
        let msg = GlobalVarSync {
            entries: vec![GlobalVarEntry {
                name: "state".into(),
                value: "B".into(),
                timestamp: 100.0,
                last_writer_client_no: 2,
            }],
        };
        let encoded = encode_global_var_sync(&msg).unwrap();
        let (decoded, _) = decode(&encoded).unwrap();
        match decoded {
            Message::GlobalVarSync(got) => assert_eq!(got, msg),
            _ => panic!("wrong kind decoded"),
        }
    }
}
