//! Network-Variable engine: last-writer-wins replicated key-value state per
//! room, plus the delta-log/name-table machinery used by the MessagePack
//! delta protocol (Snapshot / Delta / DeltaAck / NameTable*).
//!
//! Grounded on two original sources that this engine unifies into one path:
//! `server.py`'s `_handle_global_var_set`/`_handle_client_var_set` (the LWW
//! comparison) and `nv_sync.py`'s `NameTable`/`RoomState` (name interning,
//! delta ring, snapshot/digest payloads). Every accepted set or delete here
//! does both: it updates the LWW-resolved value *and* appends exactly one
//! delta record, so a single mutation is visible through either the
//! GlobalVarSync/ClientVarSync wire messages or the newer delta protocol.

use crate::error::CodecError;
use crate::protocol::{GlobalVarEntry, GlobalVarSync, ClientVarBlock, ClientVarSync, MAX_VAR_NAME_BYTES, MAX_VAR_VALUE_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const SNAPSHOT_TAG: u8 = 0x20;
pub const DELTA_TAG: u8 = 0x21;
pub const DELTA_ACK_TAG: u8 = 0x22;
pub const NAME_TABLE_FULL_TAG: u8 = 0x30;
pub const NAME_TABLE_DELTA_TAG: u8 = 0x31;
pub const NAME_TABLE_DIGEST_TAG: u8 = 0x32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "g")]
    Global,
    #[serde(rename = "c")]
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "del")]
    Del,
}

/// Wire form of one NV mutation, as carried inside a [`DeltaPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaItemPayload {
    pub seq: u64,
    pub scope: Scope,
    pub op: Op,
    pub name_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_no: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// One NV mutation as retained in a room's delta log / pending list.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaRecord {
    pub seq: u64,
    pub scope: Scope,
    pub op: Op,
    pub name_id: u16,
    pub value: Option<String>,
    pub client_no: Option<u16>,
}

impl DeltaRecord {
    pub fn to_payload(&self) -> DeltaItemPayload {
        DeltaItemPayload {
            seq: self.seq,
            scope: self.scope,
            op: self.op,
            name_id: self.name_id,
            client_no: match self.scope {
                Scope::Client => Some(self.client_no.unwrap_or(0)),
                Scope::Global => None,
            },
            value: match self.op {
                Op::Set => self.value.clone(),
                Op::Del => None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    pub room_id: String,
    pub base_seq: u64,
    pub items: Vec<DeltaItemPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaAckPayload {
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameTableFullPayload {
    pub room_id: String,
    pub version: u32,
    pub entries: Vec<(u16, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameTableDeltaPayload {
    pub room_id: String,
    pub base_version: u32,
    pub added: Vec<(u16, String)>,
    pub new_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameTableDigestPayload {
    pub room_id: String,
    pub version: u32,
    pub count: u32,
    pub crc32: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameTableSnapshotSection {
    pub version: u32,
    pub entries: Vec<(u16, String)>,
    pub count: u32,
    pub crc32: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub room_id: String,
    pub nv_seq: u64,
    pub globals: BTreeMap<u16, String>,
    pub clients: BTreeMap<u16, BTreeMap<u16, String>>,
    pub name_table: NameTableSnapshotSection,
}

/// Prepends the kind tag and MessagePack-encodes `payload` as a named map
/// (field-name keys, matching the reference encoder's plain dict dump).
pub fn encode_msgpack_message<T: Serialize>(tag: u8, payload: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![tag];
    let body = rmp_serde::to_vec_named(payload).map_err(|e| CodecError::MsgPackEncode(e.to_string()))?;
    buf.extend(body);
    Ok(buf)
}

pub fn decode_msgpack_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(body).map_err(|e| CodecError::MsgPackDecode(e.to_string()))
}

/// Name interning table. NameIDs are assigned monotonically and never
/// reused, even across [`NameTable::trim_stale`], so delta records stay
/// interpretable against any client's still-cached state.
pub struct NameTable {
    name_to_id: HashMap<String, u16>,
    id_to_name: BTreeMap<u16, String>,
    next_name_id: u16,
    pending_added: Vec<(u16, String)>,
    delta_base_version: Option<u32>,
    last_used: HashMap<u16, Instant>,
    pub version: u32,
    pub count: u32,
    pub crc32: u32,
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NameTable {
    pub fn new() -> Self {
        Self {
            name_to_id: HashMap::new(),
            id_to_name: BTreeMap::new(),
            next_name_id: 1,
            pending_added: Vec::new(),
            delta_base_version: None,
            last_used: HashMap::new(),
            version: 0,
            count: 0,
            crc32: 0,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<u16> {
        self.name_to_id.get(name).copied()
    }

    /// Resolves `name` to its nameID, interning it on first use. Returns
    /// `(nameId, is_new)`.
    pub fn resolve(&mut self, name: &str) -> (u16, bool) {
        if let Some(existing) = self.lookup(name) {
            self.touch(existing);
            return (existing, false);
        }
        let name_id = self.next_name_id;
        self.next_name_id = self.next_name_id.wrapping_add(1);
        self.name_to_id.insert(name.to_string(), name_id);
        self.id_to_name.insert(name_id, name.to_string());
        self.count = self.id_to_name.len() as u32;

        if self.delta_base_version.is_none() {
            self.delta_base_version = Some(self.version);
        }
        self.version += 1;

        self.pending_added.push((name_id, name.to_string()));
        self.recompute_crc32();
        self.touch(name_id);
        (name_id, true)
    }

    pub fn touch(&mut self, name_id: u16) {
        self.last_used.insert(name_id, Instant::now());
    }

    pub fn entries(&self) -> Vec<(u16, String)> {
        self.id_to_name
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    pub fn build_full_payload(&self, room_id: &str) -> NameTableFullPayload {
        NameTableFullPayload {
            room_id: room_id.to_string(),
            version: self.version,
            entries: self.entries(),
        }
    }

    pub fn build_digest_payload(&self, room_id: &str) -> NameTableDigestPayload {
        NameTableDigestPayload {
            room_id: room_id.to_string(),
            version: self.version,
            count: self.count,
            crc32: self.crc32,
        }
    }

    pub fn collect_delta_payload(&mut self, room_id: &str) -> Option<NameTableDeltaPayload> {
        if self.pending_added.is_empty() {
            return None;
        }
        let base_version = self.delta_base_version.unwrap_or(self.version);
        let payload = NameTableDeltaPayload {
            room_id: room_id.to_string(),
            base_version,
            added: std::mem::take(&mut self.pending_added),
            new_version: self.version,
        };
        self.delta_base_version = None;
        Some(payload)
    }

    pub fn digest_tuple(&self) -> (u32, u32, u32) {
        (self.version, self.count, self.crc32)
    }

    /// Removes entries unused for longer than `stale_after`. Name IDs are
    /// never reassigned: `next_name_id` is untouched.
    pub fn trim_stale(&mut self, stale_after: Duration) -> Vec<u16> {
        if self.last_used.is_empty() {
            return Vec::new();
        }
        let cutoff = Instant::now().checked_sub(stale_after);
        let Some(cutoff) = cutoff else { return Vec::new() };
        let removed: Vec<u16> = self
            .last_used
            .iter()
            .filter(|(_, last_used)| **last_used < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for name_id in &removed {
            self.last_used.remove(name_id);
            if let Some(name) = self.id_to_name.remove(name_id) {
                self.name_to_id.remove(&name);
            }
        }
        if !removed.is_empty() {
            self.count = self.id_to_name.len() as u32;
            self.recompute_crc32();
        }
        removed
    }

    fn recompute_crc32(&mut self) {
        let mut payload = Vec::new();
        for (name_id, name) in self.entries() {
            payload.extend_from_slice(&name_id.to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
        }
        self.crc32 = crc32fast::hash(&payload);
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StoredVar {
    value: String,
    timestamp: f64,
    last_writer_client_no: u16,
}

/// Outcome of an NV set attempt, distinguishing the silent rejection paths
/// (a lost LWW conflict is not an error condition) from a hard capacity
/// failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    Accepted(DeltaRecord),
    RejectedNoOp,
    RejectedOlder,
    RejectedTie,
    RejectedLimit,
}

/// Per-room NV state: LWW-resolved values, name table, and the bounded
/// delta log. Roughly `RoomState` from the delta-protocol reference,
/// extended to also drive the legacy GlobalVarSync/ClientVarSync messages.
pub struct NvState {
    room_id: String,
    nv_seq: u64,
    delta_ring_size: usize,
    delta_log: VecDeque<DeltaRecord>,
    delta_floor: i64,
    pending_deltas: Vec<DeltaRecord>,
    globals_by_id: BTreeMap<u16, StoredVar>,
    clients_by_no: BTreeMap<u16, BTreeMap<u16, StoredVar>>,
    name_table: NameTable,
    max_global_vars: usize,
    max_client_vars: usize,
    max_var_name_bytes: usize,
    max_var_value_bytes: usize,
}

impl NvState {
    pub fn new(room_id: impl Into<String>, delta_ring_size: usize) -> Self {
        Self::with_limits(
            room_id,
            delta_ring_size,
            100,
            100,
            MAX_VAR_NAME_BYTES,
            MAX_VAR_VALUE_BYTES,
        )
    }

    pub fn with_limits(
        room_id: impl Into<String>,
        delta_ring_size: usize,
        max_global_vars: usize,
        max_client_vars: usize,
        max_var_name_bytes: usize,
        max_var_value_bytes: usize,
    ) -> Self {
        assert!(delta_ring_size > 0, "delta_ring_size must be positive");
        Self {
            room_id: room_id.into(),
            nv_seq: 0,
            delta_ring_size,
            delta_log: VecDeque::with_capacity(delta_ring_size),
            delta_floor: 1,
            pending_deltas: Vec::new(),
            globals_by_id: BTreeMap::new(),
            clients_by_no: BTreeMap::new(),
            name_table: NameTable::new(),
            max_global_vars,
            max_client_vars,
            max_var_name_bytes,
            max_var_value_bytes,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.nv_seq += 1;
        self.nv_seq
    }

    /// Appends to the full history ring (used for `delta_floor`/resync
    /// accounting) and coalesces into the pending flush buffer: a second set
    /// to the same `(scope, nameID[, clientNo])` within one flush window
    /// overwrites the pending record's value/op in place rather than adding
    /// a second item, so rapid same-key updates collapse to their last value
    /// by the time the buffer is flushed.
    fn append_delta(&mut self, record: DeltaRecord) {
        self.delta_log.push_back(record.clone());
        if self.delta_log.len() > self.delta_ring_size {
            self.delta_log.pop_front();
        }
        self.delta_floor = self.nv_seq as i64 - self.delta_log.len() as i64 + 1;

        let same_key = self.pending_deltas.iter_mut().find(|pending| {
            pending.scope == record.scope
                && pending.name_id == record.name_id
                && pending.client_no == record.client_no
        });
        match same_key {
            Some(pending) => {
                pending.op = record.op;
                pending.value = record.value;
            }
            None => self.pending_deltas.push(record),
        }
    }

    /// Truncates `name`/`value` to their wire caps, matching the reference
    /// implementation's silent-truncation policy: oversize input is clamped
    /// rather than rejected.
    fn clamp_name_value<'a>(&self, name: &'a str, value: &'a str) -> (String, String) {
        let name = truncate_utf8(name, self.max_var_name_bytes);
        let value = truncate_utf8(value, self.max_var_value_bytes);
        (name, value)
    }

    fn lww_check(existing: Option<&StoredVar>, timestamp: f64, sender_client_no: u16) -> Result<(), SetOutcome> {
        if let Some(existing) = existing {
            if timestamp < existing.timestamp {
                return Err(SetOutcome::RejectedOlder);
            }
            if timestamp == existing.timestamp && sender_client_no < existing.last_writer_client_no {
                return Err(SetOutcome::RejectedTie);
            }
        }
        Ok(())
    }

    pub fn set_global(
        &mut self,
        name: &str,
        value: &str,
        timestamp: f64,
        sender_client_no: u16,
    ) -> SetOutcome {
        let (name, value) = self.clamp_name_value(name, value);
        let pre_name_id = self.name_table.lookup(&name);
        let existing = pre_name_id.and_then(|id| self.globals_by_id.get(&id));

        if let Some(existing) = existing {
            if existing.value == value {
                return SetOutcome::RejectedNoOp;
            }
            if let Err(rejected) = Self::lww_check(Some(existing), timestamp, sender_client_no) {
                return rejected;
            }
        } else if self.globals_by_id.len() >= self.max_global_vars {
            return SetOutcome::RejectedLimit;
        }

        let (name_id, _is_new) = self.name_table.resolve(&name);
        self.globals_by_id.insert(
            name_id,
            StoredVar {
                value: value.clone(),
                timestamp,
                last_writer_client_no: sender_client_no,
            },
        );
        let seq = self.next_seq();
        let record = DeltaRecord {
            seq,
            scope: Scope::Global,
            op: Op::Set,
            name_id,
            value: Some(value),
            client_no: None,
        };
        self.append_delta(record.clone());
        SetOutcome::Accepted(record)
    }

    pub fn delete_global(&mut self, name: &str) -> Option<DeltaRecord> {
        let name_id = self.name_table.lookup(name)?;
        self.globals_by_id.remove(&name_id)?;
        self.name_table.touch(name_id);
        let seq = self.next_seq();
        let record = DeltaRecord {
            seq,
            scope: Scope::Global,
            op: Op::Del,
            name_id,
            value: None,
            client_no: None,
        };
        self.append_delta(record.clone());
        Some(record)
    }

    pub fn set_client(
        &mut self,
        client_no: u16,
        name: &str,
        value: &str,
        timestamp: f64,
        sender_client_no: u16,
    ) -> SetOutcome {
        let (name, value) = self.clamp_name_value(name, value);
        let pre_name_id = self.name_table.lookup(&name);
        let scope = self.clients_by_no.entry(client_no).or_default();
        let existing = pre_name_id.and_then(|id| scope.get(&id));

        if let Some(existing) = existing {
            if existing.value == value {
                return SetOutcome::RejectedNoOp;
            }
            if let Err(rejected) = Self::lww_check(Some(existing), timestamp, sender_client_no) {
                return rejected;
            }
        } else if scope.len() >= self.max_client_vars {
            return SetOutcome::RejectedLimit;
        }

        let (name_id, _is_new) = self.name_table.resolve(&name);
        let scope = self.clients_by_no.entry(client_no).or_default();
        scope.insert(
            name_id,
            StoredVar {
                value: value.clone(),
                timestamp,
                last_writer_client_no: sender_client_no,
            },
        );
        let seq = self.next_seq();
        let record = DeltaRecord {
            seq,
            scope: Scope::Client,
            op: Op::Set,
            name_id,
            value: Some(value),
            client_no: Some(client_no),
        };
        self.append_delta(record.clone());
        SetOutcome::Accepted(record)
    }

    pub fn delete_client(&mut self, client_no: u16, name: &str) -> Option<DeltaRecord> {
        let name_id = self.name_table.lookup(name)?;
        let scope = self.clients_by_no.get_mut(&client_no)?;
        scope.remove(&name_id)?;
        self.name_table.touch(name_id);
        let seq = self.next_seq();
        let record = DeltaRecord {
            seq,
            scope: Scope::Client,
            op: Op::Del,
            name_id,
            value: None,
            client_no: Some(client_no),
        };
        self.append_delta(record.clone());
        Some(record)
    }

    pub fn build_snapshot_payload(&self) -> SnapshotPayload {
        let (version, count, crc32) = self.name_table.digest_tuple();
        let globals = self
            .globals_by_id
            .iter()
            .map(|(id, v)| (*id, v.value.clone()))
            .collect();
        let clients = self
            .clients_by_no
            .iter()
            .map(|(client_no, scope)| {
                let vars = scope.iter().map(|(id, v)| (*id, v.value.clone())).collect();
                (*client_no, vars)
            })
            .collect();
        SnapshotPayload {
            room_id: self.room_id.clone(),
            nv_seq: self.nv_seq,
            globals,
            clients,
            name_table: NameTableSnapshotSection {
                version,
                entries: self.name_table.entries(),
                count,
                crc32,
            },
        }
    }

    pub fn collect_delta_payload(&mut self) -> Option<DeltaPayload> {
        if self.pending_deltas.is_empty() {
            return None;
        }
        let base_seq = self.pending_deltas[0].seq - 1;
        let items = self.pending_deltas.drain(..).map(|r| r.to_payload()).collect();
        Some(DeltaPayload {
            room_id: self.room_id.clone(),
            base_seq,
            items,
        })
    }

    pub fn collect_name_table_delta(&mut self) -> Option<NameTableDeltaPayload> {
        self.name_table.collect_delta_payload(&self.room_id)
    }

    pub fn build_name_table_full(&self) -> NameTableFullPayload {
        self.name_table.build_full_payload(&self.room_id)
    }

    pub fn build_name_table_digest(&self) -> NameTableDigestPayload {
        self.name_table.build_digest_payload(&self.room_id)
    }

    pub fn oldest_seq_available(&self) -> i64 {
        self.delta_floor
    }

    pub fn requires_resync(&self, last_seq: i64) -> bool {
        last_seq < self.delta_floor - 1
    }

    pub fn has_pending_deltas(&self) -> bool {
        !self.pending_deltas.is_empty()
    }

    /// Resolves current globals back into the legacy GlobalVarSync wire
    /// shape (name, not nameId, plus timestamp/last-writer for the LWW
    /// comparison clients perform locally).
    pub fn global_var_sync(&self) -> GlobalVarSync {
        let entries = self
            .globals_by_id
            .iter()
            .filter_map(|(name_id, stored)| {
                let name = self.name_table.id_to_name.get(name_id)?.clone();
                Some(GlobalVarEntry {
                    name,
                    value: stored.value.clone(),
                    timestamp: stored.timestamp,
                    last_writer_client_no: stored.last_writer_client_no,
                })
            })
            .collect();
        GlobalVarSync { entries }
    }

    pub fn client_var_sync(&self) -> ClientVarSync {
        let clients = self
            .clients_by_no
            .iter()
            .map(|(client_no, scope)| {
                let vars = scope
                    .iter()
                    .filter_map(|(name_id, stored)| {
                        let name = self.name_table.id_to_name.get(name_id)?.clone();
                        Some(GlobalVarEntry {
                            name,
                            value: stored.value.clone(),
                            timestamp: stored.timestamp,
                            last_writer_client_no: stored.last_writer_client_no,
                        })
                    })
                    .collect();
                ClientVarBlock {
                    client_no: *client_no,
                    vars,
                }
            })
            .collect();
        ClientVarSync { clients }
    }

    pub fn trim_stale_names(&mut self, stale_after: Duration) -> Vec<u16> {
        self.name_table.trim_stale(stale_after)
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Tracks per-device NV request rates over a trailing 1-second window.
/// Monitoring only: crossing `nv_monitor_threshold` logs a warning and
/// never drops the request.
pub struct DeviceRateMonitor {
    windows: HashMap<String, VecDeque<Instant>>,
}

impl Default for DeviceRateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRateMonitor {
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
        }
    }

    /// Records one request for `device_id` and returns the trailing-1s
    /// count including this request.
    pub fn record(&mut self, device_id: &str) -> usize {
        let now = Instant::now();
        let window = self.windows.entry(device_id.to_string()).or_default();
        window.push_back(now);
        while let Some(front) = window.front() {
            if now.duration_since(*front) > Duration::from_secs(1) {
                window.pop_front();
            } else {
                break;
            }
        }
        window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lww_tie_break_favors_higher_client_number() {
        let mut nv = NvState::new("r1", 10_000);
        let a = nv.set_global("state", "A", 100.0, 1);
        assert!(matches!(a, SetOutcome::Accepted(_)));
        let b = nv.set_global("state", "B", 100.0, 2);
        assert!(matches!(b, SetOutcome::Accepted(_)));

        let payload = nv.collect_delta_payload().unwrap();
        assert_eq!(payload.items.len(), 1, "same-key sets within a flush window coalesce to one record");
        let item = &payload.items[0];
        assert_eq!(item.seq, 1, "the coalesced record keeps the first write's seq");
        assert_eq!(item.value.as_deref(), Some("B"));
        assert_eq!(nv.global_var_sync().entries[0].value, "B");
    }

    #[test]
    fn rapid_sets_to_the_same_key_collapse_to_one_delta_record() {
        let mut nv = NvState::new("r1", 10_000);
        for i in 0..100 {
            let outcome = nv.set_global("slider_value", &i.to_string(), i as f64, 1);
            assert!(matches!(outcome, SetOutcome::Accepted(_)));
        }
        let payload = nv.collect_delta_payload().unwrap();
        assert_eq!(payload.items.len(), 1);
        assert_eq!(payload.items[0].seq, 1);
        assert_eq!(payload.items[0].value.as_deref(), Some("99"));
    }

    #[test]
    fn older_timestamp_is_silently_rejected() {
        let mut nv = NvState::new("r1", 10_000);
        assert!(matches!(nv.set_global("state", "A", 100.0, 1), SetOutcome::Accepted(_)));
        assert_eq!(nv.set_global("state", "C", 50.0, 9), SetOutcome::RejectedOlder);
        assert_eq!(nv.global_var_sync().entries[0].value, "A");
    }

    #[test]
    fn lower_client_number_loses_a_tie() {
        let mut nv = NvState::new("r1", 10_000);
        assert!(matches!(nv.set_global("state", "A", 100.0, 5), SetOutcome::Accepted(_)));
        assert_eq!(nv.set_global("state", "Z", 100.0, 1), SetOutcome::RejectedTie);
    }

    #[test]
    fn identical_value_is_a_no_op() {
        let mut nv = NvState::new("r1", 10_000);
        assert!(matches!(nv.set_global("state", "A", 100.0, 1), SetOutcome::Accepted(_)));
        assert_eq!(nv.set_global("state", "A", 200.0, 1), SetOutcome::RejectedNoOp);
        assert_eq!(nv.nv_seq, 1);
    }

    #[test]
    fn every_mutation_strictly_increases_nv_seq_and_appends_one_record() {
        let mut nv = NvState::new("r1", 10_000);
        for i in 0..5 {
            let outcome = nv.set_global(&format!("k{i}"), "v", i as f64, 1);
            assert!(matches!(outcome, SetOutcome::Accepted(_)));
        }
        assert_eq!(nv.nv_seq, 5);
        assert_eq!(nv.delta_log.len(), 5);
    }

    #[test]
    fn delta_ring_floor_tracks_capacity() {
        let mut nv = NvState::new("r1", 4);
        for i in 0..10 {
            nv.set_global("k", &format!("v{i}"), i as f64, (i % 2) as u16 + 1);
        }
        assert_eq!(nv.oldest_seq_available(), 7);
        assert!(nv.requires_resync(3));
        assert!(!nv.requires_resync(6));
    }

    #[test]
    fn new_global_var_past_limit_is_rejected() {
        let mut nv = NvState::with_limits("r1", 10_000, 1, 100, 64, 1024);
        assert!(matches!(nv.set_global("a", "1", 1.0, 1), SetOutcome::Accepted(_)));
        assert_eq!(nv.set_global("b", "1", 2.0, 1), SetOutcome::RejectedLimit);
        // updates to the existing key still succeed past the limit
        assert!(matches!(nv.set_global("a", "2", 3.0, 1), SetOutcome::Accepted(_)));
    }

    #[test]
    fn name_table_crc32_changes_when_a_new_name_is_interned() {
        let mut table = NameTable::new();
        let before = table.crc32;
        table.resolve("alpha");
        assert_ne!(before, table.crc32);
    }

    #[test]
    fn trim_stale_removes_unused_names_without_reassigning_their_id() {
        let mut table = NameTable::new();
        let (stale_id, _) = table.resolve("stale");
        std::thread::sleep(Duration::from_millis(15));
        let (fresh_id, _) = table.resolve("fresh");

        let removed = table.trim_stale(Duration::from_millis(5));
        assert_eq!(removed, vec![stale_id]);
        assert!(table.lookup("stale").is_none());
        assert_eq!(table.lookup("fresh"), Some(fresh_id));

        let (reused_id, is_new) = table.resolve("stale-again");
        assert!(is_new);
        assert_ne!(reused_id, stale_id, "name ids are never reused, even after trim");
    }

    #[test]
    fn msgpack_roundtrip_for_delta_payload() {
        let payload = DeltaPayload {
            room_id: "r1".into(),
            base_seq: 0,
            items: vec![DeltaItemPayload {
                seq: 1,
                scope: Scope::Global,
                op: Op::Set,
                name_id: 1,
                client_no: None,
                value: Some("B".into()),
            }],
        };
        let encoded = encode_msgpack_message(DELTA_TAG, &payload).unwrap();
        assert_eq!(encoded[0], DELTA_TAG);
        let decoded: DeltaPayload = decode_msgpack_body(&encoded[1..]).unwrap();
        assert_eq!(decoded, payload);
    }
}
