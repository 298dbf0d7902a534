//! Error types callers are expected to branch on.
//!
//! Operational failures (socket setup, config loading, process wiring) use
//! `anyhow::Result` at the boundary; these two enums cover the narrower set
//! of outcomes the codec and the room registry need their callers to
//! distinguish.

use thiserror::Error;

/// Failures while decoding or encoding a wire message. Protocol-format
/// errors are dropped silently by the ingress dispatcher with a counter
/// increment, never surfaced to the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: needed at least {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown message kind tag {0:#x}")]
    UnknownKind(u8),

    #[error("string field is not valid utf-8")]
    InvalidUtf8,

    #[error("field {field} exceeds its wire length prefix: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("msgpack decode failed: {0}")]
    MsgPackDecode(String),

    #[error("msgpack encode failed: {0}")]
    MsgPackEncode(String),
}

/// Capacity failures from the identity & room registry. Logged at warn by
/// the caller; never disconnects the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room's client-number pool is exhausted")]
    RoomExhausted,

    #[error("room has reached its global variable limit")]
    GlobalVarLimitReached,

    #[error("room has reached its per-client variable limit")]
    ClientVarLimitReached,
}
