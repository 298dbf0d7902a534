//! RPC router (component C6): broadcast and targeted remote procedure calls.
//!
//! Grounded on `server.py`'s RPC forwarding (`_handle_rpc`/`_handle_rpc_targeted`,
//! which stamp the sender's client number and republish the frame unchanged).
//! The router never inspects `argumentsJson`; it only stamps identity and
//! re-encodes.

use crate::codec;
use crate::error::CodecError;
use crate::protocol::{Message, Rpc, RpcTargeted, MAX_RPC_TARGETS};

/// Stamps the sender's client number onto a broadcast RPC and re-encodes it
/// for publication on the room topic, unchanged otherwise.
pub fn route_broadcast(sender_client_no: u16, function_name: &str, arguments_json: &str) -> Result<Vec<u8>, CodecError> {
    let rpc = Rpc {
        sender_client_no,
        function_name: function_name.to_string(),
        arguments_json: arguments_json.to_string(),
    };
    codec::encode(&Message::Rpc(rpc))
}

/// Stamps the sender and republishes a targeted RPC with its target list
/// intact. Target-list filtering happens on the receiving client, not here;
/// the router's only responsibility is to keep the list within
/// [`MAX_RPC_TARGETS`] (the encoder already clamps/rejects, this just
/// surfaces the cap for callers that want to reject before encoding).
pub fn route_targeted(
    sender_client_no: u16,
    target_client_nos: Vec<u16>,
    function_name: &str,
    arguments_json: &str,
) -> Result<Vec<u8>, CodecError> {
    if target_client_nos.len() > MAX_RPC_TARGETS {
        return Err(CodecError::FieldTooLong {
            field: "targetClientNos",
            len: target_client_nos.len(),
        });
    }
    let rpc = RpcTargeted {
        sender_client_no,
        target_client_nos,
        function_name: function_name.to_string(),
        arguments_json: arguments_json.to_string(),
    };
    codec::encode(&Message::RpcTargeted(rpc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;

    #[test]
    fn broadcast_rpc_carries_sender_client_no() {
        let bytes = route_broadcast(7, "Ping", "[]").unwrap();
        let (msg, _) = decode(&bytes).unwrap();
        match msg {
            Message::Rpc(rpc) => {
                assert_eq!(rpc.sender_client_no, 7);
                assert_eq!(rpc.function_name, "Ping");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn targeted_rpc_rejects_over_cap_target_list() {
        let targets: Vec<u16> = (0..=MAX_RPC_TARGETS as u16).collect();
        let err = route_targeted(1, targets, "Ping", "[]").unwrap_err();
        assert!(matches!(err, CodecError::FieldTooLong { field: "targetClientNos", .. }));
    }

    #[test]
    fn targeted_rpc_roundtrips_target_list() {
        let bytes = route_targeted(1, vec![3], "Ping", "[]").unwrap();
        let (msg, _) = decode(&bytes).unwrap();
        match msg {
            Message::RpcTargeted(rpc) => assert_eq!(rpc.target_client_nos, vec![3]),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
