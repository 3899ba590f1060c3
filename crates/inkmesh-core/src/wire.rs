//! Session message envelope carried over every transport path.
//!
//! ```json
//! { "type": "ops", "from": "<peer>", "ops": [ … ] }
//! { "type": "snapshot_request", "from": "<peer>" }
//! { "type": "snapshot", "from": "<peer>", "ops": [ … ] }
//! { "type": "presence", "from": "<peer>", "state": { "label": "Alice" } }
//! { "type": "bye", "from": "<peer>" }
//! ```
//!
//! Operations stay as raw JSON values until [`decode_operations`] so that a
//! single corrupt operation does not reject the whole message.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ops::{Operation, PeerId};
use crate::presence::AwarenessState;

/// Wire errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A message exchanged between peers in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Freshly applied local operations
    Ops { from: PeerId, ops: Vec<Value> },
    /// Ask peers for their full operation set
    SnapshotRequest { from: PeerId },
    /// Full operation set, answering a request
    Snapshot { from: PeerId, ops: Vec<Value> },
    /// Liveness record
    Presence { from: PeerId, state: AwarenessState },
    /// Peer is leaving the room
    Bye { from: PeerId },
}

impl WireMessage {
    pub fn ops(from: &str, ops: &[Operation]) -> Self {
        WireMessage::Ops {
            from: from.to_string(),
            ops: ops.iter().map(Operation::to_value).collect(),
        }
    }

    pub fn snapshot(from: &str, ops: &[Operation]) -> Self {
        WireMessage::Snapshot {
            from: from.to_string(),
            ops: ops.iter().map(Operation::to_value).collect(),
        }
    }

    /// Sending peer.
    pub fn from(&self) -> &str {
        match self {
            WireMessage::Ops { from, .. }
            | WireMessage::SnapshotRequest { from }
            | WireMessage::Snapshot { from, .. }
            | WireMessage::Presence { from, .. }
            | WireMessage::Bye { from } => from,
        }
    }

    /// Whether relays may drop this message from history.
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            WireMessage::Presence { .. } | WireMessage::Bye { .. } | WireMessage::SnapshotRequest { .. }
        )
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Leniently decode operations, skipping the unusable ones.
pub fn decode_operations(values: &[Value]) -> Vec<Operation> {
    let ops: Vec<Operation> = values.iter().filter_map(Operation::from_value).collect();
    if ops.len() < values.len() {
        log::warn!("Discarded {} malformed operation(s)", values.len() - ops.len());
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurbo::Point;
    use serde_json::json;

    #[test]
    fn test_message_roundtrip() {
        let ops = vec![
            Operation::Clear { epoch: 2 },
            Operation::append("s1", 2, 4, Point::new(0.5, 0.25)),
        ];
        let msg = WireMessage::ops("peer-a", &ops);
        let bytes = msg.encode().unwrap();
        let decoded = WireMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.from(), "peer-a");
        let WireMessage::Ops { ops: values, .. } = decoded else {
            panic!("Expected ops");
        };
        assert_eq!(decode_operations(&values), ops);
    }

    #[test]
    fn test_corrupt_operation_skipped() {
        let values = vec![
            json!({ "op": "clear", "epoch": 1 }),
            json!({ "op": "append_point", "stroke_id": "s1" }),
            json!("garbage"),
        ];
        assert_eq!(decode_operations(&values), vec![Operation::Clear { epoch: 1 }]);
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(WireMessage::decode(b"\x00\x01").is_err());
        assert!(WireMessage::decode(br#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn test_ephemeral_kinds() {
        assert!(WireMessage::Bye { from: "a".into() }.is_ephemeral());
        assert!(!WireMessage::ops("a", &[]).is_ephemeral());
    }
}
