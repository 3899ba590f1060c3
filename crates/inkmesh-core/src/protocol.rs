//! Relay and rendezvous protocols.
//!
//! Both services speak JSON text frames. Relay payloads are opaque bytes,
//! base64 encoded:
//! ```json
//! { "type": "join", "room": "inkmesh/abc123" }
//! { "type": "publish", "data": "<base64>" }
//! { "type": "announce", "topic": "inkmesh/abc123", "offer": { "peer_id": "…", "url": "ws://10.0.0.2:4100" } }
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::ops::PeerId;

/// Messages sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientMessage {
    /// Join a room topic
    Join { room: String },
    /// Leave current room
    Leave,
    /// Publish a payload to the room
    Publish {
        data: String,
        /// Ephemeral payloads are fanned out but not kept in history.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        ephemeral: bool,
    },
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerMessage {
    /// Confirm room join with recent history
    Joined {
        room: String,
        peer_count: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        history: Vec<String>,
    },
    /// Peer joined the room
    PeerJoined { peer_id: String },
    /// Peer left the room
    PeerLeft { peer_id: String },
    /// Payload from another peer
    Message { from: String, data: String },
    /// Error message
    Error { message: String },
}

/// How to open a direct channel to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOffer {
    pub peer_id: PeerId,
    /// WebSocket URL the peer accepts direct links on.
    pub url: String,
}

/// Messages sent to the rendezvous service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalClientMessage {
    /// Register an offer under a topic and ask for the others
    Announce { topic: String, offer: PeerOffer },
}

/// Messages received from the rendezvous service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalServerMessage {
    /// Other peers currently registered under the topic
    Candidates { offers: Vec<PeerOffer> },
    /// Error message
    Error { message: String },
}

/// First frame exchanged on a direct link, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHello {
    pub peer_id: PeerId,
    pub topic: String,
    /// The sender's own offer URL, so either side can redial a dropped link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Dialer's serial for this link; breaks ties between duplicate links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<u64>,
}

/// Base64 encode a payload for a JSON frame.
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a base64 payload; `None` on malformed input.
pub fn decode_payload(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data).ok()
}
