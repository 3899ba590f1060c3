//! Room relay.
//!
//! Every connection may join one room at a time. Published payloads are fanned
//! out to the other members unchanged. Durable payloads are also kept in a
//! per-room history, bounded both in entries and in bytes, that is handed to
//! new members in their `joined` reply; ephemeral ones (presence, snapshot
//! requests) are not.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use inkmesh_core::protocol::{RelayClientMessage, RelayServerMessage, encode_payload};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::config::DEFAULT_HISTORY_BYTES;

/// Sender id plus message.
type Envelope = (String, RelayServerMessage);

struct Room {
    tx: broadcast::Sender<Envelope>,
    peers: HashSet<String>,
    history: VecDeque<String>,
    history_bytes: usize,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            peers: HashSet::new(),
            history: VecDeque::new(),
            history_bytes: 0,
        }
    }

    fn remember(&mut self, data: &str, max_entries: usize, max_bytes: usize) {
        if max_entries == 0 || data.len() > max_bytes {
            return;
        }
        self.history.push_back(data.to_string());
        self.history_bytes += data.len();
        while self.history.len() > max_entries || self.history_bytes > max_bytes {
            let Some(old) = self.history.pop_front() else {
                break;
            };
            self.history_bytes -= old.len();
        }
    }
}

/// All relay rooms.
pub struct RelayState {
    rooms: DashMap<String, Room>,
    history_limit: usize,
    history_bytes: usize,
    channel_capacity: usize,
}

impl RelayState {
    pub fn new(history_limit: usize, channel_capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            history_limit,
            history_bytes: DEFAULT_HISTORY_BYTES,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Cap the encoded size of each room's history. A payload larger than
    /// the cap is relayed but not kept.
    pub fn with_history_bytes(mut self, bytes: usize) -> Self {
        self.history_bytes = bytes;
        self
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peer_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.peers.len()).unwrap_or(0)
    }

    pub fn history_len(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.history.len()).unwrap_or(0)
    }

    /// Bytes of payload held in a room's history.
    pub fn history_bytes(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.history_bytes).unwrap_or(0)
    }

    /// Add a peer; returns its subscription, the room history and the new
    /// member count. Subscribing and copying history happen under one lock so
    /// nothing published in between is lost or duplicated.
    fn join_room(&self, room_id: &str, peer_id: &str) -> (broadcast::Receiver<Envelope>, Vec<String>, usize) {
        let mut room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(self.channel_capacity));
        room.peers.insert(peer_id.to_string());
        let rx = room.tx.subscribe();
        let history = room.history.iter().cloned().collect();
        (rx, history, room.peers.len())
    }

    fn leave_room(&self, room_id: &str, peer_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.peers.remove(peer_id);
            if room.peers.is_empty() {
                drop(room);
                self.rooms.remove_if(room_id, |_, room| room.peers.is_empty());
                debug!("Room {} closed", room_id);
            }
        }
    }

    fn publish(&self, room_id: &str, from: &str, data: String, ephemeral: bool) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            if !ephemeral {
                room.remember(&data, self.history_limit, self.history_bytes);
            }
            let _ = room.tx.send((
                from.to_string(),
                RelayServerMessage::Message {
                    from: from.to_string(),
                    data,
                },
            ));
        }
    }

    fn broadcast(&self, room_id: &str, from: &str, msg: RelayServerMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            let _ = room.tx.send((from.to_string(), msg));
        }
    }
}

async fn send_message(sender: &mut SplitSink<WebSocket, Message>, msg: &RelayServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize relay message: {}", e);
            true
        }
    }
}

async fn next_envelope(rx: &mut Option<broadcast::Receiver<Envelope>>) -> Result<Envelope, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Serve one relay connection until it closes.
pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let relay = &state.relay;
    let peer_id = Uuid::new_v4().to_string();
    info!("New relay connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let mut current_room: Option<String> = None;
    let mut room_rx: Option<broadcast::Receiver<Envelope>> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let client_msg = match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayClientMessage>(text.as_str()) {
                        Ok(client_msg) => client_msg,
                        Err(e) => {
                            warn!("Invalid message from {}: {}", peer_id, e);
                            let err = RelayServerMessage::Error {
                                message: format!("Invalid message: {}", e),
                            };
                            if !send_message(&mut sender, &err).await {
                                break;
                            }
                            continue;
                        }
                    },
                    // Binary frames are durable payloads
                    Some(Ok(Message::Binary(data))) => RelayClientMessage::Publish {
                        data: encode_payload(&data),
                        ephemeral: false,
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", peer_id, e);
                        break;
                    }
                };

                match client_msg {
                    RelayClientMessage::Join { room } => {
                        if room.trim().is_empty() {
                            let err = RelayServerMessage::Error {
                                message: "Room name must not be empty".into(),
                            };
                            if !send_message(&mut sender, &err).await {
                                break;
                            }
                            continue;
                        }
                        if let Some(old_room) = current_room.take() {
                            relay.leave_room(&old_room, &peer_id);
                            relay.broadcast(&old_room, &peer_id, RelayServerMessage::PeerLeft {
                                peer_id: peer_id.clone(),
                            });
                        }

                        let (rx, history, peer_count) = relay.join_room(&room, &peer_id);
                        room_rx = Some(rx);
                        current_room = Some(room.clone());

                        let joined = RelayServerMessage::Joined {
                            room: room.clone(),
                            peer_count,
                            history,
                        };
                        if !send_message(&mut sender, &joined).await {
                            break;
                        }
                        relay.broadcast(&room, &peer_id, RelayServerMessage::PeerJoined {
                            peer_id: peer_id.clone(),
                        });
                        info!("Peer {} joined room {} ({} peers)", peer_id, room, peer_count);
                    }
                    RelayClientMessage::Leave => {
                        if let Some(room) = current_room.take() {
                            relay.leave_room(&room, &peer_id);
                            relay.broadcast(&room, &peer_id, RelayServerMessage::PeerLeft {
                                peer_id: peer_id.clone(),
                            });
                            info!("Peer {} left room {}", peer_id, room);
                        }
                        room_rx = None;
                    }
                    RelayClientMessage::Publish { data, ephemeral } => match current_room {
                        Some(ref room) => relay.publish(room, &peer_id, data, ephemeral),
                        None => {
                            let err = RelayServerMessage::Error {
                                message: "Join a room before publishing".into(),
                            };
                            if !send_message(&mut sender, &err).await {
                                break;
                            }
                        }
                    },
                }
            }

            envelope = next_envelope(&mut room_rx) => {
                match envelope {
                    Ok((from, server_msg)) => {
                        // Don't echo back to sender
                        if from != peer_id && !send_message(&mut sender, &server_msg).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Peer {} lagged behind, {} messages dropped", peer_id, skipped);
                    }
                    Err(RecvError::Closed) => room_rx = None,
                }
            }
        }
    }

    if let Some(ref room) = current_room {
        relay.leave_room(room, &peer_id);
        relay.broadcast(room, &peer_id, RelayServerMessage::PeerLeft {
            peer_id: peer_id.clone(),
        });
    }
    info!("Relay connection closed: {}", peer_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded_and_durable_only() {
        let state = RelayState::new(2, 16);
        let (_rx, history, count) = state.join_room("r", "a");
        assert!(history.is_empty());
        assert_eq!(count, 1);

        state.publish("r", "a", "one".into(), false);
        state.publish("r", "a", "cursor".into(), true);
        state.publish("r", "a", "two".into(), false);
        state.publish("r", "a", "three".into(), false);

        let (_rx, history, count) = state.join_room("r", "b");
        assert_eq!(history, vec!["two".to_string(), "three".to_string()]);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_history_is_bounded_in_bytes() {
        let state = RelayState::new(100, 16).with_history_bytes(10);
        let _a = state.join_room("r", "a");
        state.publish("r", "a", "aaaa".into(), false);
        state.publish("r", "a", "bbbb".into(), false);
        state.publish("r", "a", "cccc".into(), false);
        assert_eq!(state.history_len("r"), 2);
        assert_eq!(state.history_bytes("r"), 8);

        // Too large to keep at all; what was kept stays.
        state.publish("r", "a", "x".repeat(11), false);
        let (_rx, history, _) = state.join_room("r", "b");
        assert_eq!(history, vec!["bbbb".to_string(), "cccc".to_string()]);
    }

    #[test]
    fn test_empty_room_is_removed() {
        let state = RelayState::new(8, 16);
        let _a = state.join_room("r", "a");
        let _b = state.join_room("r", "b");
        state.leave_room("r", "a");
        assert_eq!(state.room_count(), 1);
        state.leave_room("r", "b");
        assert_eq!(state.room_count(), 0);
    }

    #[test]
    fn test_zero_history_keeps_nothing() {
        let state = RelayState::new(0, 16);
        let _a = state.join_room("r", "a");
        state.publish("r", "a", "one".into(), false);
        assert_eq!(state.history_len("r"), 0);
    }

    #[tokio::test]
    async fn test_publish_fans_out_with_sender() {
        let state = RelayState::new(8, 16);
        let (mut rx, _, _) = state.join_room("r", "b");
        state.publish("r", "a", "payload".into(), false);
        let (from, msg) = rx.recv().await.unwrap();
        assert_eq!(from, "a");
        assert_eq!(
            msg,
            RelayServerMessage::Message {
                from: "a".into(),
                data: "payload".into()
            }
        );
    }
}
