//! Rendezvous service for direct links.
//!
//! A peer announces how to reach it under a topic and gets back the offers of
//! everyone already there. It then keeps the connection open; its offer is
//! withdrawn when the connection closes. Later arrivals dial earlier ones, so
//! nothing is pushed to existing members.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use inkmesh_core::protocol::{PeerOffer, SignalClientMessage, SignalServerMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;

/// Registered offers, by topic then connection id.
#[derive(Default)]
pub struct RendezvousState {
    topics: DashMap<String, HashMap<String, PeerOffer>>,
}

impl RendezvousState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn offer_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|t| t.len()).unwrap_or(0)
    }

    /// Register `offer` for connection `conn` and return the other offers,
    /// ordered by peer id. A peer re-announcing from a new connection
    /// replaces its old offer.
    pub fn announce(&self, conn: &str, topic: &str, offer: PeerOffer) -> Vec<PeerOffer> {
        let mut offers = self.topics.entry(topic.to_string()).or_default();
        offers.retain(|c, o| c == conn || o.peer_id != offer.peer_id);
        offers.insert(conn.to_string(), offer.clone());

        let mut others: Vec<PeerOffer> = offers
            .values()
            .filter(|o| o.peer_id != offer.peer_id)
            .cloned()
            .collect();
        others.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        others
    }

    /// Remove the offer registered by `conn`.
    pub fn withdraw(&self, conn: &str, topic: &str) {
        if let Some(mut offers) = self.topics.get_mut(topic) {
            offers.remove(conn);
            if offers.is_empty() {
                drop(offers);
                self.topics.remove_if(topic, |_, offers| offers.is_empty());
            }
        }
    }
}

async fn reply(socket: &mut futures_util::stream::SplitSink<WebSocket, Message>, msg: &SignalServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize rendezvous message: {}", e);
            true
        }
    }
}

/// Serve one rendezvous connection until it closes.
pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let rendezvous = &state.rendezvous;
    let conn = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let mut registered: Option<String> = None;

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Rendezvous socket error for {}: {}", conn, e);
                break;
            }
        };

        match serde_json::from_str::<SignalClientMessage>(text.as_str()) {
            Ok(SignalClientMessage::Announce { topic, offer }) => {
                if let Some(old) = registered.take().filter(|old| *old != topic) {
                    rendezvous.withdraw(&conn, &old);
                }
                info!("Peer {} announced on {} at {}", offer.peer_id, topic, offer.url);
                let offers = rendezvous.announce(&conn, &topic, offer);
                registered = Some(topic);
                if !reply(&mut sender, &SignalServerMessage::Candidates { offers }).await {
                    break;
                }
            }
            Err(e) => {
                warn!("Invalid rendezvous message from {}: {}", conn, e);
                let err = SignalServerMessage::Error {
                    message: format!("Invalid message: {}", e),
                };
                if !reply(&mut sender, &err).await {
                    break;
                }
            }
        }
    }

    if let Some(topic) = registered {
        rendezvous.withdraw(&conn, &topic);
        debug!("Withdrew offer of {} from {}", conn, topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(peer: &str) -> PeerOffer {
        PeerOffer {
            peer_id: peer.into(),
            url: format!("ws://127.0.0.1/{}", peer),
        }
    }

    #[test]
    fn test_announce_returns_others() {
        let state = RendezvousState::new();
        assert!(state.announce("c1", "t", offer("b")).is_empty());
        assert_eq!(state.announce("c2", "t", offer("a")), vec![offer("b")]);
        assert_eq!(state.announce("c3", "t", offer("c")), vec![offer("a"), offer("b")]);
        assert!(state.announce("c4", "other", offer("d")).is_empty());
    }

    #[test]
    fn test_reannounce_replaces_offer() {
        let state = RendezvousState::new();
        state.announce("c1", "t", offer("a"));
        state.announce("c2", "t", offer("a"));
        assert_eq!(state.offer_count("t"), 1);
        // The stale connection's withdrawal leaves the new offer alone
        state.withdraw("c1", "t");
        assert_eq!(state.offer_count("t"), 1);
    }

    #[test]
    fn test_withdraw_removes_empty_topic() {
        let state = RendezvousState::new();
        state.announce("c1", "t", offer("a"));
        state.withdraw("c1", "t");
        assert_eq!(state.topic_count(), 0);
    }
}
