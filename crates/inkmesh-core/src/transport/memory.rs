//! In-process transport for tests and local demos.
//!
//! A [`MemoryHub`] stands in for both the direct mesh and the relay. Each
//! [`MemoryTransport`] joins a topic on the hub and, per enabled path,
//! receives every payload other members broadcast. The relay path keeps a
//! bounded history replayed to late joiners. Paths can be partitioned per
//! peer to simulate network failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use super::{ConnectionState, MessageCallback, MessageListeners, PathKind, Result, Transport, TransportError, TransportEvent};
use crate::ops::PeerId;
use crate::room::RoomId;

/// Relay history kept per topic.
pub const MEMORY_HISTORY_LIMIT: usize = 512;

struct Member {
    peer_id: PeerId,
    paths: Vec<PathKind>,
    tx: Sender<TransportEvent>,
}

#[derive(Default)]
struct HubInner {
    rooms: HashMap<String, Vec<Member>>,
    history: HashMap<String, VecDeque<Bytes>>,
    partitioned: HashSet<(PeerId, PathKind)>,
}

impl HubInner {
    fn reachable(&self, peer: &str, path: PathKind) -> bool {
        !self.partitioned.contains(&(peer.to_string(), path))
    }

    fn topic_of(&self, peer: &str) -> Option<String> {
        self.rooms
            .iter()
            .find(|(_, members)| members.iter().any(|m| m.peer_id == peer))
            .map(|(topic, _)| topic.clone())
    }

    fn member(&self, topic: &str, peer: &str) -> Option<&Member> {
        self.rooms.get(topic)?.iter().find(|m| m.peer_id == peer)
    }

    /// Whether `a` and `b` can currently talk over `path`.
    fn linked(&self, a: &Member, b: &Member, path: PathKind) -> bool {
        a.paths.contains(&path)
            && b.paths.contains(&path)
            && self.reachable(&a.peer_id, path)
            && self.reachable(&b.peer_id, path)
    }
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        // A poisoned hub only means a test thread panicked mid-send.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of members currently joined to `topic`.
    pub fn member_count(&self, topic: &str) -> usize {
        self.lock().rooms.get(topic).map_or(0, Vec::len)
    }

    /// Cut `peer` off from `path`.
    pub fn partition(&self, peer: &str, path: PathKind) {
        let mut hub = self.lock();
        if !hub.partitioned.insert((peer.to_string(), path)) {
            return;
        }
        log::debug!("Partitioned {} on {} path", peer, path);
        Self::announce_path_change(&hub, peer, path, false);
    }

    /// Reconnect `peer` to `path`.
    pub fn heal(&self, peer: &str, path: PathKind) {
        let mut hub = self.lock();
        if !hub.partitioned.remove(&(peer.to_string(), path)) {
            return;
        }
        log::debug!("Healed {} on {} path", peer, path);
        Self::announce_path_change(&hub, peer, path, true);
        if path == PathKind::Relay {
            Self::replay_history(&hub, peer);
        }
    }

    fn announce_path_change(hub: &HubInner, peer: &str, path: PathKind, up: bool) {
        let Some(topic) = hub.topic_of(peer) else {
            return;
        };
        let Some(me) = hub.member(&topic, peer) else {
            return;
        };
        if !me.paths.contains(&path) {
            return;
        }
        let state = if up {
            ConnectionState::Connected
        } else {
            ConnectionState::Reconnecting
        };
        let _ = me.tx.send(TransportEvent::PathState { path, state });

        if path != PathKind::Direct {
            return;
        }
        for other in hub.rooms[&topic].iter().filter(|m| m.peer_id != peer) {
            if !other.paths.contains(&path) || !hub.reachable(&other.peer_id, path) {
                continue;
            }
            let (mine, theirs) = if up {
                (
                    TransportEvent::LinkOpened { peer: other.peer_id.clone() },
                    TransportEvent::LinkOpened { peer: peer.to_string() },
                )
            } else {
                (
                    TransportEvent::LinkClosed { peer: other.peer_id.clone() },
                    TransportEvent::LinkClosed { peer: peer.to_string() },
                )
            };
            let _ = me.tx.send(mine);
            let _ = other.tx.send(theirs);
        }
    }

    fn replay_history(hub: &HubInner, peer: &str) {
        let Some(topic) = hub.topic_of(peer) else {
            return;
        };
        let (Some(me), Some(history)) = (hub.member(&topic, peer), hub.history.get(&topic)) else {
            return;
        };
        if !me.paths.contains(&PathKind::Relay) {
            return;
        }
        for bytes in history {
            let _ = me.tx.send(TransportEvent::Message {
                path: PathKind::Relay,
                bytes: bytes.clone(),
            });
        }
    }

    fn publish(&self, from: &str, topic: &str, bytes: Bytes, ephemeral: bool) {
        let mut hub = self.lock();
        let Some(sender) = hub.member(topic, from) else {
            return;
        };
        for path in [PathKind::Direct, PathKind::Relay] {
            for other in hub.rooms[topic].iter().filter(|m| m.peer_id != from) {
                if hub.linked(sender, other, path) {
                    let _ = other.tx.send(TransportEvent::Message {
                        path,
                        bytes: bytes.clone(),
                    });
                }
            }
        }
        let keep = !ephemeral && sender.paths.contains(&PathKind::Relay) && hub.reachable(from, PathKind::Relay);
        if keep {
            let history = hub.history.entry(topic.to_string()).or_default();
            history.push_back(bytes);
            while history.len() > MEMORY_HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    fn join(&self, topic: &str, member: Member) {
        let mut hub = self.lock();
        let peer = member.peer_id.clone();
        for path in &member.paths {
            let state = if hub.reachable(&peer, *path) {
                ConnectionState::Connected
            } else {
                ConnectionState::Reconnecting
            };
            let _ = member.tx.send(TransportEvent::PathState { path: *path, state });
        }
        let members = hub.rooms.entry(topic.to_string()).or_default();
        members.push(member);
        let me = &hub.rooms[topic][hub.rooms[topic].len() - 1];
        for other in hub.rooms[topic].iter().filter(|m| m.peer_id != peer) {
            if hub.linked(me, other, PathKind::Direct) {
                let _ = me.tx.send(TransportEvent::LinkOpened { peer: other.peer_id.clone() });
                let _ = other.tx.send(TransportEvent::LinkOpened { peer: peer.clone() });
            }
        }
        Self::replay_history(&hub, &peer);
    }

    fn leave(&self, topic: &str, peer: &str) {
        let mut hub = self.lock();
        let Some(members) = hub.rooms.get_mut(topic) else {
            return;
        };
        let Some(index) = members.iter().position(|m| m.peer_id == peer) else {
            return;
        };
        let me = members.remove(index);
        let empty = members.is_empty();
        if empty {
            hub.rooms.remove(topic);
            hub.history.remove(topic);
            return;
        }
        for other in &hub.rooms[topic] {
            if hub.linked(&me, other, PathKind::Direct) {
                let _ = other.tx.send(TransportEvent::LinkClosed { peer: peer.to_string() });
            }
        }
    }
}

/// One peer's endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    peer_id: PeerId,
    paths: Vec<PathKind>,
    topic: Option<String>,
    tx: Sender<TransportEvent>,
    rx: Receiver<TransportEvent>,
    states: HashMap<PathKind, ConnectionState>,
    listeners: MessageListeners,
}

impl MemoryTransport {
    /// Endpoint with both paths enabled.
    pub fn new(hub: &MemoryHub, peer_id: impl Into<PeerId>) -> Self {
        Self::with_paths(hub, peer_id, &[PathKind::Direct, PathKind::Relay])
    }

    /// Endpoint using only the given paths.
    pub fn with_paths(hub: &MemoryHub, peer_id: impl Into<PeerId>, paths: &[PathKind]) -> Self {
        let (tx, rx) = channel();
        Self {
            hub: hub.clone(),
            peer_id: peer_id.into(),
            paths: paths.to_vec(),
            topic: None,
            tx,
            rx,
            states: paths.iter().map(|p| (*p, ConnectionState::Disconnected)).collect(),
            listeners: MessageListeners::default(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(&self, bytes: Bytes, ephemeral: bool) {
        match &self.topic {
            Some(topic) => self.hub.publish(&self.peer_id, topic, bytes, ephemeral),
            None => log::debug!("Dropping broadcast before join"),
        }
    }
}

impl Transport for MemoryTransport {
    fn join(&mut self, room: &RoomId) -> Result<()> {
        if self.topic.is_some() {
            return Err(TransportError::AlreadyJoined);
        }
        let topic = room.topic();
        self.hub.join(
            &topic,
            Member {
                peer_id: self.peer_id.clone(),
                paths: self.paths.clone(),
                tx: self.tx.clone(),
            },
        );
        self.topic = Some(topic);
        Ok(())
    }

    fn broadcast(&self, bytes: Bytes) {
        self.send(bytes, false);
    }

    fn broadcast_ephemeral(&self, bytes: Bytes) {
        self.send(bytes, true);
    }

    fn on_message(&mut self, callback: MessageCallback) {
        self.listeners.push(callback);
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let events: Vec<TransportEvent> = self.rx.try_iter().collect();
        for event in &events {
            if let TransportEvent::PathState { path, state } = event {
                self.states.insert(*path, *state);
            }
        }
        self.listeners.dispatch(&events);
        events
    }

    fn path_states(&self) -> Vec<(PathKind, ConnectionState)> {
        self.paths
            .iter()
            .map(|p| (*p, self.states.get(p).copied().unwrap_or(ConnectionState::Disconnected)))
            .collect()
    }

    fn leave(&mut self) {
        let Some(topic) = self.topic.take() else {
            return;
        };
        self.hub.leave(&topic, &self.peer_id);
        // Drop anything still queued from the old room.
        self.rx.try_iter().for_each(drop);
        for state in self.states.values_mut() {
            *state = ConnectionState::Disconnected;
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(events: &[TransportEvent]) -> Vec<(PathKind, Bytes)> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Message { path, bytes } => Some((*path, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    fn joined(hub: &MemoryHub, peer: &str, room: &RoomId) -> MemoryTransport {
        let mut t = MemoryTransport::new(hub, peer);
        t.join(room).unwrap();
        t
    }

    #[test]
    fn test_broadcast_reaches_others_on_both_paths() {
        let hub = MemoryHub::new();
        let room = RoomId::new("r").unwrap();
        let a = joined(&hub, "a", &room);
        let mut b = joined(&hub, "b", &room);

        a.broadcast(Bytes::from_static(b"x"));
        let events = b.poll_events();
        assert_eq!(messages(&events).len(), 2);
        assert!(events.contains(&TransportEvent::LinkOpened { peer: "a".into() }));
    }

    #[test]
    fn test_sender_does_not_hear_itself() {
        let hub = MemoryHub::new();
        let room = RoomId::new("r").unwrap();
        let mut a = joined(&hub, "a", &room);
        a.broadcast(Bytes::from_static(b"x"));
        assert!(messages(&a.poll_events()).is_empty());
    }

    #[test]
    fn test_relay_history_for_late_joiner() {
        let hub = MemoryHub::new();
        let room = RoomId::new("r").unwrap();
        let a = joined(&hub, "a", &room);
        a.broadcast(Bytes::from_static(b"kept"));
        a.broadcast_ephemeral(Bytes::from_static(b"skipped"));

        let mut b = joined(&hub, "b", &room);
        let msgs = messages(&b.poll_events());
        assert_eq!(msgs, vec![(PathKind::Relay, Bytes::from_static(b"kept"))]);
    }

    #[test]
    fn test_partition_isolates_one_path() {
        let hub = MemoryHub::new();
        let room = RoomId::new("r").unwrap();
        let a = joined(&hub, "a", &room);
        let mut b = joined(&hub, "b", &room);
        b.poll_events();

        hub.partition("a", PathKind::Direct);
        a.broadcast(Bytes::from_static(b"x"));
        let events = b.poll_events();
        assert_eq!(messages(&events), vec![(PathKind::Relay, Bytes::from_static(b"x"))]);
        assert!(events.contains(&TransportEvent::LinkClosed { peer: "a".into() }));

        hub.heal("a", PathKind::Direct);
        a.broadcast(Bytes::from_static(b"y"));
        assert_eq!(messages(&b.poll_events()).len(), 2);
    }

    #[test]
    fn test_relay_only_member() {
        let hub = MemoryHub::new();
        let room = RoomId::new("r").unwrap();
        let a = joined(&hub, "a", &room);
        let mut c = MemoryTransport::with_paths(&hub, "c", &[PathKind::Relay]);
        c.join(&room).unwrap();

        a.broadcast(Bytes::from_static(b"x"));
        let events = c.poll_events();
        assert_eq!(messages(&events), vec![(PathKind::Relay, Bytes::from_static(b"x"))]);
        assert_eq!(c.path_states(), vec![(PathKind::Relay, ConnectionState::Connected)]);
    }

    #[test]
    fn test_leave_is_idempotent_and_empties_room() {
        let hub = MemoryHub::new();
        let room = RoomId::new("r").unwrap();
        let mut a = joined(&hub, "a", &room);
        assert_eq!(hub.member_count(&room.topic()), 1);
        a.leave();
        a.leave();
        assert_eq!(hub.member_count(&room.topic()), 0);
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_double_join_rejected() {
        let hub = MemoryHub::new();
        let room = RoomId::new("r").unwrap();
        let mut a = joined(&hub, "a", &room);
        assert!(matches!(a.join(&room), Err(TransportError::AlreadyJoined)));
    }
}
