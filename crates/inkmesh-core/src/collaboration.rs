//! Room sessions: the bridge between local input, the replica, presence and
//! the transport.
//!
//! A [`RoomSession`] is driven from one thread. The host feeds it pointer
//! events and calls [`RoomSession::poll`] regularly (typically once per
//! frame); the session drains transport events, applies remote operations,
//! answers snapshot requests, sends presence heartbeats and reports what
//! changed.

use kurbo::Size;
use url::Url;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::input::{CaptureRequest, PointerEvent, StrokeBuilder};
use crate::ops::{Operation, PeerId};
use crate::presence::{AwarenessState, Instant, PeerPresence, Presence};
use crate::replica::Replica;
use crate::room::RoomId;
use crate::stroke::Brush;
use crate::transport::{ConnectionState, PathKind, Transport, TransportError, TransportEvent};
use crate::wire::{WireMessage, decode_operations};

/// Generate a fresh peer id.
pub fn new_peer_id() -> PeerId {
    Uuid::new_v4().simple().to_string()
}

/// Overall reachability of the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Every configured path is connected
    Online,
    /// Some paths are down but at least one works
    Degraded,
    /// No path is connected
    Offline,
}

impl Connectivity {
    fn from_paths(states: &[(PathKind, ConnectionState)]) -> Self {
        let connected = states.iter().filter(|(_, s)| s.is_connected()).count();
        if connected == 0 {
            Connectivity::Offline
        } else if connected == states.len() {
            Connectivity::Online
        } else {
            Connectivity::Degraded
        }
    }
}

/// What changed during a [`RoomSession::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The document changed and needs a redraw
    DocumentChanged,
    /// The set of present peers changed
    PeersChanged { count: usize },
    /// Reachability changed
    Connectivity(Connectivity),
}

/// A joined room.
pub struct RoomSession<T: Transport> {
    room: RoomId,
    peer_id: PeerId,
    replica: Replica,
    presence: Presence,
    builder: StrokeBuilder,
    transport: T,
    connectivity: Connectivity,
    local_changes: bool,
    left: bool,
}

impl RoomSession<crate::transport::DualTransport> {
    /// Join `room` over the paths enabled in `config`.
    pub fn connect(room: RoomId, config: &SessionConfig, now: Instant) -> Result<Self, TransportError> {
        let peer_id = new_peer_id();
        let transport = crate::transport::DualTransport::from_config(&peer_id, config)?;
        Self::join(room, peer_id, config, transport, now)
    }
}

impl<T: Transport> RoomSession<T> {
    /// Join `room` as `peer_id` using `transport`.
    pub fn join(
        room: RoomId,
        peer_id: impl Into<PeerId>,
        config: &SessionConfig,
        mut transport: T,
        now: Instant,
    ) -> Result<Self, TransportError> {
        let peer_id = peer_id.into();
        transport.join(&room)?;
        log::info!("Peer {} joined room {}", peer_id, room);

        let mut presence = Presence::with_timing(
            peer_id.clone(),
            config.heartbeat_interval(),
            config.presence_timeout(),
        );
        let label = config
            .label
            .clone()
            .unwrap_or_else(|| format!("Peer {}", peer_id.chars().take(6).collect::<String>()));
        presence.set_local_state(AwarenessState::with_label(label));

        let mut session = Self {
            room,
            replica: Replica::new(peer_id.clone()).with_max_pending_points(config.max_pending_points),
            presence,
            builder: StrokeBuilder::new(config.min_point_distance_px),
            transport,
            connectivity: Connectivity::Offline,
            local_changes: false,
            left: false,
            peer_id,
        };
        session.send(&WireMessage::SnapshotRequest {
            from: session.peer_id.clone(),
        });
        session.announce(now);
        Ok(session)
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Remote peers currently present.
    pub fn peers(&self) -> Vec<PeerPresence> {
        self.presence.peers()
    }

    /// Participants including this peer.
    pub fn peer_count(&self) -> usize {
        self.presence.peer_count()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_left(&self) -> bool {
        self.left
    }

    /// Link other peers can use to join this room.
    pub fn share_url(&self, base: &Url) -> Url {
        self.room.share_url(base)
    }

    // --- Local input ---

    pub fn set_brush(&mut self, brush: Brush) {
        self.builder.set_brush(brush);
    }

    pub fn brush(&self) -> &Brush {
        self.builder.brush()
    }

    /// Feed a pointer event; returns the capture change for the host.
    pub fn handle_pointer(&mut self, event: &PointerEvent, viewport: Size) -> Option<CaptureRequest> {
        if self.left {
            return None;
        }
        let output = self.builder.handle(event, viewport);
        if let Some(op) = output.operation {
            self.commit(op);
        }
        output.capture
    }

    /// Clear the canvas for everyone; ends any stroke in progress.
    pub fn clear(&mut self) -> Option<CaptureRequest> {
        if self.left {
            return None;
        }
        let release = self.builder.reset();
        self.commit(Operation::Clear { epoch: 0 });
        release
    }

    fn commit(&mut self, op: Operation) {
        let Some(stamped) = self.replica.apply_local(op) else {
            return;
        };
        self.local_changes = true;
        self.send(&WireMessage::ops(&self.peer_id, &[stamped]));
    }

    // --- Presence ---

    /// Set the awareness fields announced for this peer.
    pub fn set_local_state(&mut self, state: AwarenessState) {
        self.presence.set_local_state(state);
    }

    pub fn on_peers_changed(&mut self, callback: impl FnMut(&[PeerPresence]) + Send + 'static) {
        self.presence.on_peers_changed(callback);
    }

    fn announce(&mut self, now: Instant) {
        if let Some(state) = self.presence.announcement(now) {
            self.send(&WireMessage::Presence {
                from: self.peer_id.clone(),
                state,
            });
        }
    }

    // --- Event loop ---

    /// Process everything that happened since the last poll.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        if self.left {
            return Vec::new();
        }

        let mut doc_changed = std::mem::take(&mut self.local_changes);
        let mut peers_changed = false;
        let mut push_snapshot = false;
        let mut requesters: Vec<PeerId> = Vec::new();
        let mut request_snapshot = false;

        for event in self.transport.poll_events() {
            match event {
                TransportEvent::Message { path, bytes } => {
                    let msg = match WireMessage::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Discarding message from {} path: {}", path, e);
                            continue;
                        }
                    };
                    if msg.from() == self.peer_id {
                        continue;
                    }
                    match msg {
                        WireMessage::Ops { ops, .. } | WireMessage::Snapshot { ops, .. } => {
                            for op in decode_operations(&ops) {
                                doc_changed |= self.replica.apply_remote(&op);
                            }
                        }
                        WireMessage::SnapshotRequest { from } => {
                            log::debug!("Snapshot requested by {}", from);
                            requesters.push(from);
                        }
                        WireMessage::Presence { from, state } => {
                            peers_changed |= self.presence.observe(&from, state, now);
                        }
                        WireMessage::Bye { from } => {
                            peers_changed |= self.presence.remove(&from);
                        }
                    }
                }
                TransportEvent::PathState { path, state } => {
                    log::info!("{} path is {:?}", path, state);
                    if state.is_connected() {
                        request_snapshot = true;
                    }
                }
                TransportEvent::LinkOpened { peer } => {
                    log::debug!("Pushing snapshot to new link {}", peer);
                    push_snapshot = true;
                }
                TransportEvent::LinkClosed { peer } => log::debug!("Link to {} closed", peer),
                TransportEvent::Error { path, message } => {
                    log::warn!("{} path error: {}", path, message);
                }
            }
        }

        peers_changed |= !self.presence.expire(now).is_empty();
        self.announce(now);

        let answer = !requesters.is_empty() && self.answers_snapshot_requests(&requesters);
        if !requesters.is_empty() && !answer {
            log::debug!("Leaving snapshot request to a lower peer id");
        }
        if push_snapshot || answer {
            let ops = self.replica.snapshot();
            self.send(&WireMessage::snapshot(&self.peer_id, &ops));
        }
        if request_snapshot {
            self.send(&WireMessage::SnapshotRequest {
                from: self.peer_id.clone(),
            });
        }

        let mut events = Vec::new();
        if doc_changed {
            events.push(SessionEvent::DocumentChanged);
        }
        if peers_changed {
            events.push(SessionEvent::PeersChanged {
                count: self.presence.peer_count(),
            });
        }
        let connectivity = Connectivity::from_paths(&self.transport.path_states());
        if connectivity != self.connectivity {
            log::info!("Room {} is {:?}", self.room, connectivity);
            self.connectivity = connectivity;
            events.push(SessionEvent::Connectivity(connectivity));
        }
        events
    }

    /// One peer answers each round of snapshot requests: the lowest id among
    /// this peer and the present peers, not counting the requesters.
    fn answers_snapshot_requests(&self, requesters: &[PeerId]) -> bool {
        self.presence
            .peer_ids()
            .filter(|id| !requesters.iter().any(|r| r == id))
            .all(|id| id > self.peer_id.as_str())
    }

    fn send(&self, msg: &WireMessage) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode message: {}", e);
                return;
            }
        };
        if msg.is_ephemeral() {
            self.transport.broadcast_ephemeral(bytes);
        } else {
            self.transport.broadcast(bytes);
        }
    }

    /// Leave the room: say goodbye, tear down the transport and drop all
    /// room state. Safe to call more than once.
    pub fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.send(&WireMessage::Bye {
            from: self.peer_id.clone(),
        });
        self.transport.leave();
        self.presence.clear_local();
        self.presence.clear_peers();
        self.builder.reset();
        self.replica.reset();
        self.connectivity = Connectivity::Offline;
        log::info!("Peer {} left room {}", self.peer_id, self.room);
    }
}

impl<T: Transport> Drop for RoomSession<T> {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::MouseButton;
    use crate::transport::{MemoryHub, MemoryTransport};
    use kurbo::Point;
    use std::time::Duration;

    const VIEWPORT: Size = Size::new(200.0, 100.0);

    fn session(hub: &MemoryHub, peer: &str, room: &RoomId, now: Instant) -> RoomSession<MemoryTransport> {
        session_with(MemoryTransport::new(hub, peer), peer, room, now)
    }

    fn session_with(
        transport: MemoryTransport,
        peer: &str,
        room: &RoomId,
        now: Instant,
    ) -> RoomSession<MemoryTransport> {
        RoomSession::join(room.clone(), peer, &SessionConfig::offline(), transport, now).unwrap()
    }

    fn draw(session: &mut RoomSession<MemoryTransport>, points: &[(f64, f64)]) {
        let (first, rest) = points.split_first().unwrap();
        session.handle_pointer(
            &PointerEvent::Down {
                pointer_id: 1,
                position: Point::new(first.0, first.1),
                button: MouseButton::Left,
            },
            VIEWPORT,
        );
        for p in rest {
            session.handle_pointer(
                &PointerEvent::Move {
                    pointer_id: 1,
                    position: Point::new(p.0, p.1),
                },
                VIEWPORT,
            );
        }
        let last = points[points.len() - 1];
        session.handle_pointer(
            &PointerEvent::Up {
                pointer_id: 1,
                position: Point::new(last.0, last.1),
            },
            VIEWPORT,
        );
    }

    fn settle(sessions: &mut [&mut RoomSession<MemoryTransport>], now: Instant) {
        for _ in 0..4 {
            for s in sessions.iter_mut() {
                s.poll(now);
            }
        }
    }

    fn snapshot_of(session: &RoomSession<MemoryTransport>) -> Vec<(String, Vec<Point>)> {
        session
            .replica()
            .strokes()
            .map(|s| (s.id.clone(), s.points.clone()))
            .collect()
    }

    #[test]
    fn test_two_peers_converge() {
        let hub = MemoryHub::new();
        let room = RoomId::new("pair").unwrap();
        let now = Instant::now();
        let mut a = session(&hub, "a", &room, now);
        let mut b = session(&hub, "b", &room, now);

        draw(&mut a, &[(10.0, 10.0), (50.0, 50.0), (90.0, 20.0)]);
        draw(&mut b, &[(100.0, 10.0), (150.0, 80.0)]);
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(a.replica().stroke_count(), 2);
        assert_eq!(snapshot_of(&a), snapshot_of(&b));
        let first = a.replica().strokes().next().unwrap();
        assert_eq!(first.points[0], Point::new(0.05, 0.1));
    }

    #[test]
    fn test_poll_reports_changes() {
        let hub = MemoryHub::new();
        let room = RoomId::new("events").unwrap();
        let now = Instant::now();
        let mut a = session(&hub, "a", &room, now);

        let events = a.poll(now);
        assert!(events.contains(&SessionEvent::Connectivity(Connectivity::Online)));

        let mut b = session(&hub, "b", &room, now);
        draw(&mut b, &[(10.0, 10.0)]);
        b.poll(now);
        let events = a.poll(now);
        assert!(events.contains(&SessionEvent::DocumentChanged));
        assert!(events.contains(&SessionEvent::PeersChanged { count: 2 }));
    }

    #[test]
    fn test_late_joiner_catches_up_without_history() {
        let hub = MemoryHub::new();
        let room = RoomId::new("late").unwrap();
        let now = Instant::now();
        let direct = [PathKind::Direct];
        let mut a = session_with(MemoryTransport::with_paths(&hub, "a", &direct), "a", &room, now);
        draw(&mut a, &[(10.0, 10.0), (40.0, 40.0)]);
        a.clear();
        draw(&mut a, &[(60.0, 60.0), (80.0, 20.0), (120.0, 30.0)]);
        a.poll(now);

        let mut c = session_with(MemoryTransport::with_paths(&hub, "c", &direct), "c", &room, now);
        settle(&mut [&mut a, &mut c], now);

        assert_eq!(c.replica().epoch(), 1);
        assert_eq!(snapshot_of(&c), snapshot_of(&a));
        assert_eq!(c.replica().stroke_count(), 1);
    }

    #[test]
    fn test_one_peer_answers_snapshot_request() {
        let hub = MemoryHub::new();
        let room = RoomId::new("answer").unwrap();
        let now = Instant::now();
        let relay = [PathKind::Relay];
        let mut a = session_with(MemoryTransport::with_paths(&hub, "a", &relay), "a", &room, now);
        let mut b = session_with(MemoryTransport::with_paths(&hub, "b", &relay), "b", &room, now);
        draw(&mut b, &[(10.0, 10.0), (60.0, 40.0)]);
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(a.peer_count(), 2);

        let mut observer = MemoryTransport::with_paths(&hub, "observer", &relay);
        observer.join(&room).unwrap();
        observer.poll_events();

        let mut c = session_with(MemoryTransport::with_paths(&hub, "c", &relay), "c", &room, now);
        a.poll(now);
        b.poll(now);
        let answered: Vec<PeerId> = observer
            .poll_events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Message { bytes, .. } => WireMessage::decode(&bytes).ok(),
                _ => None,
            })
            .filter_map(|msg| match msg {
                WireMessage::Snapshot { from, .. } => Some(from),
                _ => None,
            })
            .collect();
        assert_eq!(answered, vec!["a".to_string()]);

        c.poll(now);
        assert_eq!(snapshot_of(&c), snapshot_of(&b));
    }

    #[test]
    fn test_clear_propagates() {
        let hub = MemoryHub::new();
        let room = RoomId::new("clear").unwrap();
        let now = Instant::now();
        let mut a = session(&hub, "a", &room, now);
        let mut b = session(&hub, "b", &room, now);

        draw(&mut a, &[(10.0, 10.0), (50.0, 50.0)]);
        draw(&mut b, &[(20.0, 30.0)]);
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(b.replica().stroke_count(), 2);

        b.clear();
        settle(&mut [&mut a, &mut b], now);
        assert!(a.replica().is_empty());
        assert!(b.replica().is_empty());
        assert_eq!(a.replica().epoch(), 1);
    }

    #[test]
    fn test_stroke_survives_direct_partition() {
        let hub = MemoryHub::new();
        let room = RoomId::new("split").unwrap();
        let now = Instant::now();
        let mut a = session(&hub, "a", &room, now);
        let mut b = session(&hub, "b", &room, now);
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(a.connectivity(), Connectivity::Online);

        hub.partition("a", PathKind::Direct);
        a.poll(now);
        assert_eq!(a.connectivity(), Connectivity::Degraded);

        draw(&mut a, &[(10.0, 10.0), (30.0, 60.0), (70.0, 90.0)]);
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(snapshot_of(&a), snapshot_of(&b));

        hub.heal("a", PathKind::Direct);
        let events = a.poll(now);
        assert!(events.contains(&SessionEvent::Connectivity(Connectivity::Online)));
    }

    #[test]
    fn test_relay_only_peer_converges() {
        let hub = MemoryHub::new();
        let room = RoomId::new("mixed").unwrap();
        let now = Instant::now();
        let mut a = session(&hub, "a", &room, now);
        let mut b = session(&hub, "b", &room, now);
        let mut c = session_with(MemoryTransport::with_paths(&hub, "c", &[PathKind::Relay]), "c", &room, now);

        draw(&mut a, &[(10.0, 10.0), (20.0, 40.0)]);
        draw(&mut c, &[(150.0, 50.0), (180.0, 90.0)]);
        draw(&mut b, &[(5.0, 95.0)]);
        settle(&mut [&mut a, &mut b, &mut c], now);

        assert_eq!(a.replica().stroke_count(), 3);
        assert_eq!(snapshot_of(&a), snapshot_of(&b));
        assert_eq!(snapshot_of(&a), snapshot_of(&c));
        assert_eq!(c.peer_count(), 3);
    }

    #[test]
    fn test_presence_timeout_and_bye() {
        let hub = MemoryHub::new();
        let room = RoomId::new("presence").unwrap();
        let start = Instant::now();
        let mut a = session(&hub, "a", &room, start);
        let mut b = session(&hub, "b", &room, start);
        let mut c = session(&hub, "c", &room, start);
        settle(&mut [&mut a, &mut b, &mut c], start);
        assert_eq!(a.peer_count(), 3);

        // `c` leaves politely, `b` goes silent.
        c.leave();
        a.poll(start);
        assert_eq!(a.peer_count(), 2);

        let later = start + Duration::from_secs(7);
        let events = a.poll(later);
        assert!(events.contains(&SessionEvent::PeersChanged { count: 1 }));
        assert!(a.peers().is_empty());
    }

    #[test]
    fn test_garbage_is_ignored() {
        let hub = MemoryHub::new();
        let room = RoomId::new("noise").unwrap();
        let now = Instant::now();
        let mut a = session(&hub, "a", &room, now);
        let mut rogue = MemoryTransport::new(&hub, "rogue");
        rogue.join(&room).unwrap();

        rogue.broadcast(bytes::Bytes::from_static(b"\xff\x00not json"));
        rogue.broadcast(bytes::Bytes::from_static(
            br#"{"type":"ops","from":"rogue","ops":[{"op":"clear"},{"op":"create_stroke","stroke":{"id":"s","color":"red","size":2,"tool":"pen","points":[{"x":0.5,"y":0.5}]}}]}"#,
        ));
        a.poll(now);
        assert_eq!(a.replica().stroke_count(), 1);
        assert_eq!(a.replica().epoch(), 0);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let hub = MemoryHub::new();
        let room = RoomId::new("bye").unwrap();
        let now = Instant::now();
        let mut a = session(&hub, "a", &room, now);
        draw(&mut a, &[(10.0, 10.0)]);

        a.leave();
        a.leave();
        assert!(a.is_left());
        assert!(a.replica().is_empty());
        assert!(a.poll(now).is_empty());
        assert_eq!(a.connectivity(), Connectivity::Offline);
        assert_eq!(hub.member_count(&room.topic()), 0);
    }

    #[test]
    fn test_drop_leaves_room() {
        let hub = MemoryHub::new();
        let room = RoomId::new("drop").unwrap();
        let now = Instant::now();
        {
            let _a = session(&hub, "a", &room, now);
            assert_eq!(hub.member_count(&room.topic()), 1);
        }
        assert_eq!(hub.member_count(&room.topic()), 0);
    }

    #[test]
    fn test_connectivity_from_paths() {
        use ConnectionState::*;
        assert_eq!(Connectivity::from_paths(&[]), Connectivity::Offline);
        assert_eq!(
            Connectivity::from_paths(&[(PathKind::Direct, Connected), (PathKind::Relay, Reconnecting)]),
            Connectivity::Degraded
        );
        assert_eq!(
            Connectivity::from_paths(&[(PathKind::Relay, Connected)]),
            Connectivity::Online
        );
    }
}
