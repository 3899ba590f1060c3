//! Presence and awareness for peers in a room.
//!
//! Each peer periodically announces a small liveness record. Remote records
//! are kept in a last-seen map and evicted after a timeout without updates.
//! None of this is part of the drawing document.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ops::PeerId;

// Use web_time for WASM compatibility
#[cfg(target_arch = "wasm32")]
pub use web_time::Instant;
#[cfg(not(target_arch = "wasm32"))]
pub use std::time::Instant;

/// Default interval between liveness announcements.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// Default time after which a silent peer is dropped.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(6);

/// Ephemeral per-peer awareness fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// Display label shown to other peers.
    pub label: String,
    /// User color (CSS color string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Normalized cursor position, if the pointer is over the canvas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

impl AwarenessState {
    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// A remote peer as currently seen.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub peer_id: PeerId,
    pub state: AwarenessState,
}

#[derive(Debug)]
struct PeerEntry {
    state: AwarenessState,
    last_seen: Instant,
}

/// Callback invoked with the remote peer list whenever it changes.
pub type PeersChangedCallback = Box<dyn FnMut(&[PeerPresence]) + Send>;

/// Last-seen presence map for one room.
pub struct Presence {
    local_id: PeerId,
    local: Option<AwarenessState>,
    peers: HashMap<PeerId, PeerEntry>,
    heartbeat: Duration,
    timeout: Duration,
    last_announced: Option<Instant>,
    local_dirty: bool,
    listeners: Vec<PeersChangedCallback>,
}

impl Presence {
    /// Create a presence view for `local_id`.
    pub fn new(local_id: impl Into<PeerId>) -> Self {
        Self::with_timing(local_id, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PRESENCE_TIMEOUT)
    }

    pub fn with_timing(local_id: impl Into<PeerId>, heartbeat: Duration, timeout: Duration) -> Self {
        Self {
            local_id: local_id.into(),
            local: None,
            peers: HashMap::new(),
            heartbeat,
            timeout,
            last_announced: None,
            local_dirty: false,
            listeners: Vec::new(),
        }
    }

    /// Set the fields announced for this peer.
    pub fn set_local_state(&mut self, state: AwarenessState) {
        if self.local.as_ref() != Some(&state) {
            self.local = Some(state);
            self.local_dirty = true;
        }
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.local.as_ref()
    }

    /// Stop announcing this peer.
    pub fn clear_local(&mut self) {
        self.local = None;
        self.local_dirty = false;
        self.last_announced = None;
    }

    /// Register a listener for peer list changes.
    pub fn on_peers_changed(&mut self, callback: impl FnMut(&[PeerPresence]) + Send + 'static) {
        self.listeners.push(Box::new(callback));
    }

    /// Returns the local record if a heartbeat is due or the state changed.
    pub fn announcement(&mut self, now: Instant) -> Option<AwarenessState> {
        let state = self.local.as_ref()?;
        let due = self
            .last_announced
            .is_none_or(|last| now.saturating_duration_since(last) >= self.heartbeat);
        if !(due || self.local_dirty) {
            return None;
        }
        self.last_announced = Some(now);
        self.local_dirty = false;
        Some(state.clone())
    }

    /// Record a liveness update from a remote peer.
    ///
    /// Returns true if the peer is new or its state changed.
    pub fn observe(&mut self, peer_id: &str, state: AwarenessState, now: Instant) -> bool {
        if peer_id == self.local_id {
            return false;
        }
        let changed = match self.peers.get_mut(peer_id) {
            Some(entry) => {
                entry.last_seen = now;
                let changed = entry.state != state;
                entry.state = state;
                changed
            }
            None => {
                log::info!("Peer {} is present", peer_id);
                self.peers.insert(
                    peer_id.to_string(),
                    PeerEntry {
                        state,
                        last_seen: now,
                    },
                );
                true
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Drop a peer immediately (it said goodbye).
    pub fn remove(&mut self, peer_id: &str) -> bool {
        let removed = self.peers.remove(peer_id).is_some();
        if removed {
            log::info!("Peer {} left", peer_id);
            self.notify();
        }
        removed
    }

    /// Evict peers not heard from within the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.timeout;
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }
        for id in &expired {
            log::info!("Peer {} timed out", id);
            self.peers.remove(id);
        }
        self.notify();
        expired
    }

    /// Remote peers sorted by id.
    pub fn peers(&self) -> Vec<PeerPresence> {
        let mut peers: Vec<PeerPresence> = self
            .peers
            .iter()
            .map(|(id, e)| PeerPresence {
                peer_id: id.clone(),
                state: e.state.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Ids of the remote peers currently present, unordered.
    pub fn peer_ids(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    /// Participant count, including this peer.
    pub fn peer_count(&self) -> usize {
        self.peers.len() + 1
    }

    /// Forget every remote peer.
    pub fn clear_peers(&mut self) {
        if !self.peers.is_empty() {
            self.peers.clear();
            self.notify();
        }
    }

    fn notify(&mut self) {
        if self.listeners.is_empty() {
            return;
        }
        let peers = self.peers();
        for listener in self.listeners.iter_mut() {
            listener(&peers);
        }
    }
}
