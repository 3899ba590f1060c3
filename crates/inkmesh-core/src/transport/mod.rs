//! Peer transport layer.
//!
//! A room is reachable over two independent paths carrying the same encoded
//! session messages:
//!
//! - **Direct**: a mesh of WebSocket links between peers, discovered through
//!   a rendezvous service ([`MeshTransport`]).
//! - **Relay**: a WebSocket relay that fans payloads out to every peer in the
//!   room and replays recent history to late joiners ([`RelayTransport`]).
//!   Native builds run it on a tokio task; browser builds drive a
//!   `web_sys::WebSocket` from [`Transport::poll_events`].
//!
//! [`DualTransport`] runs both. Messages arriving twice are fine; the replica
//! deduplicates. Transports never block the caller: events are queued by
//! background tasks and drained with [`Transport::poll_events`].

pub mod memory;
#[cfg(not(target_arch = "wasm32"))]
pub mod mesh;
#[cfg(not(target_arch = "wasm32"))]
pub mod relay;
pub mod relay_client;
#[cfg(target_arch = "wasm32")]
pub mod web_relay;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::ops::PeerId;
use crate::room::RoomId;

pub use memory::{MemoryHub, MemoryTransport};
#[cfg(not(target_arch = "wasm32"))]
pub use mesh::MeshTransport;
#[cfg(not(target_arch = "wasm32"))]
pub use relay::RelayTransport;
#[cfg(target_arch = "wasm32")]
pub use web_relay::RelayTransport;

/// First delay before reconnecting a lost path.
pub const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Upper bound on the reconnect delay.
pub const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Next reconnect delay after `current`.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_MAX_BACKOFF)
}

/// Which path a message or state change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    Direct,
    Relay,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Direct => f.write_str("direct"),
            PathKind::Relay => f.write_str("relay"),
        }
    }
}

/// Connection state of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Ranking used to report the best state across paths.
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Connected => 4,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Connecting => 2,
            ConnectionState::Error => 1,
            ConnectionState::Disconnected => 0,
        }
    }

    /// The better of two states.
    pub fn best(self, other: ConnectionState) -> ConnectionState {
        if other.rank() > self.rank() { other } else { self }
    }
}

/// Events produced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Payload from another peer
    Message { path: PathKind, bytes: Bytes },
    /// A path changed state
    PathState { path: PathKind, state: ConnectionState },
    /// A direct link to a peer came up
    LinkOpened { peer: PeerId },
    /// A direct link to a peer went away
    LinkClosed { peer: PeerId },
    /// Recoverable failure on a path
    Error { path: PathKind, message: String },
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("No async runtime available")]
    NoRuntime,
    #[error("Already joined a room")]
    AlreadyJoined,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Callback invoked for every inbound payload during `poll_events`.
pub type MessageCallback = Box<dyn FnMut(PathKind, &[u8]) + Send>;

/// `Send` on native targets. Browser transports hold JS handles and live on
/// the page's single thread.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSend: Send {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + ?Sized> MaybeSend for T {}
#[cfg(target_arch = "wasm32")]
pub trait MaybeSend {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSend for T {}

/// A way of reaching the other peers of a room.
pub trait Transport: MaybeSend {
    /// Start reaching peers under the room's topic.
    fn join(&mut self, room: &RoomId) -> Result<()>;

    /// Send a payload to every reachable peer. Never blocks; frames that
    /// cannot be queued are dropped.
    fn broadcast(&self, bytes: Bytes);

    /// Like [`broadcast`](Self::broadcast), for payloads relays need not
    /// keep in history.
    fn broadcast_ephemeral(&self, bytes: Bytes) {
        self.broadcast(bytes);
    }

    /// Register a callback for inbound payloads.
    fn on_message(&mut self, callback: MessageCallback);

    /// Drain queued events without blocking.
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    /// Best state across this transport's paths.
    fn state(&self) -> ConnectionState {
        self.path_states()
            .into_iter()
            .fold(ConnectionState::Disconnected, |acc, (_, s)| acc.best(s))
    }

    /// State of each path.
    fn path_states(&self) -> Vec<(PathKind, ConnectionState)>;

    /// Tear down every path. Safe to call more than once.
    fn leave(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn join(&mut self, room: &RoomId) -> Result<()> {
        (**self).join(room)
    }

    fn broadcast(&self, bytes: Bytes) {
        (**self).broadcast(bytes)
    }

    fn broadcast_ephemeral(&self, bytes: Bytes) {
        (**self).broadcast_ephemeral(bytes)
    }

    fn on_message(&mut self, callback: MessageCallback) {
        (**self).on_message(callback)
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        (**self).poll_events()
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    fn path_states(&self) -> Vec<(PathKind, ConnectionState)> {
        (**self).path_states()
    }

    fn leave(&mut self) {
        (**self).leave()
    }
}

/// Registered message callbacks.
#[derive(Default)]
pub(crate) struct MessageListeners(Vec<MessageCallback>);

impl MessageListeners {
    pub(crate) fn push(&mut self, callback: MessageCallback) {
        self.0.push(callback);
    }

    pub(crate) fn dispatch(&mut self, events: &[TransportEvent]) {
        if self.0.is_empty() {
            return;
        }
        for event in events {
            if let TransportEvent::Message { path, bytes } = event {
                for callback in self.0.iter_mut() {
                    callback(*path, bytes);
                }
            }
        }
    }
}

/// Validate a `ws://` or `wss://` URL.
pub fn parse_ws_url(url: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(TransportError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(parsed)
}

// --- Dual transport ---

/// Runs several transports side by side, typically direct mesh plus relay.
///
/// Joining succeeds if any path could be started. A path that fails later
/// does not affect the others.
#[derive(Default)]
pub struct DualTransport {
    paths: Vec<Box<dyn Transport>>,
    listeners: MessageListeners,
}

impl DualTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path.
    pub fn with(mut self, transport: impl Transport + 'static) -> Self {
        self.paths.push(Box::new(transport));
        self
    }

    /// Build the paths enabled in `config`. Browser builds have no direct
    /// path and use the relay alone.
    pub fn from_config(peer_id: &str, config: &crate::config::SessionConfig) -> Result<Self> {
        let mut dual = Self::new();
        if let Some(url) = &config.rendezvous_url {
            #[cfg(not(target_arch = "wasm32"))]
            {
                dual = dual.with(MeshTransport::new(
                    peer_id,
                    url,
                    &config.listen_addr,
                    config.advertise_addr.clone(),
                    config.outbound_queue,
                )?);
            }
            #[cfg(target_arch = "wasm32")]
            {
                let _ = peer_id;
                log::warn!("Direct links are unavailable in the browser, ignoring rendezvous {}", url);
            }
        }
        if let Some(url) = &config.relay_url {
            dual = dual.with(RelayTransport::new(url, config.outbound_queue)?);
        }
        if dual.paths.is_empty() {
            log::warn!("No transport paths configured; working offline");
        }
        Ok(dual)
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }
}

impl Transport for DualTransport {
    fn join(&mut self, room: &RoomId) -> Result<()> {
        let mut first_error = None;
        let mut joined = 0;
        for path in self.paths.iter_mut() {
            match path.join(room) {
                Ok(()) => joined += 1,
                Err(e) => {
                    log::warn!("Transport path failed to start: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if joined == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn broadcast(&self, bytes: Bytes) {
        for path in &self.paths {
            path.broadcast(bytes.clone());
        }
    }

    fn broadcast_ephemeral(&self, bytes: Bytes) {
        for path in &self.paths {
            path.broadcast_ephemeral(bytes.clone());
        }
    }

    fn on_message(&mut self, callback: MessageCallback) {
        self.listeners.push(callback);
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let events: Vec<TransportEvent> = self
            .paths
            .iter_mut()
            .flat_map(|path| path.poll_events())
            .collect();
        self.listeners.dispatch(&events);
        events
    }

    fn path_states(&self) -> Vec<(PathKind, ConnectionState)> {
        self.paths.iter().flat_map(|path| path.path_states()).collect()
    }

    fn leave(&mut self) {
        for path in self.paths.iter_mut() {
            path.leave();
        }
    }
}
