//! InkMesh Core Library
//!
//! Platform-agnostic synchronization engine for the InkMesh shared canvas:
//! the replicated stroke log, local stroke building, presence, the wire
//! formats and the peer transport layer.

pub mod collaboration;
pub mod config;
pub mod input;
pub mod ops;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod room;
pub mod stroke;
pub mod transport;
pub mod wire;

pub use collaboration::{Connectivity, RoomSession, SessionEvent};
pub use config::{ConfigError, SessionConfig};
pub use input::{CaptureRequest, InputOutput, MouseButton, PointerEvent, StrokeBuilder};
pub use ops::{Operation, PeerId};
pub use presence::{AwarenessState, PeerPresence, Presence};
pub use replica::{Replica, ReplicaChange};
pub use room::{RoomId, RoomIdError};
pub use stroke::{Brush, Stroke, StrokeId, Tool};
pub use transport::{ConnectionState, PathKind, Transport, TransportError, TransportEvent};
pub use wire::{WireError, WireMessage};
