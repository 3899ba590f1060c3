//! Relay protocol state that does not depend on a socket implementation.
//!
//! [`decode_relay_frame`] turns a relay text frame into transport events for
//! every relay client. [`RelayClient`] also tracks the connection phase for
//! transports driven from the caller's poll loop (the browser one): which
//! frames to write, what to hold while the socket opens, and when to retry.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use super::{ConnectionState, PathKind, RECONNECT_INITIAL_BACKOFF, TransportEvent, next_backoff};
use crate::presence::Instant;
use crate::protocol::{RelayClientMessage, RelayServerMessage, decode_payload, encode_payload};

/// Events carried by one relay text frame.
pub fn decode_relay_frame(text: &str) -> Vec<TransportEvent> {
    let msg = match serde_json::from_str::<RelayServerMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Failed to parse relay frame: {}", e);
            return Vec::new();
        }
    };
    let mut events = Vec::new();
    match msg {
        RelayServerMessage::Joined {
            room,
            peer_count,
            history,
        } => {
            log::info!("Joined relay room {} ({} peers, {} history)", room, peer_count, history.len());
            events.push(TransportEvent::PathState {
                path: PathKind::Relay,
                state: ConnectionState::Connected,
            });
            events.extend(history.iter().filter_map(|data| payload_event(data)));
        }
        RelayServerMessage::Message { data, .. } => events.extend(payload_event(&data)),
        RelayServerMessage::PeerJoined { peer_id } => log::debug!("Relay peer joined: {}", peer_id),
        RelayServerMessage::PeerLeft { peer_id } => log::debug!("Relay peer left: {}", peer_id),
        RelayServerMessage::Error { message } => {
            log::warn!("Relay error: {}", message);
            events.push(TransportEvent::Error {
                path: PathKind::Relay,
                message,
            });
        }
    }
    events
}

fn payload_event(data: &str) -> Option<TransportEvent> {
    match decode_payload(data) {
        Some(bytes) => Some(TransportEvent::Message {
            path: PathKind::Relay,
            bytes: Bytes::from(bytes),
        }),
        None => {
            log::warn!("Discarding relay payload with invalid base64");
            None
        }
    }
}

fn encode(msg: &RelayClientMessage) -> Option<String> {
    serde_json::to_string(msg)
        .map_err(|e| log::warn!("Failed to encode relay frame: {}", e))
        .ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Open,
    /// Socket lost; retry at the given time
    Waiting(Instant),
}

/// Relay connection bookkeeping for a poll-driven socket.
#[derive(Debug)]
pub struct RelayClient {
    topic: String,
    outbound_capacity: usize,
    phase: Phase,
    backoff: Duration,
    /// Frames published while the socket is still opening
    pending: VecDeque<String>,
}

impl RelayClient {
    /// A client whose first socket is being opened.
    pub fn new(topic: impl Into<String>, outbound_capacity: usize) -> Self {
        Self {
            topic: topic.into(),
            outbound_capacity: outbound_capacity.max(1),
            phase: Phase::Connecting,
            backoff: RECONNECT_INITIAL_BACKOFF,
            pending: VecDeque::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    /// The socket opened. Returns the frames to write: the join, then
    /// whatever was published meanwhile.
    pub fn opened(&mut self) -> Vec<String> {
        self.phase = Phase::Open;
        self.backoff = RECONNECT_INITIAL_BACKOFF;
        let join = encode(&RelayClientMessage::Join {
            room: self.topic.clone(),
        });
        join.into_iter().chain(self.pending.drain(..)).collect()
    }

    /// Frame to write now for a payload, if any.
    ///
    /// Payloads published while the socket opens are held (up to the
    /// outbound capacity) until [`opened`](Self::opened). While waiting to
    /// reconnect they are dropped; peers catch up through snapshots.
    pub fn publish(&mut self, data: &[u8], ephemeral: bool) -> Option<String> {
        let frame = encode(&RelayClientMessage::Publish {
            data: encode_payload(data),
            ephemeral,
        })?;
        match self.phase {
            Phase::Open => Some(frame),
            Phase::Connecting => {
                if self.pending.len() >= self.outbound_capacity {
                    log::warn!("Relay outbound queue full, dropping payload");
                } else {
                    self.pending.push_back(frame);
                }
                None
            }
            Phase::Waiting(_) => {
                log::debug!("Relay offline, dropping payload");
                None
            }
        }
    }

    /// The socket closed or could not be created; schedules the next try.
    pub fn lost(&mut self, reason: &str, now: Instant) -> TransportEvent {
        log::warn!("Relay connection lost: {}", reason);
        self.phase = Phase::Waiting(now + self.backoff);
        self.backoff = next_backoff(self.backoff);
        self.pending.clear();
        TransportEvent::Error {
            path: PathKind::Relay,
            message: reason.to_string(),
        }
    }

    /// True once a scheduled retry is due; the client is then connecting again.
    pub fn reconnect_due(&mut self, now: Instant) -> bool {
        match self.phase {
            Phase::Waiting(at) if now >= at => {
                self.phase = Phase::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Goodbye frame, when there is an open socket to send it on.
    pub fn leave_frame(&self) -> Option<String> {
        if self.is_open() {
            encode(&RelayClientMessage::Leave)
        } else {
            None
        }
    }
}
