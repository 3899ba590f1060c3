//! Relay path: one WebSocket to a fan-out server.
//!
//! The connection runs on a tokio task. It joins the room topic, publishes
//! base64 payloads and turns relay frames (including the history replayed on
//! join) into [`TransportEvent`]s. A lost connection is retried with
//! exponential backoff until [`Transport::leave`].

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{
    ConnectionState, MessageCallback, MessageListeners, PathKind, RECONNECT_INITIAL_BACKOFF, Result, Transport,
    TransportError, TransportEvent, next_backoff, parse_ws_url,
};
use super::relay_client::decode_relay_frame;
use crate::protocol::{RelayClientMessage, encode_payload};
use crate::room::RoomId;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Outbound {
    data: Bytes,
    ephemeral: bool,
}

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Relay client transport.
pub struct RelayTransport {
    url: Url,
    outbound_capacity: usize,
    state: ConnectionState,
    outbound: Option<mpsc::Sender<Outbound>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    listeners: MessageListeners,
}

impl RelayTransport {
    /// Create a relay transport for `url` (`ws://` or `wss://`).
    pub fn new(url: &str, outbound_capacity: usize) -> Result<Self> {
        Ok(Self {
            url: parse_ws_url(url)?,
            outbound_capacity: outbound_capacity.max(1),
            state: ConnectionState::Disconnected,
            outbound: None,
            events: None,
            shutdown: None,
            task: None,
            listeners: MessageListeners::default(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn publish(&self, data: Bytes, ephemeral: bool) {
        let Some(tx) = &self.outbound else {
            log::debug!("Relay not joined, dropping payload");
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(Outbound { data, ephemeral }) {
            log::warn!("Relay outbound queue full, dropping payload");
        }
    }
}

impl Transport for RelayTransport {
    fn join(&mut self, room: &RoomId) -> Result<()> {
        if self.task.is_some() {
            return Err(TransportError::AlreadyJoined);
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = handle.spawn(run_relay(
            self.url.clone(),
            room.topic(),
            outbound_rx,
            event_tx,
            shutdown_rx,
        ));

        self.state = ConnectionState::Connecting;
        self.outbound = Some(outbound_tx);
        self.events = Some(event_rx);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    fn broadcast(&self, bytes: Bytes) {
        self.publish(bytes, false);
    }

    fn broadcast_ephemeral(&self, bytes: Bytes) {
        self.publish(bytes, true);
    }

    fn on_message(&mut self, callback: MessageCallback) {
        self.listeners.push(callback);
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if let Some(rx) = self.events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                if let TransportEvent::PathState { state, .. } = &event {
                    self.state = *state;
                }
                events.push(event);
            }
        }
        self.listeners.dispatch(&events);
        events
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn path_states(&self) -> Vec<(PathKind, ConnectionState)> {
        vec![(PathKind::Relay, self.state)]
    }

    fn leave(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        // The task exits on its own after sending `leave`; it is not awaited.
        self.task = None;
        self.outbound = None;
        self.events = None;
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.leave();
    }
}

// --- Background task ---

fn emit_state(events: &mpsc::UnboundedSender<TransportEvent>, state: ConnectionState) {
    let _ = events.send(TransportEvent::PathState {
        path: PathKind::Relay,
        state,
    });
}

async fn run_relay(
    url: Url,
    topic: String,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut backoff = RECONNECT_INITIAL_BACKOFF;
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            emit_state(&events, ConnectionState::Reconnecting);
        }
        attempt += 1;

        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = &mut shutdown => break,
        };

        match connected {
            Ok((socket, _)) => {
                log::info!("Relay connected to {}", url);
                backoff = RECONNECT_INITIAL_BACKOFF;
                match run_session(socket, &topic, &mut outbound, &events, &mut shutdown).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => {
                        log::warn!("Relay connection lost: {}", reason);
                        let _ = events.send(TransportEvent::Error {
                            path: PathKind::Relay,
                            message: reason,
                        });
                    }
                }
            }
            Err(e) => {
                log::warn!("Relay connection to {} failed: {}", url, e);
                let _ = events.send(TransportEvent::Error {
                    path: PathKind::Relay,
                    message: format!("Connection failed: {}", e),
                });
            }
        }

        // Payloads published while offline are dropped; peers catch up
        // through snapshots once the path is back.
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        let stop = loop {
            tokio::select! {
                _ = &mut sleep => break false,
                _ = &mut shutdown => break true,
                msg = outbound.recv() => {
                    if msg.is_none() {
                        break true;
                    }
                }
            }
        };
        if stop {
            break;
        }
        backoff = next_backoff(backoff);
    }

    emit_state(&events, ConnectionState::Disconnected);
    log::info!("Relay task for {} exiting", topic);
}

async fn run_session(
    socket: RelaySocket,
    topic: &str,
    outbound: &mut mpsc::Receiver<Outbound>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    shutdown: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    let join = RelayClientMessage::Join {
        room: topic.to_string(),
    };
    if let Err(e) = send_json(&mut sink, &join).await {
        return SessionEnd::Lost(e);
    }

    loop {
        tokio::select! {
            // Flush queued payloads (such as a goodbye) before honoring shutdown.
            biased;
            out = outbound.recv() => {
                let Some(Outbound { data, ephemeral }) = out else {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                };
                let msg = RelayClientMessage::Publish {
                    data: encode_payload(&data),
                    ephemeral,
                };
                if let Err(e) = send_json(&mut sink, &msg).await {
                    return SessionEnd::Lost(e);
                }
            }
            _ = &mut *shutdown => {
                let _ = send_json(&mut sink, &RelayClientMessage::Leave).await;
                let _ = sink.close().await;
                return SessionEnd::Shutdown;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(text.as_str(), events),
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Message {
                        path: PathKind::Relay,
                        bytes: data,
                    });
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost("closed by relay".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
            }
        }
    }
}

async fn send_json<S>(sink: &mut S, msg: &RelayClientMessage) -> std::result::Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::text(json)).await.map_err(|e| e.to_string())
}

fn handle_frame(text: &str, events: &mpsc::UnboundedSender<TransportEvent>) {
    for event in decode_relay_frame(text) {
        let _ = events.send(event);
    }
}
