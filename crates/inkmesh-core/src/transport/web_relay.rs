//! Relay path in the browser, over `web_sys::WebSocket`.
//!
//! Socket callbacks push what they see into a queue drained by
//! [`Transport::poll_events`]. Reconnects are started from there as well
//! once the backoff has elapsed, so the page's frame loop drives this
//! transport. Protocol handling is shared with the native client through
//! [`RelayClient`].

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use url::Url;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{BinaryType, CloseEvent, Event, MessageEvent, WebSocket};

use super::relay_client::{RelayClient, decode_relay_frame};
use super::{
    ConnectionState, MessageCallback, MessageListeners, PathKind, Result, Transport, TransportError, TransportEvent,
    parse_ws_url,
};
use crate::presence::Instant;
use crate::room::RoomId;

/// What the socket callbacks saw.
enum Signal {
    Open,
    Text(String),
    Binary(Vec<u8>),
    Error,
    Closed { code: u16, reason: String },
}

type Inbox = Rc<RefCell<Vec<Signal>>>;

/// A browser WebSocket and the callbacks installed on it.
struct Socket {
    ws: WebSocket,
    _on_open: Closure<dyn FnMut()>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_close: Closure<dyn FnMut(CloseEvent)>,
    _on_error: Closure<dyn FnMut(Event)>,
}

impl Socket {
    fn open(url: &Url, inbox: &Inbox) -> std::result::Result<Self, String> {
        let ws = WebSocket::new(url.as_str()).map_err(|e| format!("Failed to create WebSocket: {:?}", e))?;
        ws.set_binary_type(BinaryType::Arraybuffer);

        let signals = Rc::clone(inbox);
        let on_open = Closure::wrap(Box::new(move || {
            signals.borrow_mut().push(Signal::Open);
        }) as Box<dyn FnMut()>);
        ws.set_onopen(Some(on_open.as_ref().unchecked_ref()));

        let signals = Rc::clone(inbox);
        let on_message = Closure::wrap(Box::new(move |e: MessageEvent| {
            let data = e.data();
            if let Some(text) = data.as_string() {
                signals.borrow_mut().push(Signal::Text(text));
            } else if let Ok(buffer) = data.dyn_into::<js_sys::ArrayBuffer>() {
                let bytes = js_sys::Uint8Array::new(&buffer).to_vec();
                signals.borrow_mut().push(Signal::Binary(bytes));
            }
        }) as Box<dyn FnMut(MessageEvent)>);
        ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));

        let signals = Rc::clone(inbox);
        let on_close = Closure::wrap(Box::new(move |e: CloseEvent| {
            signals.borrow_mut().push(Signal::Closed {
                code: e.code(),
                reason: e.reason(),
            });
        }) as Box<dyn FnMut(CloseEvent)>);
        ws.set_onclose(Some(on_close.as_ref().unchecked_ref()));

        let signals = Rc::clone(inbox);
        let on_error = Closure::wrap(Box::new(move |_e: Event| {
            signals.borrow_mut().push(Signal::Error);
        }) as Box<dyn FnMut(Event)>);
        ws.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        Ok(Self {
            ws,
            _on_open: on_open,
            _on_message: on_message,
            _on_close: on_close,
            _on_error: on_error,
        })
    }

    fn send(&self, frame: &str) {
        if let Err(e) = self.ws.send_with_str(frame) {
            log::warn!("Relay send failed: {:?}", e);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // The closures go away with `self`; the socket must not call them after.
        self.ws.set_onopen(None);
        self.ws.set_onmessage(None);
        self.ws.set_onclose(None);
        self.ws.set_onerror(None);
        let _ = self.ws.close();
    }
}

/// Relay client transport for the browser.
pub struct RelayTransport {
    url: Url,
    outbound_capacity: usize,
    client: RefCell<Option<RelayClient>>,
    socket: Option<Socket>,
    inbox: Inbox,
    /// Events raised outside a poll, delivered on the next one
    backlog: Vec<TransportEvent>,
    state: ConnectionState,
    listeners: MessageListeners,
}

impl RelayTransport {
    /// Create a relay transport for `url` (`ws://` or `wss://`).
    pub fn new(url: &str, outbound_capacity: usize) -> Result<Self> {
        Ok(Self {
            url: parse_ws_url(url)?,
            outbound_capacity: outbound_capacity.max(1),
            client: RefCell::new(None),
            socket: None,
            inbox: Rc::new(RefCell::new(Vec::new())),
            backlog: Vec::new(),
            state: ConnectionState::Disconnected,
            listeners: MessageListeners::default(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn connect(&mut self) {
        let Some(client) = self.client.get_mut().as_mut() else {
            return;
        };
        match Socket::open(&self.url, &self.inbox) {
            Ok(socket) => self.socket = Some(socket),
            Err(reason) => self.backlog.push(client.lost(&reason, Instant::now())),
        }
    }

    fn publish(&self, data: Bytes, ephemeral: bool) {
        let mut client = self.client.borrow_mut();
        let Some(client) = client.as_mut() else {
            log::debug!("Relay not joined, dropping payload");
            return;
        };
        if let (Some(frame), Some(socket)) = (client.publish(&data, ephemeral), &self.socket) {
            socket.send(&frame);
        }
    }

    fn handle_signal(&mut self, signal: Signal, events: &mut Vec<TransportEvent>) {
        let Some(client) = self.client.get_mut().as_mut() else {
            return;
        };
        match signal {
            Signal::Open => {
                log::info!("Relay connected to {}", self.url);
                if let Some(socket) = &self.socket {
                    for frame in client.opened() {
                        socket.send(&frame);
                    }
                }
            }
            Signal::Text(text) => events.extend(decode_relay_frame(&text)),
            Signal::Binary(bytes) => events.push(TransportEvent::Message {
                path: PathKind::Relay,
                bytes: Bytes::from(bytes),
            }),
            // A close event always follows.
            Signal::Error => log::debug!("Relay socket error"),
            Signal::Closed { code, reason } => {
                self.socket = None;
                let reason = format!("closed by relay ({} {})", code, reason);
                events.push(client.lost(&reason, Instant::now()));
            }
        }
    }
}

impl Transport for RelayTransport {
    fn join(&mut self, room: &RoomId) -> Result<()> {
        if self.client.get_mut().is_some() {
            return Err(TransportError::AlreadyJoined);
        }
        *self.client.get_mut() = Some(RelayClient::new(room.topic(), self.outbound_capacity));
        self.state = ConnectionState::Connecting;
        self.connect();
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
        let mut events = std::mem::take(&mut self.backlog);
        let signals = std::mem::take(&mut *self.inbox.borrow_mut());
        for signal in signals {
            self.handle_signal(signal, &mut events);
        }

        let now = Instant::now();
        if self.client.get_mut().as_mut().is_some_and(|c| c.reconnect_due(now)) {
            events.push(TransportEvent::PathState {
                path: PathKind::Relay,
                state: ConnectionState::Reconnecting,
            });
            self.connect();
            events.append(&mut self.backlog);
        }

        for event in &events {
            if let TransportEvent::PathState { state, .. } = event {
                self.state = *state;
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
        let client = self.client.get_mut().take();
        if let (Some(client), Some(socket)) = (client, self.socket.take()) {
            if let Some(frame) = client.leave_frame() {
                socket.send(&frame);
            }
        }
        self.inbox.borrow_mut().clear();
        self.backlog.clear();
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.leave();
    }
}
