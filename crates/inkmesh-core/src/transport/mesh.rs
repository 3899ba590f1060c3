//! Direct path: a mesh of WebSocket links between peers.
//!
//! Each peer listens on a local TCP address and registers a [`PeerOffer`]
//! with the rendezvous service under the room topic. The service answers
//! with the offers already registered; the newcomer dials each of them and
//! later arrivals dial us. Both sides of a link open with a [`LinkHello`]
//! naming the peer and its own offer URL; links for another topic are
//! refused.
//!
//! A link that drops without a close frame is redialed with the reconnect
//! backoff, from each side that knows the other's offer. Duplicate links to
//! one peer are settled by [`LinkRank`], which both ends compute alike.
//!
//! Tasks:
//! - the mesh actor owns the link table and the path state, and fans out broadcasts,
//! - the accept loop performs inbound handshakes,
//! - the signaling task keeps the rendezvous registration alive,
//! - one task per link pumps frames, one per dropped link redials it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use url::Url;

use super::{
    ConnectionState, MessageCallback, MessageListeners, PathKind, RECONNECT_INITIAL_BACKOFF, Result, Transport,
    TransportError, TransportEvent, next_backoff, parse_ws_url,
};
use crate::ops::PeerId;
use crate::protocol::{LinkHello, PeerOffer, SignalClientMessage, SignalServerMessage};
use crate::room::RoomId;

/// Time allowed for a link handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Dial attempts made for a dropped link before giving up on it.
pub const REDIAL_ATTEMPTS: u32 = 8;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

type EventSender = mpsc::UnboundedSender<TransportEvent>;

enum MeshInternal {
    Signaling(ConnectionState),
    Candidates(Vec<PeerOffer>),
    LinkUp {
        peer: PeerId,
        link_id: u64,
        rank: LinkRank,
        offer: Option<PeerOffer>,
        outbound: mpsc::Sender<Bytes>,
    },
    LinkDown {
        peer: PeerId,
        link_id: u64,
        graceful: bool,
    },
    RedialGaveUp {
        peer: PeerId,
        cancel: Arc<AtomicBool>,
    },
}

/// Order between duplicate links to the same peer. Both ends derive the
/// same rank for a link, so each keeps the highest and they agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LinkRank {
    /// Dialed by the lower of the two peer ids
    by_lower: bool,
    /// Dialer's serial for the link
    serial: u64,
}

impl LinkRank {
    fn new(dialer: &str, acceptor: &str, serial: u64) -> Self {
        Self {
            by_lower: dialer < acceptor,
            serial,
        }
    }
}

struct LinkHandle {
    link_id: u64,
    rank: LinkRank,
    outbound: mpsc::Sender<Bytes>,
}

/// Identity and limits shared by the mesh tasks.
#[derive(Clone)]
struct LinkContext {
    peer_id: PeerId,
    topic: String,
    offer_url: String,
    outbound_capacity: usize,
    events: EventSender,
    internal: mpsc::UnboundedSender<MeshInternal>,
}

/// Direct mesh transport.
pub struct MeshTransport {
    peer_id: PeerId,
    rendezvous_url: Url,
    listen_addr: String,
    advertise_addr: Option<String>,
    outbound_capacity: usize,
    local_addr: Option<SocketAddr>,
    state: ConnectionState,
    link_count: usize,
    broadcasts: Option<mpsc::Sender<Bytes>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    listeners: MessageListeners,
}

impl MeshTransport {
    pub fn new(
        peer_id: &str,
        rendezvous_url: &str,
        listen_addr: &str,
        advertise_addr: Option<String>,
        outbound_capacity: usize,
    ) -> Result<Self> {
        Ok(Self {
            peer_id: peer_id.to_string(),
            rendezvous_url: parse_ws_url(rendezvous_url)?,
            listen_addr: listen_addr.to_string(),
            advertise_addr,
            outbound_capacity: outbound_capacity.max(1),
            local_addr: None,
            state: ConnectionState::Disconnected,
            link_count: 0,
            broadcasts: None,
            events: None,
            shutdown: None,
            task: None,
            listeners: MessageListeners::default(),
        })
    }

    /// Address direct links are accepted on, once joined.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of open direct links.
    pub fn link_count(&self) -> usize {
        self.link_count
    }

    fn offer_url(&self, bound: SocketAddr) -> String {
        match &self.advertise_addr {
            Some(addr) => format!("ws://{}", addr),
            None => format!("ws://{}", bound),
        }
    }
}

impl Transport for MeshTransport {
    fn join(&mut self, room: &RoomId) -> Result<()> {
        if self.task.is_some() {
            return Err(TransportError::AlreadyJoined);
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        // Bind synchronously so the advertised address is known up front.
        let std_listener = std::net::TcpListener::bind(&self.listen_addr)?;
        std_listener.set_nonblocking(true)?;
        let bound = std_listener.local_addr()?;
        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(std_listener)?
        };

        let (broadcast_tx, broadcast_rx) = mpsc::channel(self.outbound_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let offer = PeerOffer {
            peer_id: self.peer_id.clone(),
            url: self.offer_url(bound),
        };
        let ctx = LinkContext {
            peer_id: self.peer_id.clone(),
            topic: room.topic(),
            offer_url: offer.url.clone(),
            outbound_capacity: self.outbound_capacity,
            events: event_tx,
            internal: internal_tx,
        };
        log::info!("Direct links for {} accepted on {}", ctx.topic, bound);

        let accept = handle.spawn(accept_loop(listener, ctx.clone()));
        let signaling = handle.spawn(run_signaling(self.rendezvous_url.clone(), offer, ctx.clone()));
        let task = handle.spawn(run_mesh(ctx, broadcast_rx, internal_rx, shutdown_rx, accept, signaling));

        self.local_addr = Some(bound);
        self.state = ConnectionState::Connecting;
        self.broadcasts = Some(broadcast_tx);
        self.events = Some(event_rx);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    fn broadcast(&self, bytes: Bytes) {
        let Some(tx) = &self.broadcasts else {
            log::debug!("Mesh not joined, dropping payload");
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(bytes) {
            log::warn!("Mesh outbound queue full, dropping payload");
        }
    }

    fn on_message(&mut self, callback: MessageCallback) {
        self.listeners.push(callback);
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if let Some(rx) = self.events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                match &event {
                    TransportEvent::PathState { state, .. } => self.state = *state,
                    TransportEvent::LinkOpened { .. } => self.link_count += 1,
                    TransportEvent::LinkClosed { .. } => self.link_count = self.link_count.saturating_sub(1),
                    _ => {}
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
        vec![(PathKind::Direct, self.state)]
    }

    fn leave(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task = None;
        self.broadcasts = None;
        self.events = None;
        self.local_addr = None;
        self.link_count = 0;
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        self.leave();
    }
}

// --- Mesh actor ---

fn emit(events: &EventSender, event: TransportEvent) {
    let _ = events.send(event);
}

fn emit_state(events: &EventSender, state: ConnectionState) {
    emit(
        events,
        TransportEvent::PathState {
            path: PathKind::Direct,
            state,
        },
    );
}

/// Direct path state: up while any link is, recovering while a dropped link
/// is being redialed, otherwise whatever the rendezvous connection is.
fn direct_state(links: usize, redialing: bool, signaling: ConnectionState) -> ConnectionState {
    if links > 0 {
        ConnectionState::Connected
    } else if redialing {
        ConnectionState::Reconnecting
    } else {
        signaling
    }
}

/// State owned by the mesh actor.
struct Mesh {
    ctx: LinkContext,
    links: HashMap<PeerId, LinkHandle>,
    /// Last known offer of every peer, for redials
    offers: HashMap<PeerId, PeerOffer>,
    redials: HashMap<PeerId, Arc<AtomicBool>>,
    signaling: ConnectionState,
    reported: ConnectionState,
}

impl Mesh {
    fn new(ctx: LinkContext) -> Self {
        Self {
            ctx,
            links: HashMap::new(),
            offers: HashMap::new(),
            redials: HashMap::new(),
            signaling: ConnectionState::Connecting,
            reported: ConnectionState::Connecting,
        }
    }

    fn broadcast(&self, bytes: Bytes) {
        for (peer, link) in &self.links {
            if let Err(mpsc::error::TrySendError::Full(_)) = link.outbound.try_send(bytes.clone()) {
                log::warn!("Link to {} is backed up, dropping payload", peer);
            }
        }
    }

    fn handle(&mut self, msg: MeshInternal) {
        match msg {
            MeshInternal::Signaling(state) => self.signaling = state,
            MeshInternal::Candidates(offers) => {
                self.signaling = ConnectionState::Connected;
                for offer in offers {
                    if offer.peer_id == self.ctx.peer_id {
                        continue;
                    }
                    self.offers.insert(offer.peer_id.clone(), offer.clone());
                    if !self.links.contains_key(&offer.peer_id) {
                        tokio::spawn(dial(offer, self.ctx.clone()));
                    }
                }
            }
            MeshInternal::LinkUp {
                peer,
                link_id,
                rank,
                offer,
                outbound,
            } => {
                if let Some(offer) = offer {
                    self.offers.insert(peer.clone(), offer);
                }
                if let Some(cancel) = self.redials.remove(&peer) {
                    cancel.store(true, Ordering::Relaxed);
                }
                let link = LinkHandle {
                    link_id,
                    rank,
                    outbound,
                };
                match self.links.get_mut(&peer) {
                    // Dropping the new handle closes that link.
                    Some(existing) if existing.rank >= rank => {
                        log::debug!("Duplicate link to {}, keeping the existing one", peer);
                    }
                    Some(existing) => {
                        log::debug!("Duplicate link to {}, switching to the new one", peer);
                        *existing = link;
                    }
                    None => {
                        log::info!("Direct link to {} open", peer);
                        self.links.insert(peer.clone(), link);
                        emit(&self.ctx.events, TransportEvent::LinkOpened { peer });
                    }
                }
            }
            MeshInternal::LinkDown {
                peer,
                link_id,
                graceful,
            } => {
                if !self.links.get(&peer).is_some_and(|l| l.link_id == link_id) {
                    return;
                }
                self.links.remove(&peer);
                log::info!("Direct link to {} closed", peer);
                emit(&self.ctx.events, TransportEvent::LinkClosed { peer: peer.clone() });
                if !graceful {
                    self.start_redial(&peer);
                }
            }
            MeshInternal::RedialGaveUp { peer, cancel } => {
                if self.redials.get(&peer).is_some_and(|c| Arc::ptr_eq(c, &cancel)) {
                    self.redials.remove(&peer);
                }
            }
        }
    }

    fn start_redial(&mut self, peer: &str) {
        if self.redials.contains_key(peer) {
            return;
        }
        let Some(offer) = self.offers.get(peer) else {
            log::debug!("No offer known for {}, not redialing", peer);
            return;
        };
        log::info!("Link to {} dropped, redialing {}", peer, offer.url);
        let cancel = Arc::new(AtomicBool::new(false));
        self.redials.insert(peer.to_string(), Arc::clone(&cancel));
        tokio::spawn(redial(offer.clone(), self.ctx.clone(), cancel));
    }

    fn report_state(&mut self) {
        let state = direct_state(self.links.len(), !self.redials.is_empty(), self.signaling);
        if state != self.reported {
            self.reported = state;
            emit_state(&self.ctx.events, state);
        }
    }

    fn shutdown(&mut self) {
        for cancel in self.redials.values() {
            cancel.store(true, Ordering::Relaxed);
        }
        self.redials.clear();
        // Dropping the senders lets every link task close its socket.
        self.links.clear();
    }
}

async fn run_mesh(
    ctx: LinkContext,
    mut broadcasts: mpsc::Receiver<Bytes>,
    mut internal: mpsc::UnboundedReceiver<MeshInternal>,
    mut shutdown: oneshot::Receiver<()>,
    accept: JoinHandle<()>,
    signaling: JoinHandle<()>,
) {
    let mut mesh = Mesh::new(ctx);

    loop {
        tokio::select! {
            biased;
            bytes = broadcasts.recv() => {
                let Some(bytes) = bytes else { break };
                mesh.broadcast(bytes);
            }
            _ = &mut shutdown => break,
            msg = internal.recv() => {
                let Some(msg) = msg else { break };
                mesh.handle(msg);
                mesh.report_state();
            }
        }
    }

    accept.abort();
    signaling.abort();
    mesh.shutdown();
    emit_state(&mesh.ctx.events, ConnectionState::Disconnected);
    log::info!("Mesh for {} shut down", mesh.ctx.topic);
}

// --- Signaling ---

async fn run_signaling(url: Url, offer: PeerOffer, ctx: LinkContext) {
    let mut backoff = RECONNECT_INITIAL_BACKOFF;
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            let _ = ctx.internal.send(MeshInternal::Signaling(ConnectionState::Reconnecting));
        }
        attempt += 1;

        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                backoff = RECONNECT_INITIAL_BACKOFF;
                let reason = signaling_session(socket, &offer, &ctx).await;
                log::warn!("Rendezvous connection lost: {}", reason);
                emit(
                    &ctx.events,
                    TransportEvent::Error {
                        path: PathKind::Direct,
                        message: reason,
                    },
                );
            }
            Err(e) => {
                log::warn!("Rendezvous connection to {} failed: {}", url, e);
                emit(
                    &ctx.events,
                    TransportEvent::Error {
                        path: PathKind::Direct,
                        message: format!("Rendezvous unreachable: {}", e),
                    },
                );
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

/// Runs one rendezvous connection; returns why it ended.
async fn signaling_session<S>(socket: WebSocketStream<S>, offer: &PeerOffer, ctx: &LinkContext) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let announce = SignalClientMessage::Announce {
        topic: ctx.topic.clone(),
        offer: offer.clone(),
    };
    let json = match serde_json::to_string(&announce) {
        Ok(json) => json,
        Err(e) => return e.to_string(),
    };
    if let Err(e) = sink.send(Message::text(json)).await {
        return e.to_string();
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalServerMessage>(text.as_str()) {
                Ok(SignalServerMessage::Candidates { offers }) => {
                    log::info!("Rendezvous returned {} candidate(s) for {}", offers.len(), ctx.topic);
                    let _ = ctx.internal.send(MeshInternal::Candidates(offers));
                }
                Ok(SignalServerMessage::Error { message }) => {
                    emit(
                        &ctx.events,
                        TransportEvent::Error {
                            path: PathKind::Direct,
                            message,
                        },
                    );
                }
                Err(e) => log::warn!("Failed to parse rendezvous frame: {}", e),
            },
            Ok(Message::Close(_)) => return "closed by rendezvous".into(),
            Ok(_) => {}
            Err(e) => return e.to_string(),
        }
    }
    "rendezvous stream ended".into()
}

// --- Links ---

async fn accept_loop(listener: TcpListener, ctx: LinkContext) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let handshake = async {
                        let mut socket = accept_async(stream).await.map_err(|e| e.to_string())?;
                        let hello = read_hello(&mut socket).await?;
                        if hello.topic != ctx.topic {
                            return Err(format!("peer {} is in topic {}", hello.peer_id, hello.topic));
                        }
                        if hello.peer_id == ctx.peer_id {
                            return Err("link to self".to_string());
                        }
                        send_hello(&mut socket, &ctx, None).await?;
                        Ok::<_, String>((socket, hello))
                    };
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
                        Ok(Ok((socket, hello))) => {
                            let link_id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
                            let rank = LinkRank::new(&hello.peer_id, &ctx.peer_id, hello.link.unwrap_or(0));
                            let offer = hello
                                .url
                                .filter(|url| parse_ws_url(url).is_ok())
                                .map(|url| PeerOffer {
                                    peer_id: hello.peer_id.clone(),
                                    url,
                                });
                            start_link(socket, hello.peer_id, link_id, rank, offer, &ctx);
                        }
                        Ok(Err(reason)) => log::warn!("Rejected link from {}: {}", addr, reason),
                        Err(_) => log::warn!("Link handshake from {} timed out", addr),
                    }
                });
            }
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Dial a peer the rendezvous listed.
async fn dial(offer: PeerOffer, ctx: LinkContext) {
    if let Err(reason) = try_dial(&offer, &ctx).await {
        log::warn!("Could not link to {}: {}", offer.peer_id, reason);
        emit(
            &ctx.events,
            TransportEvent::Error {
                path: PathKind::Direct,
                message: format!("Could not reach peer {}", offer.peer_id),
            },
        );
    }
}

/// Redial a dropped link with backoff. Stops once `cancel` is set, which
/// happens when another link to the peer opens.
async fn redial(offer: PeerOffer, ctx: LinkContext, cancel: Arc<AtomicBool>) {
    let mut backoff = RECONNECT_INITIAL_BACKOFF;
    for attempt in 1..=REDIAL_ATTEMPTS {
        tokio::time::sleep(backoff).await;
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        match try_dial(&offer, &ctx).await {
            Ok(()) => return,
            Err(reason) => log::debug!(
                "Redial {}/{} to {} failed: {}",
                attempt,
                REDIAL_ATTEMPTS,
                offer.peer_id,
                reason
            ),
        }
        backoff = next_backoff(backoff);
    }
    log::warn!("Gave up relinking to {}", offer.peer_id);
    let _ = ctx.internal.send(MeshInternal::RedialGaveUp {
        peer: offer.peer_id,
        cancel,
    });
}

async fn try_dial(offer: &PeerOffer, ctx: &LinkContext) -> std::result::Result<(), String> {
    let link_id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
    let handshake = async {
        let (mut socket, _) = connect_async(offer.url.as_str()).await.map_err(|e| e.to_string())?;
        send_hello(&mut socket, ctx, Some(link_id)).await?;
        let hello = read_hello(&mut socket).await?;
        if hello.peer_id != offer.peer_id || hello.topic != ctx.topic {
            return Err(format!("unexpected hello from {} in {}", hello.peer_id, hello.topic));
        }
        Ok::<_, String>(socket)
    };
    let socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
        .await
        .map_err(|_| "handshake timed out".to_string())??;
    let rank = LinkRank::new(&ctx.peer_id, &offer.peer_id, link_id);
    start_link(socket, offer.peer_id.clone(), link_id, rank, Some(offer.clone()), ctx);
    Ok(())
}

async fn send_hello<S>(
    socket: &mut WebSocketStream<S>,
    ctx: &LinkContext,
    link: Option<u64>,
) -> std::result::Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = LinkHello {
        peer_id: ctx.peer_id.clone(),
        topic: ctx.topic.clone(),
        url: Some(ctx.offer_url.clone()),
        link,
    };
    let json = serde_json::to_string(&hello).map_err(|e| e.to_string())?;
    socket.send(Message::text(json)).await.map_err(|e| e.to_string())
}

async fn read_hello<S>(socket: &mut WebSocketStream<S>) -> std::result::Result<LinkHello, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = socket.next().await {
        match frame.map_err(|e| e.to_string())? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).map_err(|e| e.to_string()),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Err(format!("expected hello, got {:?}", other)),
        }
    }
    Err("closed during handshake".into())
}

fn start_link<S>(
    socket: WebSocketStream<S>,
    peer: PeerId,
    link_id: u64,
    rank: LinkRank,
    offer: Option<PeerOffer>,
    ctx: &LinkContext,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(ctx.outbound_capacity);
    // LinkUp must be queued before the link task can report LinkDown.
    let _ = ctx.internal.send(MeshInternal::LinkUp {
        peer: peer.clone(),
        link_id,
        rank,
        offer,
        outbound: outbound_tx,
    });
    tokio::spawn(run_link(socket, peer, link_id, outbound_rx, ctx.clone()));
}

async fn run_link<S>(
    socket: WebSocketStream<S>,
    peer: PeerId,
    link_id: u64,
    mut outbound: mpsc::Receiver<Bytes>,
    ctx: LinkContext,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    // A link only counts as closed gracefully when a close frame went one way or the other.
    let graceful = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(bytes) => {
                    if let Err(e) = sink.send(Message::binary(bytes)).await {
                        log::debug!("Send to {} failed: {}", peer, e);
                        break false;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break true;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(bytes))) => emit(&ctx.events, TransportEvent::Message {
                    path: PathKind::Direct,
                    bytes,
                }),
                Some(Ok(Message::Text(text))) => emit(&ctx.events, TransportEvent::Message {
                    path: PathKind::Direct,
                    bytes: Bytes::copy_from_slice(text.as_bytes()),
                }),
                Some(Ok(Message::Close(_))) => break true,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Link to {} failed: {}", peer, e);
                    break false;
                }
                None => break false,
            }
        }
    };
    let _ = ctx.internal.send(MeshInternal::LinkDown {
        peer,
        link_id,
        graceful,
    });
}
