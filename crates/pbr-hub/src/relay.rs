use crate::Config;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use pbr_channel::{
    ContextId, DeliveryAck, DeliveryReceipt, ReplyReceiver, Transport, TransportError,
};
use pbr_core::channel_ipc::{
    encode_frame, AckPayload, ChannelMessage, DecodeReport, ErrorPayload, FocusPayload,
    FrameError, HelloPayload, HubEnvelope, HubMsg, NdjsonFrameDecoder, PeerRole,
    ResponsePayload, DEFAULT_MAX_FRAME_BYTES,
};
use pbr_core::schema::{ChannelSchema, PlaybackSchema};
use pbr_core::PageIdentity;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const HUB_SENDER_ID: &str = "pbr-hub";
pub const MAX_ENVELOPE_BYTES: usize = DEFAULT_MAX_FRAME_BYTES;
const OUTBOUND_QUEUE: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub href: Option<String>,
    pub hostname: Option<String>,
}

/// One connected page agent or UI surface.
pub struct Peer {
    id: ContextId,
    peer_id: String,
    role: PeerRole,
    page: Mutex<PageInfo>,
    sender: mpsc::Sender<Message>,
    last_seen: Mutex<Instant>,
}

impl Peer {
    pub fn new(
        id: ContextId,
        peer_id: impl Into<String>,
        role: PeerRole,
        page: PageInfo,
        sender: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            peer_id: peer_id.into(),
            role,
            page: Mutex::new(page),
            sender,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn page(&self) -> PageInfo {
        lock(&self.page).clone()
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *lock(&self.last_seen)
    }

    /// Queues one envelope for the writer task. Fails when the queue is full
    /// or the connection is gone.
    fn send_envelope(&self, envelope: &HubEnvelope) -> bool {
        let text = match encode_frame(envelope, MAX_ENVELOPE_BYTES)
            .map_err(|err| err.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|err| err.to_string()))
        {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", peer = %self.id, error = %err);
                return false;
            }
        };
        self.sender.try_send(Message::Text(text)).is_ok()
    }

    fn close(&self, reason: &str) {
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: reason.to_string().into(),
        })));
    }
}

struct PendingRelay {
    target: ContextId,
    reply: oneshot::Sender<Value>,
}

/// Connected peers, page focus and in-flight requests.
///
/// Surfaces reach pages through the [`Transport`] implementation, the same
/// seam an in-process runtime offers, so a typed `Requester` can drive the
/// hub directly.
pub struct HubState {
    config: Config,
    conn_counter: AtomicU64,
    peers: RwLock<HashMap<ContextId, Arc<Peer>>>,
    active: Mutex<Option<ContextId>>,
    pending: Mutex<HashMap<String, PendingRelay>>,
}

impl HubState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            peers: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_context_id(&self) -> ContextId {
        ContextId(self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn peer(&self, id: ContextId) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn snapshot_pages(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|peer| peer.role == PeerRole::Page)
            .cloned()
            .collect()
    }

    fn snapshot_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn register(&self, peer: Arc<Peer>, active: bool) {
        self.peers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(peer.id, peer.clone());
        info!(
            event = "peer_connected",
            peer = %peer.id,
            peer_id = %peer.peer_id,
            role = %peer.role
        );
        if peer.role == PeerRole::Page && active {
            self.set_focus(&peer, true);
        }
    }

    pub fn remove_peer(&self, id: ContextId, reason: &str) {
        let Some(peer) = self
            .peers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
        else {
            return;
        };
        peer.close(reason);
        {
            let mut active = lock(&self.active);
            if *active == Some(id) {
                *active = None;
            }
        }
        // Dropping the reply senders tells waiting surfaces nobody answered.
        let mut abandoned = 0;
        lock(&self.pending).retain(|_, pending| {
            let keep = pending.target != id;
            if !keep {
                abandoned += 1;
            }
            keep
        });
        info!(
            event = "peer_disconnected",
            peer = %id,
            peer_id = %peer.peer_id,
            role = %peer.role,
            reason = reason,
            abandoned
        );
    }

    fn set_focus(&self, peer: &Peer, focused: bool) {
        let mut active = lock(&self.active);
        if focused {
            *active = Some(peer.id);
        } else if *active == Some(peer.id) {
            *active = None;
        } else {
            return;
        }
        let page = peer.page();
        info!(
            event = "focus_change",
            peer = %peer.id,
            active = focused,
            href = page.href.as_deref().unwrap_or("")
        );
    }

    pub async fn handle_envelope(self: &Arc<Self>, peer: &Arc<Peer>, envelope: HubEnvelope) {
        let request_id = envelope.request_id;
        match (peer.role, envelope.msg) {
            (PeerRole::Page, HubMsg::Focus(focus)) => self.apply_focus(peer, focus),
            (PeerRole::Page, HubMsg::Response(response)) => {
                self.complete(peer, request_id.as_deref(), response.data)
            }
            (PeerRole::Surface, HubMsg::Request(message)) => {
                let hub = self.clone();
                let surface = peer.clone();
                tokio::spawn(async move { hub.relay_request(&surface, request_id, message).await });
            }
            (PeerRole::Surface, HubMsg::Broadcast(message)) => {
                self.relay_broadcast(peer, request_id, message).await
            }
            (_, HubMsg::Error(error)) => {
                warn!(
                    event = "peer_error",
                    peer = %peer.id,
                    code = %error.code,
                    message = %error.message
                );
                if let Some(request_id) = request_id.as_deref() {
                    self.abandon(peer, request_id);
                }
            }
            (_, HubMsg::Hello(_)) => {
                self.send_error(peer, "unexpected_hello", "unexpected hello", request_id);
                warn!(event = "unexpected_hello", peer = %peer.id);
            }
            (role, _) => {
                self.send_error(
                    peer,
                    "role_violation",
                    "message not allowed for role",
                    request_id,
                );
                warn!(event = "role_violation", peer = %peer.id, role = %role);
            }
        }
    }

    fn apply_focus(&self, peer: &Peer, focus: FocusPayload) {
        if focus.href.is_some() {
            let mut page = lock(&peer.page);
            page.hostname = focus
                .hostname
                .or_else(|| hostname_of(focus.href.as_deref()));
            page.href = focus.href;
        }
        self.set_focus(peer, focus.active);
    }

    fn complete(&self, peer: &Peer, request_id: Option<&str>, data: Option<Value>) {
        let Some(request_id) = request_id else {
            warn!(event = "response_without_request_id", peer = %peer.id);
            return;
        };
        let pending = {
            let mut pending = lock(&self.pending);
            match pending.get(request_id) {
                Some(entry) if entry.target == peer.id => pending.remove(request_id),
                _ => None,
            }
        };
        match pending {
            Some(pending) => {
                let _ = pending.reply.send(data.unwrap_or(Value::Null));
            }
            None => debug!(event = "response_unmatched", peer = %peer.id, request_id),
        }
    }

    fn abandon(&self, peer: &Peer, request_id: &str) {
        let mut pending = lock(&self.pending);
        if pending
            .get(request_id)
            .is_some_and(|entry| entry.target == peer.id)
        {
            pending.remove(request_id);
        }
    }

    /// Drops pending entries whose requester stopped waiting. Returns how
    /// many were dropped.
    pub fn prune_abandoned(&self) -> usize {
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|_, entry| !entry.reply.is_closed());
        let pruned = before - pending.len();
        if pruned > 0 {
            debug!(event = "pending_pruned", pruned);
        }
        pruned
    }

    /// Sends a request to one page and registers the pending reply under a
    /// fresh request id.
    fn deliver(
        &self,
        target: ContextId,
        message: ChannelMessage,
    ) -> Result<(String, ReplyReceiver), TransportError> {
        let peer = self
            .peer(target)
            .filter(|peer| peer.role == PeerRole::Page)
            .ok_or(TransportError::Unreachable(target))?;
        self.prune_abandoned();
        let request_id = uuid::Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), PendingRelay { target, reply });

        let envelope = HubEnvelope::new(
            HUB_SENDER_ID,
            Some(request_id.clone()),
            HubMsg::Request(message),
        );
        if !peer.send_envelope(&envelope) {
            lock(&self.pending).remove(&request_id);
            warn!(event = "send_error", peer = %target);
            return Err(TransportError::Unreachable(target));
        }
        Ok((request_id, rx))
    }

    async fn relay_request(
        &self,
        surface: &Peer,
        request_id: Option<String>,
        message: ChannelMessage,
    ) {
        if !PlaybackSchema::declares(&message.event_name) {
            self.send_error(
                surface,
                "unknown_event",
                format!("unknown event {}", message.event_name),
                request_id,
            );
            return;
        }
        let Some(target) = self.active_context() else {
            self.send_error(surface, "no_active_context", "no active page", request_id);
            return;
        };
        let event_name = message.event_name.clone();
        let (relay_id, reply) = match self.deliver(target, message) {
            Ok(delivered) => delivered,
            Err(err) => {
                self.send_error(surface, "unreachable", err.to_string(), request_id);
                return;
            }
        };
        debug!(event = "relay_request", surface = %surface.id, target = %target, event_name = %event_name);

        match tokio::time::timeout(self.config.request_timeout, reply).await {
            Ok(Ok(data)) => {
                let envelope = HubEnvelope::new(
                    HUB_SENDER_ID,
                    request_id,
                    HubMsg::Response(ResponsePayload { data: Some(data) }),
                );
                if !surface.send_envelope(&envelope) {
                    warn!(event = "send_error", peer = %surface.id);
                }
            }
            Ok(Err(_)) => {
                self.send_error(
                    surface,
                    "no_response",
                    format!("{event_name} was not answered"),
                    request_id,
                );
            }
            Err(_) => {
                lock(&self.pending).remove(&relay_id);
                warn!(event = "relay_timeout", target = %target, event_name = %event_name);
                self.send_error(
                    surface,
                    "timeout",
                    format!("{event_name} timed out"),
                    request_id,
                );
            }
        }
    }

    async fn relay_broadcast(
        &self,
        surface: &Peer,
        request_id: Option<String>,
        message: ChannelMessage,
    ) {
        let delivered = match self.broadcast(message) {
            Ok(receipt) => receipt.await.map(|ack| ack.delivered).unwrap_or(0),
            Err(err) => {
                self.send_error(surface, "broadcast_failed", err.to_string(), request_id);
                return;
            }
        };
        let envelope = HubEnvelope::new(
            HUB_SENDER_ID,
            request_id,
            HubMsg::Ack(AckPayload { delivered }),
        );
        if !surface.send_envelope(&envelope) {
            warn!(event = "send_error", peer = %surface.id);
        }
    }

    fn send_error(
        &self,
        peer: &Peer,
        code: &str,
        message: impl Into<String>,
        request_id: Option<String>,
    ) {
        let envelope = HubEnvelope::new(
            HUB_SENDER_ID,
            request_id,
            HubMsg::Error(ErrorPayload::new(code, message)),
        );
        let _ = peer.send_envelope(&envelope);
    }

    pub fn start_stale_reaper(self: Arc<Self>) {
        let Some(stale_after) = self.config.stale_after() else {
            return;
        };
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_after / 2);
            loop {
                ticker.tick().await;
                hub.reap_stale(stale_after);
                hub.prune_abandoned();
            }
        });
    }

    /// Drops peers not heard from within `stale_after`. Returns how many.
    pub fn reap_stale(&self, stale_after: Duration) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        for peer in self.snapshot_peers() {
            if now.duration_since(peer.last_seen()) > stale_after {
                warn!(event = "stale_close", peer = %peer.id);
                self.remove_peer(peer.id, "stale");
                reaped += 1;
            }
        }
        reaped
    }

    fn start_ping(self: Arc<Self>, peer: Arc<Peer>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if peer.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    hub.remove_peer(peer.id, "ping_failed");
                    return;
                }
            }
        });
    }

    /// Admits a peer from its first transport message, which must open with
    /// a hello. Registers the peer, queues the welcome and hands back the
    /// frames that followed the hello in the same message.
    pub fn admit(
        &self,
        first: DecodeReport<HubEnvelope>,
        sender: mpsc::Sender<Message>,
    ) -> Result<(Arc<Peer>, Vec<HubEnvelope>), &'static str> {
        let mut frames = first.frames.into_iter();
        let hello = frames.next().ok_or("expected_hello")?;
        let (peer, active) = accept_hello(hello, self.next_context_id(), sender)?;
        let peer = Arc::new(peer);
        log_decode_errors(&peer, &first.errors);

        let page = peer.page();
        let welcome = HubEnvelope::new(
            HUB_SENDER_ID,
            None,
            HubMsg::Hello(HelloPayload {
                peer_id: peer.id.to_string(),
                role: peer.role,
                href: page.href,
                hostname: page.hostname,
                active,
            }),
        );
        peer.send_envelope(&welcome);
        self.register(peer.clone(), active);
        Ok((peer, frames.collect()))
    }

    /// Routes decoded frames from one peer in arrival order.
    pub async fn handle_frames(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        frames: impl IntoIterator<Item = HubEnvelope>,
    ) {
        for envelope in frames {
            if !envelope.version.is_supported() {
                self.send_error(
                    peer,
                    "unsupported_version",
                    format!("protocol version {} is not supported", envelope.version.0),
                    envelope.request_id,
                );
                continue;
            }
            self.handle_envelope(peer, envelope).await;
        }
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
            }
        });

        let mut decoder = NdjsonFrameDecoder::<HubEnvelope>::new(MAX_ENVELOPE_BYTES);
        let first = match ws_receiver.next().await {
            Some(Ok(msg)) => message_bytes(msg).map(|data| decode_message(&mut decoder, &data)),
            _ => None,
        };
        let Some(first) = first else {
            warn!(event = "expected_hello", remote = %remote);
            return;
        };
        let (peer, rest) = match self.admit(first, tx.clone()) {
            Ok(admitted) => admitted,
            Err(code) => {
                warn!(event = "hello_rejected", remote = %remote, code);
                return;
            }
        };
        self.clone().start_ping(peer.clone());
        self.handle_frames(&peer, rest).await;

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", peer = %peer.id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "peer_close", peer = %peer.id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    peer.touch();
                    continue;
                }
            };
            peer.touch();
            if self.config.debug {
                debug!(event = "message_received", peer = %peer.id, raw = %String::from_utf8_lossy(&data));
            }
            let report = decode_message(&mut decoder, &data);
            log_decode_errors(&peer, &report.errors);
            self.handle_frames(&peer, report.frames).await;
        }

        self.remove_peer(peer.id, "disconnect");
        drop(peer);
        drop(tx);
        let _ = write_task.await;
    }
}

impl Transport for HubState {
    fn active_context(&self) -> Option<ContextId> {
        *lock(&self.active)
    }

    fn send_to(
        &self,
        target: ContextId,
        message: ChannelMessage,
    ) -> Result<ReplyReceiver, TransportError> {
        self.deliver(target, message).map(|(_, rx)| rx)
    }

    fn broadcast(&self, message: ChannelMessage) -> Result<DeliveryReceipt, TransportError> {
        let envelope = HubEnvelope::new(HUB_SENDER_ID, None, HubMsg::Broadcast(message));
        let mut delivered = 0;
        for page in self.snapshot_pages() {
            if page.send_envelope(&envelope) {
                delivered += 1;
            } else {
                warn!(event = "send_error", peer = %page.id);
            }
        }
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(DeliveryAck { delivered });
        Ok(rx)
    }
}

fn hostname_of(href: Option<&str>) -> Option<String> {
    href.and_then(|href| PageIdentity::from_href(href).ok())
        .map(|identity| identity.hostname)
}

/// Validates a hello and builds the peer it announces.
pub fn accept_hello(
    envelope: HubEnvelope,
    id: ContextId,
    sender: mpsc::Sender<Message>,
) -> Result<(Peer, bool), &'static str> {
    if !envelope.version.is_supported() {
        return Err("unsupported_version");
    }
    let HubMsg::Hello(hello) = envelope.msg else {
        return Err("expected_hello");
    };
    if hello.peer_id.trim().is_empty() {
        return Err("missing_peer_id");
    }
    if hello.peer_id != envelope.sender_id {
        return Err("peer_id_mismatch");
    }
    let page = match hello.role {
        PeerRole::Page => {
            let hostname = hello
                .hostname
                .clone()
                .or_else(|| hostname_of(hello.href.as_deref()));
            if hello.href.is_none() || hostname.is_none() {
                return Err("missing_page_identity");
            }
            PageInfo {
                href: hello.href,
                hostname,
            }
        }
        PeerRole::Surface => PageInfo::default(),
    };
    let active = hello.role == PeerRole::Page && hello.active;
    Ok((Peer::new(id, hello.peer_id, hello.role, page, sender), active))
}

fn decode_message(
    decoder: &mut NdjsonFrameDecoder<HubEnvelope>,
    data: &[u8],
) -> DecodeReport<HubEnvelope> {
    // One transport message ends every frame it carries.
    let mut report = decoder.push_chunk(data);
    let tail = decoder.finish();
    report.frames.extend(tail.frames);
    report.errors.extend(tail.errors);
    report
}

fn log_decode_errors(peer: &Peer, errors: &[FrameError]) {
    for err in errors {
        warn!(event = "message_invalid", peer = %peer.id, error = %err);
    }
}

fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}
