//! Persistent per-contact sessions.
//!
//! Claims the local persistent id (regenerating it on an unrecoverable
//! conflict), accepts inbound peer channels, and opens outbound ones on
//! demand. Every session starts with a signed `hello` exchange; verified
//! hellos anchor the channel to a contact by public key, which is also
//! where duplicate-contact migration happens. Messages ride an AES-GCM
//! envelope signed by the sender when a pair key exists, plaintext
//! otherwise.

pub mod queue;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use peerns_signal::{Backoff, Channel, ChannelEvent, ChannelHandle, ClaimHandle, SignalError, Signaling};

use crate::contacts::{ContactRecord, ContactStore, KeyOutcome, MessageStatus, PendingState};
use crate::crypto::SharedKey;
use crate::identity::{identity_fingerprint, verify_signature, Identity};
use crate::types::{now_ms, DiscoveryUuid, PersistentId, HANDSHAKE_TIMEOUT_MS};
use crate::wire::{exchange_signing_bytes, hello_signing_bytes, Frame};

use queue::Outbox;

/// File chunks ride base64 in JSON frames; keep them comfortably small.
const FILE_CHUNK_BYTES: usize = 16 * 1024;

/// Commands the runtime sends to the session manager.
#[derive(Debug)]
pub enum SessionCommand {
    SendText { to: PersistentId, body: String },
    EditMessage { to: PersistentId, id: String, body: String },
    DeleteMessage { to: PersistentId, id: String },
    SendFile { to: PersistentId, name: String, bytes: Vec<u8> },
    /// Open (or re-open) the persistent session to a contact.
    Connect { to: PersistentId },
    /// Start the contact handshake toward a manually entered persistent id.
    AddContact { to: PersistentId },
    /// User decision on an incoming contact request.
    Decide { from: PersistentId, accept: bool },
    SetName { name: String },
    Shutdown,
}

/// Events the session manager surfaces.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The claimed persistent id changed after an unrecoverable conflict.
    PersistentIdChanged { id: PersistentId },
    MessageReceived {
        from: PersistentId,
        id: String,
        ts: u64,
        body: String,
        /// Signature or decryption failure: body is a sentinel.
        flagged: bool,
    },
    MessageStatus {
        peer: PersistentId,
        id: String,
        status: MessageStatus,
    },
    MessageEdited { from: PersistentId, id: String, body: String },
    MessageDeleted { from: PersistentId, id: String },
    ContactRequest {
        from: PersistentId,
        name: String,
        fingerprint: String,
    },
    ContactAdded { peer: PersistentId },
    ContactRejected { peer: PersistentId },
    ContactMigrated { old: PersistentId, new: PersistentId },
    ContactConnected { peer: PersistentId },
    ContactDisconnected { peer: PersistentId },
    /// Retry budget spent; the contact is a candidate for rendezvous.
    ContactUnreachable { peer: PersistentId },
    /// Pair-key derivation failed: traffic with this contact stays
    /// plaintext until usable key material appears.
    CryptoDegraded {
        peer: PersistentId,
        description: String,
    },
    NameUpdated { peer: PersistentId, name: String },
    FileReceived {
        from: PersistentId,
        name: String,
        bytes: Vec<u8>,
    },
    Error { description: String },
}

/// Session-layer knobs, compressed in tests.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub prefix: String,
    pub friendly_name: String,
    pub discovery_uuid: DiscoveryUuid,
    pub persistent_id: PersistentId,
    pub retry_base: Duration,
    pub max_retries: u32,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

impl SessionConfig {
    pub fn new(prefix: &str, friendly_name: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            friendly_name: friendly_name.to_string(),
            discovery_uuid: DiscoveryUuid::generate(),
            persistent_id: PersistentId::generate(prefix),
            retry_base: Duration::from_millis(crate::types::SEND_RETRY_BASE_MS),
            max_retries: crate::types::MAX_CONNECT_RETRIES,
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            dial_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to the running session manager.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn send(&self, cmd: SessionCommand) {
        let _ = self.cmd_tx.send(cmd).await;
    }
}

pub fn spawn(
    signaling: Arc<dyn Signaling>,
    identity: Arc<Identity>,
    store: Arc<Mutex<ContactStore>>,
    config: SessionConfig,
    event_tx: mpsc::Sender<SessionEvent>,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(256);

    let manager = SessionManager {
        signaling,
        identity,
        store,
        event_tx,
        in_tx,
        me: config.persistent_id.clone(),
        name: config.friendly_name.clone(),
        config,
        claim: None,
        channels: HashMap::new(),
        next_channel: 1,
        chan_peer: HashMap::new(),
        peer_chan: HashMap::new(),
        anon_remote: HashMap::new(),
        hello_sent: HashSet::new(),
        hello_ok: HashSet::new(),
        outboxes: HashMap::new(),
        dialing: HashSet::new(),
        pending_in: HashMap::new(),
        files: HashMap::new(),
        timers: HashMap::new(),
        stopped: false,
    };
    tokio::spawn(manager.run(cmd_rx, in_rx));
    SessionHandle { cmd_tx }
}

enum Input {
    Incoming(Channel),
    Dialed {
        to: PersistentId,
        result: Result<Channel, String>,
    },
    Channel { id: u64, event: ChannelEvent },
    Gone { id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum STimer {
    Retry(PersistentId),
    Handshake(PersistentId),
}

struct PendingRequest {
    name: String,
    public_key: String,
    channel: Option<u64>,
}

struct FileBuf {
    name: String,
    chunks: Vec<Option<Vec<u8>>>,
}

struct SessionManager {
    signaling: Arc<dyn Signaling>,
    identity: Arc<Identity>,
    store: Arc<Mutex<ContactStore>>,
    event_tx: mpsc::Sender<SessionEvent>,
    in_tx: mpsc::Sender<Input>,
    me: PersistentId,
    name: String,
    config: SessionConfig,
    claim: Option<ClaimHandle>,
    channels: HashMap<u64, ChannelHandle>,
    next_channel: u64,
    chan_peer: HashMap<u64, PersistentId>,
    peer_chan: HashMap<PersistentId, u64>,
    /// Inbound channels not yet anchored to a contact: their remote label.
    anon_remote: HashMap<u64, Option<PersistentId>>,
    hello_sent: HashSet<u64>,
    hello_ok: HashSet<PersistentId>,
    outboxes: HashMap<PersistentId, Outbox>,
    dialing: HashSet<PersistentId>,
    pending_in: HashMap<PersistentId, PendingRequest>,
    files: HashMap<String, FileBuf>,
    timers: HashMap<STimer, Instant>,
    stopped: bool,
}

impl SessionManager {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut in_rx: mpsc::Receiver<Input>,
    ) {
        self.claim_persistent_id().await;

        while !self.stopped {
            let next_timer = self
                .timers
                .iter()
                .min_by_key(|(_, deadline)| **deadline)
                .map(|(timer, deadline)| (timer.clone(), *deadline));

            tokio::select! {
                Some(input) = in_rx.recv() => self.handle_input(input).await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => self.stopped = true,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                timer = fire_at(next_timer) => {
                    self.timers.remove(&timer);
                    self.handle_timer(timer).await;
                }
            }
        }
        self.claim = None;
    }

    /// Claim our persistent id, regenerating it while the service reports
    /// the name as taken by someone else.
    async fn claim_persistent_id(&mut self) {
        let mut backoff = Backoff::new();
        loop {
            match self.signaling.claim(&self.me.endpoint()).await {
                Ok(claimed) => {
                    self.signaling.set_label(&self.me.endpoint());
                    let (handle, mut incoming) = claimed.split();
                    self.claim = Some(handle);
                    let in_tx = self.in_tx.clone();
                    tokio::spawn(async move {
                        while let Some(channel) = incoming.recv().await {
                            if in_tx.send(Input::Incoming(channel)).await.is_err() {
                                break;
                            }
                        }
                    });
                    return;
                }
                Err(SignalError::IdTaken(_)) => {
                    let fresh = PersistentId::generate(self.me.prefix());
                    warn!(old = %self.me, new = %fresh, "persistent id taken; regenerating");
                    self.me = fresh.clone();
                    self.emit(SessionEvent::PersistentIdChanged { id: fresh }).await;
                }
                Err(e) => {
                    self.emit(SessionEvent::Error {
                        description: format!("persistent claim failed: {e}"),
                    })
                    .await;
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    // ── Commands ───────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SendText { to, body } => {
                let id = uuid::Uuid::new_v4().to_string();
                let ts = now_ms();
                {
                    let mut store = self.store.lock().expect("contact store lock");
                    store.push_message(
                        &to,
                        crate::contacts::ChatMessage {
                            id: id.clone(),
                            ts,
                            outgoing: true,
                            body: body.clone(),
                            status: MessageStatus::Waiting,
                            edited: false,
                            deleted: false,
                        },
                    );
                }
                self.emit(SessionEvent::MessageStatus {
                    peer: to.clone(),
                    id: id.clone(),
                    status: MessageStatus::Waiting,
                })
                .await;
                let frame = self.message_frame(&to, &id, ts, &body, MessageShape::Message);
                self.deliver_or_queue(to, frame, Some(id)).await;
            }
            SessionCommand::EditMessage { to, id, body } => {
                let applied = {
                    let mut store = self.store.lock().expect("contact store lock");
                    store.apply_edit(&to, &id, &body)
                };
                if applied {
                    let frame = self.message_frame(&to, &id, now_ms(), &body, MessageShape::Edit);
                    self.deliver_or_queue(to, frame, None).await;
                }
            }
            SessionCommand::DeleteMessage { to, id } => {
                let applied = {
                    let mut store = self.store.lock().expect("contact store lock");
                    store.apply_delete(&to, &id)
                };
                if applied {
                    self.deliver_or_queue(to, Frame::MessageDelete { id }, None).await;
                }
            }
            SessionCommand::SendFile { to, name, bytes } => {
                let tid = uuid::Uuid::new_v4().to_string();
                let chunks: Vec<&[u8]> = bytes.chunks(FILE_CHUNK_BYTES).collect();
                self.deliver_or_queue(
                    to.clone(),
                    Frame::FileStart {
                        tid: tid.clone(),
                        name,
                        size: bytes.len() as u64,
                        total: chunks.len() as u32,
                    },
                    None,
                )
                .await;
                for (index, chunk) in chunks.iter().enumerate() {
                    self.deliver_or_queue(
                        to.clone(),
                        Frame::FileChunk {
                            tid: tid.clone(),
                            index: index as u32,
                            chunk: B64.encode(chunk),
                        },
                        None,
                    )
                    .await;
                }
                self.deliver_or_queue(to, Frame::FileEnd { tid }, None).await;
            }
            SessionCommand::Connect { to } => self.ensure_connect(to),
            SessionCommand::AddContact { to } => {
                {
                    let mut store = self.store.lock().expect("contact store lock");
                    if store.get(&to).is_none() {
                        let mut rec = ContactRecord::new("", DiscoveryUuid::generate());
                        rec.pending = PendingState::Outgoing;
                        store.put(to.clone(), rec);
                    }
                }
                self.ensure_connect(to);
            }
            SessionCommand::Decide { from, accept } => self.decide(from, accept).await,
            SessionCommand::SetName { name } => {
                self.name = name.clone();
                let connected: Vec<u64> = self
                    .hello_ok
                    .iter()
                    .filter_map(|pid| self.peer_chan.get(pid).copied())
                    .collect();
                for ch in connected {
                    self.send_on(ch, &Frame::NameUpdate { name: name.clone() }).await;
                }
            }
            SessionCommand::Shutdown => self.stopped = true,
        }
    }

    async fn decide(&mut self, from: PersistentId, accept: bool) {
        self.timers.remove(&STimer::Handshake(from.clone()));
        let Some(pending) = self.pending_in.remove(&from) else {
            return;
        };
        if !accept {
            if let Some(ch) = pending.channel {
                self.send_on(ch, &Frame::Rejected {}).await;
                self.close_channel(ch);
            }
            self.emit(SessionEvent::ContactRejected { peer: from }).await;
            return;
        }

        {
            let mut store = self.store.lock().expect("contact store lock");
            let mut rec = ContactRecord::new(pending.name.clone(), DiscoveryUuid::generate());
            rec.public_key = Some(pending.public_key.clone());
            store.put(from.clone(), rec);
        }
        self.derive_pair_key(&from, &pending.public_key).await;

        if let Some(ch) = pending.channel {
            self.send_on(
                ch,
                &Frame::Accepted {
                    persistent_id: self.me.to_string(),
                    discovery_uuid: self.config.discovery_uuid.to_string(),
                },
            )
            .await;
            // The channel is now a live session with this contact.
            self.bind_channel(ch, from.clone()).await;
        }
        self.emit(SessionEvent::ContactAdded { peer: from }).await;
    }

    // ── Inputs ─────────────────────────────────────────────────────────

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Incoming(channel) => {
                let remote = channel
                    .remote()
                    .and_then(|label| label.parse::<PersistentId>().ok());
                let id = self.register_channel(channel);
                self.anon_remote.insert(id, remote);
            }
            Input::Dialed { to, result } => {
                self.dialing.remove(&to);
                match result {
                    Ok(channel) => {
                        let id = self.register_channel(channel);
                        self.chan_peer.insert(id, to.clone());
                        self.peer_chan.insert(to.clone(), id);

                        // An outgoing handshake opens with `request`;
                        // everything else opens with `hello`.
                        let outgoing_request = {
                            let store = self.store.lock().expect("contact store lock");
                            store
                                .get(&to)
                                .map(|r| r.pending == PendingState::Outgoing)
                                .unwrap_or(false)
                        };
                        let frame = if outgoing_request {
                            self.request_frame()
                        } else {
                            self.hello_frame()
                        };
                        self.hello_sent.insert(id);
                        self.send_on(id, &frame).await;
                    }
                    Err(reason) => {
                        debug!(peer = %to, "session dial failed: {reason}");
                        self.connection_failed(to).await;
                    }
                }
            }
            Input::Channel { id, event } => match event {
                ChannelEvent::Frame(value) => match Frame::parse(&value) {
                    Ok(frame) => self.handle_frame(id, frame).await,
                    Err(e) => debug!("ignoring session frame: {e}"),
                },
                ChannelEvent::Closed => self.channel_closed(id).await,
            },
            Input::Gone { id } => self.channel_closed(id).await,
        }
    }

    async fn handle_timer(&mut self, timer: STimer) {
        match timer {
            STimer::Retry(peer) => {
                let waiting = self
                    .outboxes
                    .get(&peer)
                    .map(|o| !o.is_empty())
                    .unwrap_or(false);
                if waiting && !self.peer_chan.contains_key(&peer) {
                    self.ensure_connect(peer);
                }
            }
            STimer::Handshake(peer) => {
                // No user decision in time: keep the request as an
                // incoming-pending contact with its verified fingerprint.
                let Some(pending) = self.pending_in.remove(&peer) else {
                    return;
                };
                {
                    let mut store = self.store.lock().expect("contact store lock");
                    let mut rec = ContactRecord::new(pending.name, DiscoveryUuid::generate());
                    rec.pending = PendingState::Incoming;
                    rec.pending_fingerprint =
                        Some(identity_fingerprint(&pending.public_key));
                    rec.pending_verified = true;
                    store.put(peer.clone(), rec);
                }
                if let Some(ch) = pending.channel {
                    self.close_channel(ch);
                }
                info!(peer = %peer, "contact request timed out; saved as incoming pending");
            }
        }
    }

    // ── Frames ─────────────────────────────────────────────────────────

    async fn handle_frame(&mut self, ch: u64, frame: Frame) {
        match frame {
            Frame::Hello {
                friendly_name,
                public_key,
                ts,
                signature,
            } => {
                if verify_signature(
                    &public_key,
                    &hello_signing_bytes(&friendly_name, &public_key, ts),
                    &signature,
                )
                .is_err()
                {
                    warn!("hello signature invalid; dropping channel");
                    self.close_channel(ch);
                    return;
                }
                self.accept_hello(ch, friendly_name, public_key).await;
            }
            Frame::Message {
                id,
                ts,
                e2e,
                iv,
                ct,
                sig,
                content,
            } => {
                let Some(peer) = self.chan_peer.get(&ch).cloned() else {
                    return;
                };
                let (body, flagged) =
                    self.open_envelope(&peer, e2e, iv, ct, sig, content);

                let fresh = {
                    let mut store = self.store.lock().expect("contact store lock");
                    let fresh = !store.chat(&peer).iter().any(|m| m.id == id);
                    if fresh {
                        store.push_message(
                            &peer,
                            crate::contacts::ChatMessage {
                                id: id.clone(),
                                ts,
                                outgoing: false,
                                body: body.clone(),
                                status: MessageStatus::Delivered,
                                edited: false,
                                deleted: false,
                            },
                        );
                    }
                    fresh
                };
                // Ack even duplicates so a lost ack cannot wedge the sender.
                self.send_on(ch, &Frame::MessageAck { id: id.clone() }).await;
                if fresh {
                    self.emit(SessionEvent::MessageReceived {
                        from: peer,
                        id,
                        ts,
                        body,
                        flagged,
                    })
                    .await;
                }
            }
            Frame::MessageAck { id } => {
                let Some(peer) = self.chan_peer.get(&ch).cloned() else {
                    return;
                };
                let advanced = {
                    let mut store = self.store.lock().expect("contact store lock");
                    store.mark_status(&peer, &id, MessageStatus::Delivered)
                };
                if advanced {
                    self.emit(SessionEvent::MessageStatus {
                        peer,
                        id,
                        status: MessageStatus::Delivered,
                    })
                    .await;
                }
            }
            Frame::MessageEdit {
                id,
                e2e,
                iv,
                ct,
                sig,
                content,
                ..
            } => {
                let Some(peer) = self.chan_peer.get(&ch).cloned() else {
                    return;
                };
                let (body, flagged) = self.open_envelope(&peer, e2e, iv, ct, sig, content);
                if flagged {
                    return;
                }
                let applied = {
                    let mut store = self.store.lock().expect("contact store lock");
                    store.apply_edit(&peer, &id, &body)
                };
                if applied {
                    self.emit(SessionEvent::MessageEdited { from: peer, id, body }).await;
                }
            }
            Frame::MessageDelete { id } => {
                let Some(peer) = self.chan_peer.get(&ch).cloned() else {
                    return;
                };
                let applied = {
                    let mut store = self.store.lock().expect("contact store lock");
                    store.apply_delete(&peer, &id)
                };
                if applied {
                    self.emit(SessionEvent::MessageDeleted { from: peer, id }).await;
                }
            }
            Frame::NameUpdate { name } => {
                let Some(peer) = self.chan_peer.get(&ch).cloned() else {
                    return;
                };
                {
                    let mut store = self.store.lock().expect("contact store lock");
                    if let Some(rec) = store.get_mut(&peer) {
                        rec.friendly_name = name.clone();
                    }
                }
                self.emit(SessionEvent::NameUpdated { peer, name }).await;
            }
            Frame::Request {
                friendly_name,
                public_key,
                persistent_id,
                ts,
                signature,
            } => {
                if verify_signature(
                    &public_key,
                    &exchange_signing_bytes(&persistent_id, &friendly_name, &public_key, ts),
                    &signature,
                )
                .is_err()
                {
                    warn!("contact request signature invalid; dropping channel");
                    self.close_channel(ch);
                    return;
                }
                let Ok(from) = persistent_id.parse::<PersistentId>() else {
                    self.close_channel(ch);
                    return;
                };
                let fingerprint = identity_fingerprint(&public_key);
                self.pending_in.insert(
                    from.clone(),
                    PendingRequest {
                        name: friendly_name.clone(),
                        public_key,
                        channel: Some(ch),
                    },
                );
                self.timers.insert(
                    STimer::Handshake(from.clone()),
                    Instant::now() + self.config.handshake_timeout,
                );
                self.emit(SessionEvent::ContactRequest {
                    from,
                    name: friendly_name,
                    fingerprint,
                })
                .await;
            }
            Frame::Accepted {
                persistent_id,
                discovery_uuid,
            } => {
                let Some(peer) = self.chan_peer.get(&ch).cloned() else {
                    return;
                };
                if peer.to_string() != persistent_id {
                    debug!("accepted frame names a different persistent id; ignoring");
                }
                {
                    let mut store = self.store.lock().expect("contact store lock");
                    if let Some(rec) = store.get_mut(&peer) {
                        rec.pending = PendingState::None;
                        if let Ok(uuid) = DiscoveryUuid::parse(&discovery_uuid) {
                            rec.discovery_uuid = uuid;
                        }
                    }
                }
                self.send_on(
                    ch,
                    &Frame::Confirm {
                        persistent_id: self.me.to_string(),
                        friendly_name: self.name.clone(),
                        discovery_uuid: self.config.discovery_uuid.to_string(),
                        public_key: self.identity.public_key().to_string(),
                    },
                )
                .await;
                // Follow with hello so both sides anchor keys.
                self.hello_sent.insert(ch);
                let hello = self.hello_frame();
                self.send_on(ch, &hello).await;
                self.emit(SessionEvent::ContactAdded { peer }).await;
            }
            Frame::Confirm {
                persistent_id,
                friendly_name,
                discovery_uuid,
                public_key,
            } => {
                let Ok(from) = persistent_id.parse::<PersistentId>() else {
                    return;
                };
                {
                    let mut store = self.store.lock().expect("contact store lock");
                    if let Some(rec) = store.get_mut(&from) {
                        rec.friendly_name = friendly_name;
                        if let Ok(uuid) = DiscoveryUuid::parse(&discovery_uuid) {
                            rec.discovery_uuid = uuid;
                        }
                        rec.pending = PendingState::None;
                    }
                    store.record_public_key(&from, &public_key);
                }
                self.derive_pair_key(&from, &public_key).await;
            }
            Frame::Rejected {} => {
                let Some(peer) = self.chan_peer.get(&ch).cloned() else {
                    return;
                };
                {
                    let mut store = self.store.lock().expect("contact store lock");
                    if store
                        .get(&peer)
                        .map(|r| r.pending == PendingState::Outgoing && r.public_key.is_none())
                        .unwrap_or(false)
                    {
                        store.delete(&peer);
                    }
                }
                self.close_channel(ch);
                self.emit(SessionEvent::ContactRejected { peer }).await;
            }
            Frame::FileStart { tid, name, total, .. } => {
                self.files.insert(
                    tid,
                    FileBuf {
                        name,
                        chunks: vec![None; total as usize],
                    },
                );
            }
            Frame::FileChunk { tid, index, chunk } => {
                if let (Some(buf), Ok(bytes)) = (self.files.get_mut(&tid), B64.decode(&chunk)) {
                    if let Some(slot) = buf.chunks.get_mut(index as usize) {
                        *slot = Some(bytes);
                    }
                }
            }
            Frame::FileEnd { tid } => {
                let Some(peer) = self.chan_peer.get(&ch).cloned() else {
                    self.files.remove(&tid);
                    return;
                };
                let Some(buf) = self.files.remove(&tid) else {
                    return;
                };
                if buf.chunks.iter().all(Option::is_some) {
                    let bytes: Vec<u8> = buf.chunks.into_iter().flatten().flatten().collect();
                    self.send_on(ch, &Frame::FileAck { tid }).await;
                    self.emit(SessionEvent::FileReceived {
                        from: peer,
                        name: buf.name,
                        bytes,
                    })
                    .await;
                } else {
                    debug!(%tid, "file transfer incomplete; dropping");
                }
            }
            Frame::FileAck { .. } | Frame::Pong {} => {}
            Frame::Ping {} => {
                self.send_on(ch, &Frame::Pong {}).await;
            }
            other => {
                debug!("unexpected frame on session channel: {other:?}");
            }
        }
    }

    /// A verified hello anchors the channel to a contact by public key and
    /// is where persistent-id migration happens.
    async fn accept_hello(&mut self, ch: u64, friendly_name: String, public_key: String) {
        // Who is on the other end? Outbound channels know already; inbound
        // channels carry the dialer's label from the signaling service.
        let pid = self
            .chan_peer
            .get(&ch)
            .cloned()
            .or_else(|| self.anon_remote.get(&ch).cloned().flatten());
        let Some(pid) = pid else {
            debug!("hello on unidentifiable channel; dropping");
            self.close_channel(ch);
            return;
        };

        let (migrated, known, key_outcome) = {
            let mut store = self.store.lock().expect("contact store lock");
            let migrated = store
                .find_by_public_key(&public_key, Some(&pid))
                .and_then(|old| store.migrate(&old, pid.clone()));
            let known = store.get(&pid).is_some();
            let key_outcome = if known {
                store.record_public_key(&pid, &public_key)
            } else {
                KeyOutcome::Mismatch
            };
            if known {
                if let Some(rec) = store.get_mut(&pid) {
                    rec.friendly_name = friendly_name.clone();
                    rec.last_seen = now_ms();
                }
            }
            (migrated, known, key_outcome)
        };

        if let Some(crate::contacts::ContactEvent::Migrated { old, new }) = migrated {
            info!(%old, %new, "contact migrated to fresh persistent id");
            self.rekey_peer_state(&old, &new);
            self.emit(SessionEvent::ContactMigrated { old, new }).await;
        }

        if !known {
            debug!(peer = %pid, "hello from unknown peer; dropping channel");
            self.close_channel(ch);
            return;
        }
        if key_outcome == KeyOutcome::Mismatch {
            warn!(peer = %pid, "hello public key contradicts the recorded one; dropping");
            self.close_channel(ch);
            return;
        }
        self.derive_pair_key(&pid, &public_key).await;

        // Anchor the channel and answer inbound hellos with our own.
        self.anon_remote.remove(&ch);
        self.chan_peer.insert(ch, pid.clone());
        self.peer_chan.insert(pid.clone(), ch);
        if !self.hello_sent.contains(&ch) {
            self.hello_sent.insert(ch);
            let hello = self.hello_frame();
            self.send_on(ch, &hello).await;
        }

        let newly = self.hello_ok.insert(pid.clone());
        self.outboxes.entry(pid.clone()).or_insert_with(|| {
            Outbox::with_retry(self.config.retry_base, self.config.max_retries)
        });
        if let Some(outbox) = self.outboxes.get_mut(&pid) {
            outbox.reset_failures();
        }
        if newly {
            self.emit(SessionEvent::ContactConnected { peer: pid.clone() }).await;
        }
        self.drain_outbox(pid).await;
    }

    // ── Envelope helpers ───────────────────────────────────────────────

    fn message_frame(
        &self,
        to: &PersistentId,
        id: &str,
        ts: u64,
        body: &str,
        shape: MessageShape,
    ) -> Frame {
        let store = self.store.lock().expect("contact store lock");
        let sealed = store.shared_key(to).map(|key| {
            let (iv, ct) = key
                .encrypt(body.as_bytes())
                .expect("AES-GCM encryption with a derived key");
            let raw_ct = B64.decode(&ct).expect("just encoded");
            let sig = self.identity.sign(&raw_ct);
            (iv, ct, sig)
        });
        match (sealed, shape) {
            (Some((iv, ct, sig)), MessageShape::Message) => Frame::Message {
                id: id.to_string(),
                ts,
                e2e: Some(true),
                iv: Some(iv),
                ct: Some(ct),
                sig: Some(sig),
                content: None,
            },
            (Some((iv, ct, sig)), MessageShape::Edit) => Frame::MessageEdit {
                id: id.to_string(),
                ts,
                e2e: Some(true),
                iv: Some(iv),
                ct: Some(ct),
                sig: Some(sig),
                content: None,
            },
            (None, MessageShape::Message) => Frame::Message {
                id: id.to_string(),
                ts,
                e2e: None,
                iv: None,
                ct: None,
                sig: None,
                content: Some(body.to_string()),
            },
            (None, MessageShape::Edit) => Frame::MessageEdit {
                id: id.to_string(),
                ts,
                e2e: None,
                iv: None,
                ct: None,
                sig: None,
                content: Some(body.to_string()),
            },
        }
    }

    /// Decrypt and verify an inbound envelope. Failures yield the sentinel
    /// body and a flag; the channel stays up either way.
    fn open_envelope(
        &self,
        peer: &PersistentId,
        e2e: Option<bool>,
        iv: Option<String>,
        ct: Option<String>,
        sig: Option<String>,
        content: Option<String>,
    ) -> (String, bool) {
        const SENTINEL: &str = "⚠ unverified message";

        if e2e != Some(true) {
            return (content.unwrap_or_default(), false);
        }
        let (Some(iv), Some(ct), Some(sig)) = (iv, ct, sig) else {
            warn!(peer = %peer, "e2e message missing envelope fields");
            return (SENTINEL.to_string(), true);
        };

        let store = self.store.lock().expect("contact store lock");
        let Some(key) = store.shared_key(peer) else {
            warn!(peer = %peer, "e2e message but no pair key");
            return (SENTINEL.to_string(), true);
        };
        let Some(peer_pk) = store.get(peer).and_then(|r| r.public_key.clone()) else {
            return (SENTINEL.to_string(), true);
        };

        // Signature first: authorship must hold even if decryption would.
        let raw_ct = match B64.decode(&ct) {
            Ok(raw) => raw,
            Err(_) => return (SENTINEL.to_string(), true),
        };
        if verify_signature(&peer_pk, &raw_ct, &sig).is_err() {
            warn!(peer = %peer, "message signature invalid; storing sentinel");
            return (SENTINEL.to_string(), true);
        }
        match key.decrypt(&iv, &ct) {
            Ok(plain) => match String::from_utf8(plain) {
                Ok(body) => (body, false),
                Err(_) => (SENTINEL.to_string(), true),
            },
            Err(_) => {
                warn!(peer = %peer, "message decryption failed; storing sentinel");
                (SENTINEL.to_string(), true)
            }
        }
    }

    async fn derive_pair_key(&mut self, peer: &PersistentId, public_key: &str) {
        let cached = {
            let store = self.store.lock().expect("contact store lock");
            store.shared_key(peer).is_some()
        };
        if cached {
            return;
        }
        match SharedKey::derive(&self.identity, public_key) {
            Ok(key) => {
                let mut store = self.store.lock().expect("contact store lock");
                store.cache_shared_key(peer.clone(), key);
            }
            Err(e) => {
                // Degraded mode: messages to this contact stay plaintext.
                self.emit(SessionEvent::CryptoDegraded {
                    peer: peer.clone(),
                    description: e.to_string(),
                })
                .await;
            }
        }
    }

    // ── Delivery ───────────────────────────────────────────────────────

    async fn deliver_or_queue(&mut self, to: PersistentId, frame: Frame, msg_id: Option<String>) {
        if self.hello_ok.contains(&to) {
            if let Some(&ch) = self.peer_chan.get(&to) {
                if self.send_on(ch, &frame).await {
                    if let Some(id) = msg_id {
                        self.mark_sent(&to, &id).await;
                    }
                    return;
                }
            }
        }
        self.outboxes
            .entry(to.clone())
            .or_insert_with(|| Outbox::with_retry(self.config.retry_base, self.config.max_retries))
            .push(frame, msg_id);
        self.ensure_connect(to);
    }

    async fn drain_outbox(&mut self, peer: PersistentId) {
        let Some(outbox) = self.outboxes.get_mut(&peer) else {
            return;
        };
        let items = outbox.drain();
        for item in items {
            if let Some(&ch) = self.peer_chan.get(&peer) {
                if self.send_on(ch, &item.frame).await {
                    if let Some(id) = item.msg_id {
                        self.mark_sent(&peer, &id).await;
                    }
                    continue;
                }
            }
            // Channel died mid-drain; re-queue and let the close path retry.
            let retry_base = self.config.retry_base;
            let max_retries = self.config.max_retries;
            self.outboxes
                .entry(peer.clone())
                .or_insert_with(|| Outbox::with_retry(retry_base, max_retries))
                .push(item.frame, item.msg_id);
            break;
        }
    }

    async fn mark_sent(&mut self, peer: &PersistentId, id: &str) {
        let advanced = {
            let mut store = self.store.lock().expect("contact store lock");
            store.mark_status(peer, id, MessageStatus::Sent)
        };
        if advanced {
            self.emit(SessionEvent::MessageStatus {
                peer: peer.clone(),
                id: id.to_string(),
                status: MessageStatus::Sent,
            })
            .await;
        }
    }

    fn ensure_connect(&mut self, to: PersistentId) {
        if self.peer_chan.contains_key(&to) || self.dialing.contains(&to) {
            return;
        }
        self.dialing.insert(to.clone());
        let signaling = self.signaling.clone();
        let in_tx = self.in_tx.clone();
        let endpoint = to.endpoint();
        let cap = self.config.dial_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(cap, signaling.connect(&endpoint)).await {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("dial timed out".to_string()),
            };
            let _ = in_tx.send(Input::Dialed { to, result }).await;
        });
    }

    async fn connection_failed(&mut self, peer: PersistentId) {
        let outbox = self
            .outboxes
            .entry(peer.clone())
            .or_insert_with(|| Outbox::with_retry(self.config.retry_base, self.config.max_retries));
        match outbox.record_failure() {
            Some(delay) => {
                self.timers
                    .insert(STimer::Retry(peer), Instant::now() + delay);
            }
            None => {
                let failed_ids = outbox.message_ids();
                outbox.drain();
                outbox.reset_failures();
                {
                    let mut store = self.store.lock().expect("contact store lock");
                    for id in &failed_ids {
                        store.mark_status(&peer, id, MessageStatus::Failed);
                    }
                }
                for id in failed_ids {
                    self.emit(SessionEvent::MessageStatus {
                        peer: peer.clone(),
                        id,
                        status: MessageStatus::Failed,
                    })
                    .await;
                }
                self.emit(SessionEvent::ContactUnreachable { peer }).await;
            }
        }
    }

    async fn channel_closed(&mut self, ch: u64) {
        self.channels.remove(&ch);
        self.anon_remote.remove(&ch);
        self.hello_sent.remove(&ch);
        let Some(peer) = self.chan_peer.remove(&ch) else {
            return;
        };
        if self.peer_chan.get(&peer) == Some(&ch) {
            self.peer_chan.remove(&peer);
        }
        if self.hello_ok.remove(&peer) {
            self.emit(SessionEvent::ContactDisconnected { peer: peer.clone() }).await;
        }
        let waiting = self
            .outboxes
            .get(&peer)
            .map(|o| !o.is_empty())
            .unwrap_or(false);
        if waiting {
            self.connection_failed(peer).await;
        }
    }

    /// Move transient session state when a contact's persistent id changes.
    fn rekey_peer_state(&mut self, old: &PersistentId, new: &PersistentId) {
        if let Some(outbox) = self.outboxes.remove(old) {
            self.outboxes.insert(new.clone(), outbox);
        }
        if let Some(ch) = self.peer_chan.remove(old) {
            self.peer_chan.insert(new.clone(), ch);
            self.chan_peer.insert(ch, new.clone());
        }
        if self.hello_ok.remove(old) {
            self.hello_ok.insert(new.clone());
        }
        self.timers.remove(&STimer::Retry(old.clone()));
    }

    async fn bind_channel(&mut self, ch: u64, peer: PersistentId) {
        self.anon_remote.remove(&ch);
        self.chan_peer.insert(ch, peer.clone());
        self.peer_chan.insert(peer.clone(), ch);
        if !self.hello_sent.contains(&ch) {
            self.hello_sent.insert(ch);
            let hello = self.hello_frame();
            self.send_on(ch, &hello).await;
        }
    }

    // ── Plumbing ───────────────────────────────────────────────────────

    fn hello_frame(&self) -> Frame {
        let ts = now_ms();
        let public_key = self.identity.public_key().to_string();
        let signature = self
            .identity
            .sign(&hello_signing_bytes(&self.name, &public_key, ts));
        Frame::Hello {
            friendly_name: self.name.clone(),
            public_key,
            ts,
            signature,
        }
    }

    fn request_frame(&self) -> Frame {
        let ts = now_ms();
        let public_key = self.identity.public_key().to_string();
        let persistent_id = self.me.to_string();
        let signature = self.identity.sign(&exchange_signing_bytes(
            &persistent_id,
            &self.name,
            &public_key,
            ts,
        ));
        Frame::Request {
            friendly_name: self.name.clone(),
            public_key,
            persistent_id,
            ts,
            signature,
        }
    }

    fn register_channel(&mut self, channel: Channel) -> u64 {
        let id = self.next_channel;
        self.next_channel += 1;
        let (handle, mut events) = channel.split();
        self.channels.insert(id, handle);

        let in_tx = self.in_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(event @ ChannelEvent::Frame(_)) => {
                        if in_tx.send(Input::Channel { id, event }).await.is_err() {
                            return;
                        }
                    }
                    Some(ChannelEvent::Closed) | None => {
                        let _ = in_tx.send(Input::Gone { id }).await;
                        return;
                    }
                }
            }
        });
        id
    }

    async fn send_on(&mut self, ch: u64, frame: &Frame) -> bool {
        match self.channels.get(&ch) {
            Some(handle) => handle.send(&frame.to_value()).await.is_ok(),
            None => false,
        }
    }

    fn close_channel(&mut self, ch: u64) {
        if let Some(handle) = self.channels.remove(&ch) {
            handle.close();
        }
        self.anon_remote.remove(&ch);
        self.hello_sent.remove(&ch);
        if let Some(peer) = self.chan_peer.remove(&ch) {
            if self.peer_chan.get(&peer) == Some(&ch) {
                self.peer_chan.remove(&peer);
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

#[derive(Clone, Copy)]
enum MessageShape {
    Message,
    Edit,
}

/// Wait for the given timer deadline; pend forever when none is armed.
async fn fire_at(next: Option<(STimer, Instant)>) -> STimer {
    match next {
        Some((timer, deadline)) => {
            tokio::time::sleep_until(deadline).await;
            timer
        }
        None => std::future::pending().await,
    }
}
