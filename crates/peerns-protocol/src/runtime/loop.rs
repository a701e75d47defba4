//! The node event loop — thin orchestrator.
//!
//! Multiplexes application commands, session events, namespace engine
//! events, rendezvous timers and exchange results. Protocol logic lives in
//! the state machines; this loop routes between them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use peerns_signal::{Channel, ChannelEvent, Signaling};

use crate::contacts::{ContactEvent, ContactStore};
use crate::crypto::SharedKey;
use crate::identity::{verify_signature, Identity};
use crate::namespace::{
    engine, EngineEvent, EngineHandle, NamespaceConfig, NamespaceKind, NamespaceState, NsEvent,
};
use crate::rendezvous::RendezvousScheduler;
use crate::session::{SessionCommand, SessionEvent, SessionHandle};
use crate::types::{now_ms, DiscoveryUuid, PersistentId};
use crate::wire::{exchange_signing_bytes, Frame};

use super::{NodeCommand, NodeConfig, NodeEvent};

/// Results of detached rendezvous exchange tasks.
enum Internal {
    ExchangeDone {
        public_key: String,
        peer: PersistentId,
        migrated: Option<(PersistentId, PersistentId)>,
    },
    ExchangeFailed {
        description: String,
    },
}

pub(super) struct NodeLoop {
    core: Core,
    cmd_rx: mpsc::Receiver<NodeCommand>,
    session_rx: mpsc::Receiver<SessionEvent>,
    engine_rx: mpsc::Receiver<EngineEvent>,
    internal_rx: mpsc::Receiver<Internal>,
}

impl NodeLoop {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        signaling: Arc<dyn Signaling>,
        identity: Arc<Identity>,
        store: Arc<Mutex<ContactStore>>,
        config: NodeConfig,
        persistent_id: PersistentId,
        discovery_uuid: DiscoveryUuid,
        session: SessionHandle,
        session_rx: mpsc::Receiver<SessionEvent>,
        session_out: mpsc::Sender<SessionEvent>,
        events: mpsc::Sender<NodeEvent>,
        cmd_rx: mpsc::Receiver<NodeCommand>,
    ) -> Self {
        let (engine_tx, engine_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::channel(64);
        Self {
            core: Core {
                signaling,
                identity,
                store,
                config,
                me: persistent_id,
                uuid: discovery_uuid,
                name: String::new(),
                session,
                session_out,
                events,
                engine_tx,
                internal_tx,
                engines: HashMap::new(),
                scheduler: RendezvousScheduler::new(),
                connected: HashSet::new(),
                rvz_deadline: None,
                offline: false,
                stopped: false,
            },
            cmd_rx,
            session_rx,
            engine_rx,
            internal_rx,
        }
    }
}

pub(super) async fn node_loop(nl: NodeLoop) {
    let NodeLoop {
        mut core,
        mut cmd_rx,
        mut session_rx,
        mut engine_rx,
        mut internal_rx,
    } = nl;
    core.name = core.config.friendly_name.clone();

    let mut sweep = tokio::time::interval_at(
        Instant::now() + core.config.rvz_initial,
        core.config.rvz_sweep,
    );

    while !core.stopped {
        let deadline = core.rvz_deadline;
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => core.handle_command(cmd).await,
                None => core.handle_command(NodeCommand::Shutdown).await,
            },
            Some(event) = session_rx.recv() => core.handle_session_event(event).await,
            Some(event) = engine_rx.recv() => core.handle_engine_event(event).await,
            Some(internal) = internal_rx.recv() => core.handle_internal(internal).await,
            _ = sweep.tick() => core.sweep_tick().await,
            _ = fire_at(deadline) => core.deadline_expired().await,
        }
    }
}

struct Core {
    signaling: Arc<dyn Signaling>,
    identity: Arc<Identity>,
    store: Arc<Mutex<ContactStore>>,
    config: NodeConfig,
    me: PersistentId,
    uuid: DiscoveryUuid,
    name: String,
    session: SessionHandle,
    session_out: mpsc::Sender<SessionEvent>,
    events: mpsc::Sender<NodeEvent>,
    engine_tx: mpsc::Sender<EngineEvent>,
    internal_tx: mpsc::Sender<Internal>,
    engines: HashMap<String, EngineHandle>,
    scheduler: RendezvousScheduler,
    connected: HashSet<PersistentId>,
    rvz_deadline: Option<Instant>,
    offline: bool,
    stopped: bool,
}

impl Core {
    // ── Commands ───────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::JoinPublic => match self.config.public_ip {
                Some(ip) => self.spawn_engine(NamespaceKind::Public { ip }),
                None => {
                    let _ = self.events.send(NodeEvent::PublicIpUnavailable).await;
                }
            },
            NodeCommand::JoinCustom { name, advanced } => {
                self.spawn_engine(NamespaceKind::Custom { name, advanced });
            }
            NodeCommand::LeaveNamespace { namespace } => {
                if let Some(handle) = self.engines.remove(&namespace) {
                    handle.shutdown().await;
                }
            }
            NodeCommand::SetName(name) => {
                self.name = name.clone();
                self.session
                    .send(SessionCommand::SetName { name: name.clone() })
                    .await;
                for handle in self.engines.values() {
                    handle.set_name(name.clone()).await;
                }
            }
            NodeCommand::SendMessage { to, body } => {
                self.session.send(SessionCommand::SendText { to, body }).await;
            }
            NodeCommand::EditMessage { to, id, body } => {
                self.session
                    .send(SessionCommand::EditMessage { to, id, body })
                    .await;
            }
            NodeCommand::DeleteMessage { to, id } => {
                self.session
                    .send(SessionCommand::DeleteMessage { to, id })
                    .await;
            }
            NodeCommand::SendFile { to, name, bytes } => {
                self.session
                    .send(SessionCommand::SendFile { to, name, bytes })
                    .await;
            }
            NodeCommand::AddContact { to } => {
                self.session.send(SessionCommand::AddContact { to }).await;
            }
            NodeCommand::Decide { from, accept } => {
                self.session.send(SessionCommand::Decide { from, accept }).await;
            }
            NodeCommand::Connect { to } => {
                self.session.send(SessionCommand::Connect { to }).await;
            }
            NodeCommand::GoOffline => {
                self.offline = true;
                for handle in self.engines.values() {
                    handle.pause().await;
                }
            }
            NodeCommand::GoOnline => {
                self.offline = false;
                for handle in self.engines.values() {
                    handle.resume().await;
                }
            }
            NodeCommand::Shutdown => {
                for handle in self.engines.values() {
                    handle.shutdown().await;
                }
                self.session.send(SessionCommand::Shutdown).await;
                self.stopped = true;
            }
        }
    }

    fn spawn_engine(&mut self, kind: NamespaceKind) {
        let cfg = NamespaceConfig::new(&self.config.prefix, kind);
        let base = cfg.base();
        if self.engines.contains_key(&base) {
            return;
        }
        let state = NamespaceState::new(
            cfg,
            self.config.timings.clone(),
            self.uuid.clone(),
            self.name.clone(),
            Some(self.identity.public_key().to_string()),
            self.config.jitter_seed,
            now_ms(),
        );
        let handle = engine::spawn(
            self.signaling.clone(),
            state,
            self.store.clone(),
            self.engine_tx.clone(),
        );
        self.engines.insert(base, handle);
    }

    // ── Session events ─────────────────────────────────────────────────

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::ContactUnreachable { peer } => {
                self.scheduler.enqueue(peer.clone());
                let _ = self.session_out.send(event.clone()).await;
                self.try_activate().await;
                return;
            }
            SessionEvent::ContactConnected { peer } => {
                self.connected.insert(peer.clone());
                self.scheduler.forget(peer);
                // The contact surfaced on its own; any rendezvous hunting
                // for it is moot.
                if self.scheduler.active().map(|a| &a.peer) == Some(peer) {
                    let peer = peer.clone();
                    self.finish_rendezvous(&peer, false).await;
                }
            }
            SessionEvent::ContactDisconnected { peer } => {
                self.connected.remove(peer);
            }
            SessionEvent::ContactMigrated { old, new } => {
                self.scheduler.rename(old, new);
                if self.connected.remove(old) {
                    self.connected.insert(new.clone());
                }
            }
            SessionEvent::PersistentIdChanged { id } => {
                self.me = id.clone();
            }
            _ => {}
        }
        let _ = self.session_out.send(event).await;
    }

    // ── Engine events ──────────────────────────────────────────────────

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Ns { namespace, event } => match event {
                NsEvent::RoleChanged { router, level } => {
                    let _ = self
                        .events
                        .send(NodeEvent::RoleChanged {
                            namespace,
                            router,
                            level,
                        })
                        .await;
                }
                NsEvent::PeersUpdated(peers) => {
                    let _ = self
                        .events
                        .send(NodeEvent::PeersUpdated { namespace, peers })
                        .await;
                }
                NsEvent::DiscoveryOffline => {
                    let rvz = self
                        .scheduler
                        .active()
                        .map(|a| a.namespace.base() == namespace)
                        .unwrap_or(false);
                    if rvz {
                        if let Some(peer) = self.scheduler.expire_active() {
                            debug!(%peer, "rendezvous namespace went offline; re-queued");
                        }
                        self.teardown_namespace(&namespace).await;
                        self.rvz_deadline = None;
                        self.try_activate().await;
                    }
                    let _ = self
                        .events
                        .send(NodeEvent::DiscoveryOffline { namespace })
                        .await;
                }
                NsEvent::PublicKeyObserved {
                    persistent_id,
                    public_key,
                } => {
                    // First sighting of this contact's key: derive and cache
                    // the pair key so messages and rendezvous can use it.
                    match SharedKey::derive(&self.identity, &public_key) {
                        Ok(key) => {
                            let mut store = self.store.lock().expect("contact store lock");
                            store.cache_shared_key(persistent_id, key);
                        }
                        Err(e) => {
                            let _ = self
                                .events
                                .send(NodeEvent::CryptoDegraded {
                                    peer: persistent_id,
                                    description: e.to_string(),
                                })
                                .await;
                        }
                    }
                }
                NsEvent::RendezvousCandidate {
                    discovery_id,
                    public_key,
                } => {
                    let matches = self
                        .scheduler
                        .active()
                        .map(|a| a.namespace.base() == namespace && a.public_key == public_key)
                        .unwrap_or(false);
                    if matches {
                        self.spawn_exchange(discovery_id, public_key);
                    }
                }
                NsEvent::Error { description } => {
                    let _ = self.events.send(NodeEvent::Error { description }).await;
                }
            },
            EngineEvent::InboundDiscovery { channel, .. } => {
                self.spawn_responder(channel);
            }
            EngineEvent::Stopped { namespace } => {
                self.engines.remove(&namespace);
            }
        }
    }

    // ── Rendezvous ─────────────────────────────────────────────────────

    async fn sweep_tick(&mut self) {
        if self.offline {
            return;
        }
        {
            let store = self.store.lock().expect("contact store lock");
            let connected = &self.connected;
            self.scheduler.sweep(&store, |pid| connected.contains(pid));
        }
        self.try_activate().await;
    }

    async fn try_activate(&mut self) {
        if self.offline || self.scheduler.active().is_some() {
            return;
        }
        let now = now_ms();
        let active = {
            let store = self.store.lock().expect("contact store lock");
            self.scheduler
                .activate_next(&store, &self.config.prefix, now)
        };
        let Some(active) = active else { return };

        info!(peer = %active.peer, namespace = %active.namespace.base(), "rendezvous window open");
        let state = NamespaceState::new(
            active.namespace.clone(),
            self.config.timings.clone(),
            self.uuid.clone(),
            self.name.clone(),
            Some(self.identity.public_key().to_string()),
            self.config.jitter_seed,
            now,
        );
        let handle = engine::spawn(
            self.signaling.clone(),
            state,
            self.store.clone(),
            self.engine_tx.clone(),
        );
        self.engines.insert(active.namespace.base(), handle);
        self.rvz_deadline =
            Some(Instant::now() + Duration::from_millis(active.deadline_ms.saturating_sub(now)));
        let _ = self
            .events
            .send(NodeEvent::RendezvousStarted {
                peer: active.peer.clone(),
                namespace: active.namespace.base(),
            })
            .await;
    }

    async fn deadline_expired(&mut self) {
        let namespace = self.scheduler.active().map(|a| a.namespace.base());
        if let Some(peer) = self.scheduler.expire_active() {
            debug!(%peer, "rendezvous window closed without contact; re-queued");
        }
        if let Some(ns) = namespace {
            self.teardown_namespace(&ns).await;
        }
        self.rvz_deadline = None;
        self.try_activate().await;
    }

    /// Close out the active rendezvous. `succeeded` controls the event and
    /// the follow-up persistent connect.
    async fn finish_rendezvous(&mut self, peer: &PersistentId, succeeded: bool) {
        let Some(active) = self.scheduler.complete_active() else {
            return;
        };
        self.teardown_namespace(&active.namespace.base()).await;
        self.rvz_deadline = None;
        if succeeded {
            let _ = self
                .events
                .send(NodeEvent::RendezvousSucceeded { peer: peer.clone() })
                .await;
            self.session
                .send(SessionCommand::Connect { to: peer.clone() })
                .await;
        }
        self.try_activate().await;
    }

    async fn teardown_namespace(&mut self, namespace: &str) {
        if let Some(handle) = self.engines.remove(namespace) {
            handle.shutdown().await;
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ExchangeDone {
                public_key,
                peer,
                migrated,
            } => {
                if let Some((old, new)) = migrated {
                    self.scheduler.rename(&old, &new);
                    if self.connected.remove(&old) {
                        self.connected.insert(new.clone());
                    }
                    let _ = self
                        .session_out
                        .send(SessionEvent::ContactMigrated { old, new })
                        .await;
                }
                let matches = self
                    .scheduler
                    .active()
                    .map(|a| a.public_key == public_key)
                    .unwrap_or(false);
                if matches {
                    self.finish_rendezvous(&peer, true).await;
                }
            }
            Internal::ExchangeFailed { description } => {
                debug!("rendezvous exchange failed: {description}");
            }
        }
    }

    /// Requester side: dial the matched discovery id and swap signed
    /// persistent-id exchanges.
    fn spawn_exchange(&self, discovery_id: String, expect_pk: String) {
        let signaling = self.signaling.clone();
        let identity = self.identity.clone();
        let store = self.store.clone();
        let internal_tx = self.internal_tx.clone();
        let me = self.me.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let result = async {
                let channel =
                    tokio::time::timeout(Duration::from_secs(10), signaling.connect(&discovery_id))
                        .await
                        .map_err(|_| "rendezvous dial timed out".to_string())?
                        .map_err(|e| e.to_string())?;
                channel
                    .send(&exchange_frame(&identity, &me, &name).to_value())
                    .await
                    .map_err(|e| e.to_string())?;

                let (handle, mut events) = channel.split();
                let reply = await_exchange(&mut events, Duration::from_secs(10)).await?;
                handle.close();
                conclude_exchange(&store, reply, Some(&expect_pk))
            }
            .await;

            let _ = internal_tx
                .send(match result {
                    Ok(done) => done,
                    Err(description) => Internal::ExchangeFailed { description },
                })
                .await;
        });
    }

    /// Responder side: a peer dialed our discovery id.
    fn spawn_responder(&self, channel: Channel) {
        let identity = self.identity.clone();
        let store = self.store.clone();
        let internal_tx = self.internal_tx.clone();
        let me = self.me.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let (handle, mut events) = channel.split();
            let result = async {
                let frame = await_exchange(&mut events, Duration::from_secs(15)).await?;
                let done = conclude_exchange(&store, frame, None)?;
                handle
                    .send(&exchange_frame(&identity, &me, &name).to_value())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok::<Internal, String>(done)
            }
            .await;
            handle.close();

            let _ = internal_tx
                .send(match result {
                    Ok(done) => done,
                    Err(description) => Internal::ExchangeFailed { description },
                })
                .await;
        });
    }
}

fn exchange_frame(identity: &Identity, me: &PersistentId, name: &str) -> Frame {
    let ts = now_ms();
    let public_key = identity.public_key().to_string();
    let persistent_id = me.to_string();
    let signature =
        identity.sign(&exchange_signing_bytes(&persistent_id, name, &public_key, ts));
    Frame::RvzExchange {
        persistent_id,
        friendly_name: name.to_string(),
        public_key,
        ts,
        signature,
    }
}

async fn await_exchange(
    events: &mut peerns_signal::ChannelEvents,
    timeout: Duration,
) -> Result<Frame, String> {
    let deadline = Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| "rendezvous exchange timed out".to_string())?;
        match event {
            Some(ChannelEvent::Frame(value)) => match Frame::parse(&value) {
                Ok(frame @ Frame::RvzExchange { .. }) => return Ok(frame),
                Ok(_) | Err(_) => continue,
            },
            Some(ChannelEvent::Closed) | None => {
                return Err("channel closed before exchange".to_string())
            }
        }
    }
}

/// Verify an exchange frame and apply the persistent-id migration it
/// implies. Shared by both sides.
fn conclude_exchange(
    store: &Arc<Mutex<ContactStore>>,
    frame: Frame,
    expect_pk: Option<&str>,
) -> Result<Internal, String> {
    let Frame::RvzExchange {
        persistent_id,
        friendly_name,
        public_key,
        ts,
        signature,
    } = frame
    else {
        return Err("not an exchange frame".to_string());
    };

    if verify_signature(
        &public_key,
        &exchange_signing_bytes(&persistent_id, &friendly_name, &public_key, ts),
        &signature,
    )
    .is_err()
    {
        warn!("rvz-exchange signature invalid");
        return Err("exchange signature invalid".to_string());
    }
    if let Some(expected) = expect_pk {
        if expected != public_key {
            return Err("exchange public key does not match the hunted contact".to_string());
        }
    }
    let new_pid: PersistentId = persistent_id
        .parse()
        .map_err(|_| "exchange carried a malformed persistent id".to_string())?;

    let migrated = {
        let mut store = store.lock().expect("contact store lock");
        let migrated = store
            .find_by_public_key(&public_key, Some(&new_pid))
            .and_then(|old| store.migrate(&old, new_pid.clone()))
            .map(|event| match event {
                ContactEvent::Migrated { old, new } => (old, new),
            });
        if let Some(rec) = store.get_mut(&new_pid) {
            rec.friendly_name = friendly_name;
            rec.last_seen = now_ms();
        }
        migrated
    };
    if let Some((old, new)) = &migrated {
        info!(%old, %new, "rendezvous migrated contact to fresh persistent id");
    }

    Ok(Internal::ExchangeDone {
        public_key,
        peer: new_pid,
        migrated,
    })
}

/// Wait for the rendezvous deadline; pend forever when none is armed.
async fn fire_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
