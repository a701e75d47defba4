//! Node runtime — integrates every protocol module into a live node.
//!
//! Owns the identity, the contact store, the session manager, all active
//! namespace engines and the rendezvous scheduler, and exposes a
//! channel-based API so the application never touches wire frames or
//! engine internals.

mod r#loop;

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use peerns_signal::Signaling;

use crate::contacts::ContactStore;
use crate::error::PeernsError;
use crate::identity::{Identity, IdentityExport};
use crate::namespace::{PeerSummary, Timings};
use crate::session::{self, SessionConfig, SessionEvent};
use crate::types::{
    DiscoveryUuid, PersistentId, HANDSHAKE_TIMEOUT_MS, MAX_CONNECT_RETRIES, RVZ_INITIAL_MS,
    RVZ_SWEEP_MS, SEND_RETRY_BASE_MS,
};

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for a node. Defaults carry the protocol constants; tests
/// compress the intervals.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Application prefix for every endpoint string.
    pub prefix: String,
    pub friendly_name: String,
    /// Detected public IP; `None` disables the shared-IP namespace.
    pub public_ip: Option<IpAddr>,
    /// Persisted identity; generated on first run when absent.
    pub identity: Option<IdentityExport>,
    /// Persisted persistent id; generated when absent.
    pub persistent_id: Option<PersistentId>,
    /// Persisted discovery uuid; generated when absent.
    pub discovery_uuid: Option<DiscoveryUuid>,
    /// Contacts restored from the application's persistence layer. Pair
    /// keys are re-derived at startup for entries carrying a public key.
    pub contacts: Vec<(PersistentId, crate::contacts::ContactRecord)>,
    /// Namespace engine timer intervals.
    pub timings: Timings,
    pub rvz_sweep: Duration,
    pub rvz_initial: Duration,
    pub retry_base: Duration,
    pub max_retries: u32,
    pub handshake_timeout: Duration,
    /// Fixed seed for failover/migrate jitter (tests); entropy when `None`.
    pub jitter_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            prefix: "peerns".to_string(),
            friendly_name: "anonymous".to_string(),
            public_ip: None,
            identity: None,
            persistent_id: None,
            discovery_uuid: None,
            contacts: Vec::new(),
            timings: Timings::default(),
            rvz_sweep: Duration::from_millis(RVZ_SWEEP_MS),
            rvz_initial: Duration::from_millis(RVZ_INITIAL_MS),
            retry_base: Duration::from_millis(SEND_RETRY_BASE_MS),
            max_retries: MAX_CONNECT_RETRIES,
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            jitter_seed: None,
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the node.
#[derive(Debug)]
pub enum NodeCommand {
    /// Join the shared-public-IP namespace.
    JoinPublic,
    /// Join a named namespace.
    JoinCustom { name: String, advanced: bool },
    LeaveNamespace { namespace: String },
    SetName(String),
    SendMessage { to: PersistentId, body: String },
    EditMessage { to: PersistentId, id: String, body: String },
    DeleteMessage { to: PersistentId, id: String },
    SendFile { to: PersistentId, name: String, bytes: Vec<u8> },
    /// Start the contact handshake toward a manually entered id.
    AddContact { to: PersistentId },
    /// Answer an incoming contact request.
    Decide { from: PersistentId, accept: bool },
    /// Open the persistent session to a contact now.
    Connect { to: PersistentId },
    GoOffline,
    GoOnline,
    Shutdown,
}

// ── Events (runtime → app) ────────────────────────────────────────────

/// Namespace and rendezvous events the application may want to observe.
/// Chat-level traffic arrives on the separate session stream.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeersUpdated {
        namespace: String,
        peers: Vec<PeerSummary>,
    },
    RoleChanged {
        namespace: String,
        router: bool,
        level: u8,
    },
    /// Level cascade exhausted in this namespace.
    DiscoveryOffline { namespace: String },
    /// No public IP is known; the shared-IP namespace is unavailable.
    PublicIpUnavailable,
    RendezvousStarted {
        peer: PersistentId,
        namespace: String,
    },
    RendezvousSucceeded { peer: PersistentId },
    /// A contact's key material is unusable: E2E with it is disabled and
    /// its messages travel plaintext.
    CryptoDegraded {
        peer: PersistentId,
        description: String,
    },
    Error { description: String },
}

// ── Handle (app-facing API) ───────────────────────────────────────────

/// Handle to a running node. Cheap to clone; all methods are non-blocking
/// channel sends.
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<NodeCommand>,
    persistent_id: PersistentId,
    public_key: String,
}

impl NodeHandle {
    /// The persistent id claimed at startup. A later
    /// [`SessionEvent::PersistentIdChanged`] supersedes this value.
    pub fn persistent_id(&self) -> &PersistentId {
        &self.persistent_id
    }

    /// Base64 SPKI public key — this node's cryptographic identity.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub async fn send(&self, cmd: NodeCommand) -> Result<(), PeernsError> {
        self.cmd_tx.send(cmd).await.map_err(|_| PeernsError::Shutdown)
    }

    pub async fn join_public(&self) -> Result<(), PeernsError> {
        self.send(NodeCommand::JoinPublic).await
    }

    pub async fn join_custom(&self, name: &str, advanced: bool) -> Result<(), PeernsError> {
        self.send(NodeCommand::JoinCustom {
            name: name.to_string(),
            advanced,
        })
        .await
    }

    pub async fn send_message(&self, to: PersistentId, body: String) -> Result<(), PeernsError> {
        self.send(NodeCommand::SendMessage { to, body }).await
    }

    pub async fn add_contact(&self, to: PersistentId) -> Result<(), PeernsError> {
        self.send(NodeCommand::AddContact { to }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(NodeCommand::Shutdown).await;
    }
}

/// Channels returned to the application when the node starts.
pub struct NodeChannels {
    pub handle: NodeHandle,
    /// Chat-level events: messages, statuses, contacts.
    pub session: mpsc::Receiver<SessionEvent>,
    /// Namespace and rendezvous events.
    pub events: mpsc::Receiver<NodeEvent>,
}

// ── Node ──────────────────────────────────────────────────────────────

/// The node — spawn it and communicate via channels.
pub struct Node;

impl Node {
    /// Create and start a node. Fails only when persisted key material is
    /// unusable; callers may then regenerate an identity explicitly.
    pub fn spawn(
        signaling: Arc<dyn Signaling>,
        config: NodeConfig,
    ) -> Result<NodeChannels, PeernsError> {
        let identity = Arc::new(match &config.identity {
            Some(export) => Identity::from_export(export)?,
            None => Identity::generate(),
        });
        let persistent_id = config
            .persistent_id
            .clone()
            .unwrap_or_else(|| PersistentId::generate(&config.prefix));
        let discovery_uuid = config
            .discovery_uuid
            .clone()
            .unwrap_or_else(DiscoveryUuid::generate);

        let store = Arc::new(Mutex::new(ContactStore::new()));
        {
            let mut locked = store.lock().expect("contact store lock");
            for (pid, record) in &config.contacts {
                if let Some(pk) = &record.public_key {
                    if let Ok(key) = crate::crypto::SharedKey::derive(&identity, pk) {
                        locked.cache_shared_key(pid.clone(), key);
                    }
                }
                locked.put(pid.clone(), record.clone());
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(64);
        let (session_out_tx, session_out_rx) = mpsc::channel::<SessionEvent>(256);
        let (event_tx, event_rx) = mpsc::channel::<NodeEvent>(256);

        // Session manager feeds the runtime loop, which forwards to the app.
        let (session_ev_tx, session_ev_rx) = mpsc::channel::<SessionEvent>(256);
        let session_cfg = SessionConfig {
            prefix: config.prefix.clone(),
            friendly_name: config.friendly_name.clone(),
            discovery_uuid: discovery_uuid.clone(),
            persistent_id: persistent_id.clone(),
            retry_base: config.retry_base,
            max_retries: config.max_retries,
            handshake_timeout: config.handshake_timeout,
            dial_timeout: Duration::from_secs(30),
        };
        let session = session::spawn(
            signaling.clone(),
            identity.clone(),
            store.clone(),
            session_cfg,
            session_ev_tx,
        );

        let handle = NodeHandle {
            cmd_tx,
            persistent_id: persistent_id.clone(),
            public_key: identity.public_key().to_string(),
        };

        tokio::spawn(r#loop::node_loop(r#loop::NodeLoop::new(
            signaling,
            identity,
            store,
            config,
            persistent_id,
            discovery_uuid,
            session,
            session_ev_rx,
            session_out_tx,
            event_tx,
            cmd_rx,
        )));

        Ok(NodeChannels {
            handle,
            session: session_out_rx,
            events: event_rx,
        })
    }
}
