//! In-process signaling hub.
//!
//! Implements the [`Signaling`] contract with the uniqueness guarantee the
//! protocol leans on: claims are granted atomically under one lock, so two
//! sessions can never hold the same endpoint simultaneously. Every
//! integration test drives real nodes over one of these.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{Channel, Claimed, SignalError, SignalStatus, Signaling};

/// Pending inbound channels per claimed endpoint.
const ACCEPT_BUFFER: usize = 64;

static CLAIM_IDS: AtomicU64 = AtomicU64::new(1);

enum Slot {
    /// A live claimant accepting connections.
    Live { tx: mpsc::Sender<Channel>, claim_id: u64 },
    /// Claimed but unresponsive: connects hang forever. Test-only stand-in
    /// for a dead peer whose name the service has not yet released.
    Squat { claim_id: u64 },
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<String, Slot>,
}

/// Process-local rendezvous service. Clone handles via [`MemoryHub::client`].
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh signaling session ("device") on this hub.
    pub fn client(&self) -> MemoryClient {
        let (status_tx, _) = watch::channel(SignalStatus::Open);
        MemoryClient {
            inner: self.inner.clone(),
            status: Arc::new(status_tx),
            label: Arc::new(Mutex::new(None)),
        }
    }

    /// Occupy an endpoint without ever answering connects. Dialers hang until
    /// their own timeout fires; claims fail with IdTaken.
    pub fn squat(&self, endpoint: &str) -> Result<SquatGuard, SignalError> {
        let claim_id = CLAIM_IDS.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("hub lock");
        if inner.endpoints.contains_key(endpoint) {
            return Err(SignalError::IdTaken(endpoint.to_string()));
        }
        inner
            .endpoints
            .insert(endpoint.to_string(), Slot::Squat { claim_id });
        Ok(SquatGuard {
            inner: Arc::downgrade(&self.inner),
            endpoint: endpoint.to_string(),
            claim_id,
        })
    }

    pub fn is_claimed(&self, endpoint: &str) -> bool {
        self.inner
            .lock()
            .expect("hub lock")
            .endpoints
            .contains_key(endpoint)
    }
}

/// One session against a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryClient {
    inner: Arc<Mutex<HubInner>>,
    status: Arc<watch::Sender<SignalStatus>>,
    label: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl Signaling for MemoryClient {
    async fn claim(&self, endpoint: &str) -> Result<Claimed, SignalError> {
        if endpoint.is_empty() {
            return Err(SignalError::InvalidEndpoint(endpoint.to_string()));
        }
        let claim_id = CLAIM_IDS.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(ACCEPT_BUFFER);
        {
            let mut inner = self.inner.lock().expect("hub lock");
            if inner.endpoints.contains_key(endpoint) {
                debug!(%endpoint, "claim rejected: already taken");
                return Err(SignalError::IdTaken(endpoint.to_string()));
            }
            inner
                .endpoints
                .insert(endpoint.to_string(), Slot::Live { tx, claim_id });
        }
        debug!(%endpoint, "endpoint claimed");
        let guard = ReleaseOnDrop {
            inner: Arc::downgrade(&self.inner),
            endpoint: endpoint.to_string(),
            claim_id,
        };
        Ok(Claimed::new(endpoint.to_string(), rx, Box::new(guard)))
    }

    async fn connect(&self, endpoint: &str) -> Result<Channel, SignalError> {
        let tx = {
            let inner = self.inner.lock().expect("hub lock");
            match inner.endpoints.get(endpoint) {
                None => {
                    debug!(%endpoint, "connect failed: unreachable");
                    return Err(SignalError::Unreachable(endpoint.to_string()));
                }
                Some(Slot::Squat { .. }) => None,
                Some(Slot::Live { tx, .. }) => Some(tx.clone()),
            }
        };
        let Some(tx) = tx else {
            // Claimed but dead: behave like a rendezvous that never completes.
            debug!(%endpoint, "connect to a squatted endpoint; hanging");
            return std::future::pending().await;
        };
        let label = self.label.lock().expect("label lock").clone();
        let (ours, theirs) = Channel::pair_labeled(Some(endpoint.to_string()), label);
        tx.send(theirs)
            .await
            .map_err(|_| SignalError::Unreachable(endpoint.to_string()))?;
        Ok(ours)
    }

    fn set_label(&self, label: &str) {
        *self.label.lock().expect("label lock") = Some(label.to_string());
    }

    fn status(&self) -> watch::Receiver<SignalStatus> {
        self.status.subscribe()
    }
}

/// Frees the endpoint when the claim drops, but only if the slot still
/// belongs to this claim (a re-claim after release must survive).
struct ReleaseOnDrop {
    inner: Weak<Mutex<HubInner>>,
    endpoint: String,
    claim_id: u64,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().expect("hub lock");
            let ours = matches!(
                inner.endpoints.get(&self.endpoint),
                Some(Slot::Live { claim_id, .. } | Slot::Squat { claim_id }) if *claim_id == self.claim_id
            );
            if ours {
                inner.endpoints.remove(&self.endpoint);
            }
        }
    }
}

/// Keeps a squatted endpoint occupied; dropping frees it.
pub struct SquatGuard {
    inner: Weak<Mutex<HubInner>>,
    endpoint: String,
    claim_id: u64,
}

impl Drop for SquatGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().expect("hub lock");
            let ours = matches!(
                inner.endpoints.get(&self.endpoint),
                Some(Slot::Squat { claim_id }) if *claim_id == self.claim_id
            );
            if ours {
                inner.endpoints.remove(&self.endpoint);
            }
        }
    }
}
