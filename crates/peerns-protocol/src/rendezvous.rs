//! Time-rotating rendezvous recovery.
//!
//! When a contact's persistent id stops answering, both sides can still
//! find each other: each derives the pair's symmetric key, HMACs the
//! current 10-minute window index into a slug, and joins the namespace
//! named by it. Inside, registry entries are matched by public key and the
//! parties exchange signed `rvz-exchange` frames carrying their current
//! persistent ids.
//!
//! This module is the pure queue discipline: one rendezvous active at a
//! time, FIFO over eligible contacts, deadline at the end of the current
//! window (plus slack). The node runtime owns the timers and the engine it
//! spawns for the active slot.

use std::collections::VecDeque;

use crate::contacts::{ContactStore, PendingState};
use crate::crypto::{window_index, window_remaining_ms};
use crate::namespace::{NamespaceConfig, NamespaceKind};
use crate::types::PersistentId;

/// Extra wall-clock past the window end before giving up on the slot.
const DEADLINE_SLACK_MS: u64 = 2_000;

/// The rendezvous currently being attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRendezvous {
    pub peer: PersistentId,
    /// Public key the registry match must carry.
    pub public_key: String,
    pub namespace: NamespaceConfig,
    /// Wall-clock deadline (Unix ms) for this attempt.
    pub deadline_ms: u64,
}

#[derive(Default)]
pub struct RendezvousScheduler {
    queue: VecDeque<PersistentId>,
    active: Option<ActiveRendezvous>,
}

impl RendezvousScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ActiveRendezvous> {
        self.active.as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue a specific contact (session retries exhausted).
    pub fn enqueue(&mut self, peer: PersistentId) {
        if self.queue.contains(&peer) || self.active.as_ref().map(|a| &a.peer) == Some(&peer) {
            return;
        }
        self.queue.push_back(peer);
    }

    /// Periodic sweep: enqueue every contact that (a) has a public key,
    /// (b) is not pending, (c) is not connected, and (d) is not mid-retry
    /// in the session manager. Returns how many were added.
    pub fn sweep<F>(&mut self, store: &ContactStore, mut busy: F) -> usize
    where
        F: FnMut(&PersistentId) -> bool,
    {
        let mut added = 0;
        for pid in store.ids() {
            let Some(rec) = store.get(&pid) else { continue };
            if rec.public_key.is_none()
                || rec.pending != PendingState::None
                || rec.on_network
                || busy(&pid)
            {
                continue;
            }
            if self.queue.contains(&pid)
                || self.active.as_ref().map(|a| &a.peer) == Some(&pid)
            {
                continue;
            }
            self.queue.push_back(pid);
            added += 1;
        }
        added
    }

    /// Pop the next eligible contact and open its rendezvous slot. Only one
    /// is active at a time; callers check [`active`](Self::active) first.
    ///
    /// Contacts whose pair key is missing are skipped (nothing to derive a
    /// slug from).
    pub fn activate_next(
        &mut self,
        store: &ContactStore,
        prefix: &str,
        now_ms: u64,
    ) -> Option<ActiveRendezvous> {
        if self.active.is_some() {
            return None;
        }
        while let Some(peer) = self.queue.pop_front() {
            let Some(public_key) = store.get(&peer).and_then(|r| r.public_key.clone()) else {
                continue;
            };
            let Some(key) = store.shared_key(&peer) else {
                continue;
            };
            let slug = key.rendezvous_slug(window_index(now_ms));
            let namespace =
                NamespaceConfig::new(prefix, NamespaceKind::Rendezvous { slug });
            let active = ActiveRendezvous {
                peer,
                public_key,
                namespace,
                deadline_ms: now_ms + window_remaining_ms(now_ms) + DEADLINE_SLACK_MS,
            };
            self.active = Some(active.clone());
            return Some(active);
        }
        None
    }

    /// The active window closed without contact: re-queue it for the next
    /// window and free the slot.
    pub fn expire_active(&mut self) -> Option<PersistentId> {
        let active = self.active.take()?;
        self.queue.push_back(active.peer.clone());
        Some(active.peer)
    }

    /// The exchange succeeded (or the contact reconnected some other way).
    pub fn complete_active(&mut self) -> Option<ActiveRendezvous> {
        self.active.take()
    }

    /// A migration renamed the contact we are tracking.
    pub fn rename(&mut self, old: &PersistentId, new: &PersistentId) {
        for pid in self.queue.iter_mut() {
            if pid == old {
                *pid = new.clone();
            }
        }
        if let Some(active) = self.active.as_mut() {
            if &active.peer == old {
                active.peer = new.clone();
            }
        }
    }

    /// Drop a contact everywhere (deleted, or came back online).
    pub fn forget(&mut self, peer: &PersistentId) {
        self.queue.retain(|pid| pid != peer);
    }
}
