//! Per-namespace peer registry.
//!
//! Keyed by discovery id. Exactly one `is_me` entry exists at all times; no
//! two entries may share a public key (the more recently seen one wins).
//! The router side holds channel handles for its peers; the peer side
//! rebuilds its registry from router broadcasts.

use std::collections::HashMap;

use crate::contacts::{ContactStore, KeyOutcome};
use crate::types::PersistentId;
use crate::wire::RegistryPeer;

use super::config::NamespaceConfig;
use super::effect::ChannelId;

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub discovery_id: String,
    pub friendly_name: String,
    pub last_seen: u64,
    /// Router-side connection to this peer. Absent on the peer side.
    pub channel: Option<ChannelId>,
    pub is_me: bool,
    /// Persistent id of the matching local contact, when one exists.
    pub persistent_id: Option<PersistentId>,
    pub public_key: Option<String>,
}

/// What upper layers see of one registry line.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub discovery_id: String,
    pub friendly_name: String,
    pub persistent_id: Option<PersistentId>,
    pub public_key: Option<String>,
    pub is_me: bool,
}

pub struct Registry {
    self_id: String,
    entries: HashMap<String, RegistryEntry>,
}

impl Registry {
    pub fn new(self_id: String, self_name: String, public_key: Option<String>, now: u64) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            self_id.clone(),
            RegistryEntry {
                discovery_id: self_id.clone(),
                friendly_name: self_name,
                last_seen: now,
                channel: None,
                is_me: true,
                persistent_id: None,
                public_key,
            },
        );
        Self { self_id, entries }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn set_self_name(&mut self, name: &str) {
        if let Some(me) = self.entries.get_mut(&self.self_id) {
            me.friendly_name = name.to_string();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, discovery_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(discovery_id)
    }

    /// Drop everything but the self entry.
    pub fn reset_to_self(&mut self) {
        self.entries.retain(|_, e| e.is_me);
    }

    /// Insert or replace a peer entry, enforcing the public-key dedup
    /// invariant. Returns channels of entries evicted by the dedup so the
    /// caller can close them.
    pub fn insert(&mut self, entry: RegistryEntry) -> Vec<ChannelId> {
        let mut evicted = Vec::new();
        if let Some(pk) = &entry.public_key {
            let stale: Vec<String> = self
                .entries
                .values()
                .filter(|e| {
                    !e.is_me
                        && e.discovery_id != entry.discovery_id
                        && e.public_key.as_deref() == Some(pk)
                        && e.last_seen <= entry.last_seen
                })
                .map(|e| e.discovery_id.clone())
                .collect();
            for id in stale {
                if let Some(old) = self.entries.remove(&id) {
                    evicted.extend(old.channel);
                }
            }
        }
        self.entries.insert(entry.discovery_id.clone(), entry);
        evicted
    }

    pub fn touch_by_channel(&mut self, channel: ChannelId, now: u64) {
        if let Some(e) = self
            .entries
            .values_mut()
            .find(|e| e.channel == Some(channel))
        {
            e.last_seen = now;
        }
    }

    pub fn remove_by_channel(&mut self, channel: ChannelId) -> Option<RegistryEntry> {
        let id = self
            .entries
            .values()
            .find(|e| e.channel == Some(channel))
            .map(|e| e.discovery_id.clone())?;
        self.entries.remove(&id)
    }

    /// Evict non-self entries whose last-seen predates the TTL (plus grace).
    /// Returns the removed entries.
    pub fn evict_stale(&mut self, now: u64, ttl_ms: u64) -> Vec<RegistryEntry> {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| !e.is_me && now.saturating_sub(e.last_seen) > ttl_ms)
            .map(|e| e.discovery_id.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Channels of all non-self peers (router side).
    pub fn peer_channels(&self) -> Vec<ChannelId> {
        self.entries
            .values()
            .filter(|e| !e.is_me)
            .filter_map(|e| e.channel)
            .collect()
    }

    /// Full registry as broadcast to peers.
    pub fn to_wire(&self) -> Vec<RegistryPeer> {
        let mut peers: Vec<RegistryPeer> = self
            .entries
            .values()
            .map(|e| RegistryPeer {
                discovery_id: e.discovery_id.clone(),
                friendly_name: e.friendly_name.clone(),
                public_key: e.public_key.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.discovery_id.cmp(&b.discovery_id));
        peers
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self
            .entries
            .values()
            .map(|e| PeerSummary {
                discovery_id: e.discovery_id.clone(),
                friendly_name: e.friendly_name.clone(),
                persistent_id: e.persistent_id.clone(),
                public_key: e.public_key.clone(),
                is_me: e.is_me,
            })
            .collect();
        out.sort_by(|a, b| a.discovery_id.cmp(&b.discovery_id));
        out
    }

    /// Peer-side merge of a router broadcast.
    ///
    /// Rebuilds the registry around the self entry, deduplicating by public
    /// key and resolving entries to local contacts (public key first,
    /// discovery uuid second). Contact presence flags are rewritten from
    /// scratch. Returns `(persistent_id, public_key)` pairs for contacts
    /// that were missing their key so the runtime can record and derive.
    pub fn merge_broadcast(
        &mut self,
        peers: &[RegistryPeer],
        cfg: &NamespaceConfig,
        store: &mut ContactStore,
        now: u64,
    ) -> Vec<(PersistentId, String)> {
        self.reset_to_self();
        store.reset_on_network();

        let mut observed = Vec::new();
        for peer in peers {
            if peer.discovery_id == self.self_id {
                continue;
            }
            // Dedup within the broadcast itself
            if let Some(pk) = &peer.public_key {
                let dup = self
                    .entries
                    .values()
                    .any(|e| !e.is_me && e.public_key.as_deref() == Some(pk));
                if dup {
                    continue;
                }
            }

            let resolved = peer
                .public_key
                .as_deref()
                .and_then(|pk| store.find_by_public_key(pk, None))
                .or_else(|| {
                    cfg.uuid_of(&peer.discovery_id)
                        .and_then(|uuid| store.find_by_discovery_uuid(&uuid))
                });

            if let Some(pid) = &resolved {
                if let Some(rec) = store.get_mut(pid) {
                    rec.on_network = true;
                    rec.network_discovery_id = Some(peer.discovery_id.clone());
                    rec.last_seen = now;
                }
                if let Some(pk) = &peer.public_key {
                    if store.get(pid).and_then(|r| r.public_key.clone()).is_none()
                        && store.record_public_key(pid, pk) == KeyOutcome::Recorded
                    {
                        observed.push((pid.clone(), pk.clone()));
                    }
                }
            }

            self.entries.insert(
                peer.discovery_id.clone(),
                RegistryEntry {
                    discovery_id: peer.discovery_id.clone(),
                    friendly_name: peer.friendly_name.clone(),
                    last_seen: now,
                    channel: None,
                    is_me: false,
                    persistent_id: resolved,
                    public_key: peer.public_key.clone(),
                },
            );
        }
        observed
    }
}
