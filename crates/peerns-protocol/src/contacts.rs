//! Contact store.
//!
//! Durable map from persistent id to contact record, plus the per-contact
//! chat log and the cached pair key. The store owns all mutation; tasks
//! share it behind a lock and keep critical sections synchronous.
//!
//! Identity is the public key: records that turn out to share one are merged
//! under the most recently observed persistent id, and a recorded key is
//! immutable for the life of the record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::SharedKey;
use crate::types::{now_ms, DiscoveryUuid, PersistentId};

/// Handshake progress for a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingState {
    None,
    Outgoing,
    Incoming,
}

/// One saved contact. Transient channel state lives in the session manager,
/// never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub friendly_name: String,
    pub discovery_uuid: DiscoveryUuid,
    /// Cached namespace-scoped discovery id, if one was seen.
    pub discovery_id: Option<String>,
    /// Base64 SPKI. Absent until the handshake completes; immutable after.
    pub public_key: Option<String>,
    pub on_network: bool,
    pub network_discovery_id: Option<String>,
    pub last_seen: u64,
    pub pending: PendingState,
    /// Fingerprint captured when an incoming request was first verified.
    pub pending_fingerprint: Option<String>,
    pub pending_verified: bool,
}

impl ContactRecord {
    pub fn new(friendly_name: impl Into<String>, discovery_uuid: DiscoveryUuid) -> Self {
        Self {
            friendly_name: friendly_name.into(),
            discovery_uuid,
            discovery_id: None,
            public_key: None,
            on_network: false,
            network_discovery_id: None,
            last_seen: now_ms(),
            pending: PendingState::None,
            pending_fingerprint: None,
            pending_verified: false,
        }
    }
}

/// Delivery pipeline of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageStatus {
    Waiting = 0,
    Sent = 1,
    Delivered = 2,
    Failed = 3,
}

/// One chat log line. Edits rewrite `body`; deletes leave a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub ts: u64,
    pub outgoing: bool,
    pub body: String,
    pub status: MessageStatus,
    pub edited: bool,
    pub deleted: bool,
}

/// Outcome of recording a peer's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// First key for this contact.
    Recorded,
    /// Matches the key already on file.
    Confirmed,
    /// Contradicts the key on file. The record is left untouched.
    Mismatch,
}

/// Events surfaced to upper layers so they can redirect active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactEvent {
    Migrated {
        old: PersistentId,
        new: PersistentId,
    },
}

#[derive(Default)]
pub struct ContactStore {
    contacts: HashMap<PersistentId, ContactRecord>,
    chats: HashMap<PersistentId, Vec<ChatMessage>>,
    shared_keys: HashMap<PersistentId, SharedKey>,
}

impl ContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Records ────────────────────────────────────────────────────────

    pub fn put(&mut self, id: PersistentId, record: ContactRecord) {
        self.contacts.insert(id, record);
    }

    pub fn get(&self, id: &PersistentId) -> Option<&ContactRecord> {
        self.contacts.get(id)
    }

    pub fn get_mut(&mut self, id: &PersistentId) -> Option<&mut ContactRecord> {
        self.contacts.get_mut(id)
    }

    pub fn delete(&mut self, id: &PersistentId) -> bool {
        self.chats.remove(id);
        self.shared_keys.remove(id);
        self.contacts.remove(id).is_some()
    }

    pub fn ids(&self) -> Vec<PersistentId> {
        self.contacts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn find_by_public_key(
        &self,
        public_key: &str,
        exclude: Option<&PersistentId>,
    ) -> Option<PersistentId> {
        self.contacts
            .iter()
            .find(|(id, rec)| {
                rec.public_key.as_deref() == Some(public_key) && Some(*id) != exclude
            })
            .map(|(id, _)| id.clone())
    }

    pub fn find_by_discovery_uuid(&self, uuid: &str) -> Option<PersistentId> {
        self.contacts
            .iter()
            .find(|(_, rec)| rec.discovery_uuid.as_str() == uuid)
            .map(|(id, _)| id.clone())
    }

    /// Record or confirm a contact's public key. A recorded key never
    /// changes; contradictions are reported, not applied.
    pub fn record_public_key(&mut self, id: &PersistentId, public_key: &str) -> KeyOutcome {
        match self.contacts.get_mut(id) {
            None => KeyOutcome::Mismatch,
            Some(rec) => match &rec.public_key {
                None => {
                    rec.public_key = Some(public_key.to_string());
                    KeyOutcome::Recorded
                }
                Some(existing) if existing == public_key => KeyOutcome::Confirmed,
                Some(_) => KeyOutcome::Mismatch,
            },
        }
    }

    // ── Shared keys ────────────────────────────────────────────────────

    pub fn shared_key(&self, id: &PersistentId) -> Option<&SharedKey> {
        self.shared_keys.get(id)
    }

    pub fn cache_shared_key(&mut self, id: PersistentId, key: SharedKey) {
        self.shared_keys.insert(id, key);
    }

    // ── Chat log ───────────────────────────────────────────────────────

    pub fn chat(&self, id: &PersistentId) -> &[ChatMessage] {
        self.chats.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn push_message(&mut self, id: &PersistentId, msg: ChatMessage) {
        self.chats.entry(id.clone()).or_default().push(msg);
    }

    /// Advance a message's status. Monotonic: Waiting → Sent → Delivered,
    /// with Failed reachable from Waiting/Sent. Duplicate acks are no-ops.
    pub fn mark_status(&mut self, id: &PersistentId, msg_id: &str, status: MessageStatus) -> bool {
        let Some(log) = self.chats.get_mut(id) else {
            return false;
        };
        let Some(msg) = log.iter_mut().find(|m| m.id == msg_id) else {
            return false;
        };
        let allowed = match status {
            MessageStatus::Failed => msg.status < MessageStatus::Delivered,
            _ => status > msg.status && msg.status != MessageStatus::Failed,
        };
        if allowed {
            msg.status = status;
        }
        allowed
    }

    /// Rewrite a message body, keeping the original timestamp so ordering is
    /// stable. Idempotent: re-applying the same edit is a no-op; edits to
    /// deleted or unknown messages are dropped.
    pub fn apply_edit(&mut self, id: &PersistentId, msg_id: &str, body: &str) -> bool {
        let Some(log) = self.chats.get_mut(id) else {
            return false;
        };
        let Some(msg) = log.iter_mut().find(|m| m.id == msg_id) else {
            return false;
        };
        if msg.deleted || (msg.edited && msg.body == body) {
            return false;
        }
        msg.body = body.to_string();
        msg.edited = true;
        true
    }

    /// Tombstone a message. Idempotent.
    pub fn apply_delete(&mut self, id: &PersistentId, msg_id: &str) -> bool {
        let Some(log) = self.chats.get_mut(id) else {
            return false;
        };
        let Some(msg) = log.iter_mut().find(|m| m.id == msg_id) else {
            return false;
        };
        if msg.deleted {
            return false;
        }
        msg.deleted = true;
        msg.body.clear();
        true
    }

    // ── Migration ──────────────────────────────────────────────────────

    /// Re-key a contact whose persistent id changed. Chat histories merge
    /// (dedup by id, sorted by ts), the cached shared key moves, and the
    /// caller gets an event to redirect any active chat.
    pub fn migrate(&mut self, old: &PersistentId, new: PersistentId) -> Option<ContactEvent> {
        if *old == new {
            return None;
        }
        let record = self.contacts.remove(old)?;

        let old_chat = self.chats.remove(old).unwrap_or_default();
        let new_chat = self.chats.remove(&new).unwrap_or_default();
        let merged = merge_chat_logs(old_chat, new_chat);

        // The newer observation wins the record; keep the established key
        // material from the old record if the new slot had none.
        let mut record = record;
        if let Some(existing) = self.contacts.remove(&new) {
            if record.public_key.is_none() {
                record.public_key = existing.public_key;
            }
            record.last_seen = record.last_seen.max(existing.last_seen);
        }
        record.last_seen = record.last_seen.max(now_ms());

        if let Some(key) = self.shared_keys.remove(old) {
            self.shared_keys.insert(new.clone(), key);
        }
        if !merged.is_empty() {
            self.chats.insert(new.clone(), merged);
        }
        self.contacts.insert(new.clone(), record);

        Some(ContactEvent::Migrated {
            old: old.clone(),
            new,
        })
    }

    /// Clear network presence before a registry merge repopulates it.
    pub fn reset_on_network(&mut self) {
        for rec in self.contacts.values_mut() {
            rec.on_network = false;
            rec.network_discovery_id = None;
        }
    }
}

fn merge_chat_logs(a: Vec<ChatMessage>, b: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut by_id: HashMap<String, ChatMessage> = HashMap::new();
    for msg in a.into_iter().chain(b) {
        match by_id.get_mut(&msg.id) {
            None => {
                by_id.insert(msg.id.clone(), msg);
            }
            Some(existing) => {
                // Tombstones and edits beat the plain copy of the same id.
                if msg.deleted || (msg.edited && !existing.edited && !existing.deleted) {
                    *existing = msg;
                }
            }
        }
    }
    let mut merged: Vec<ChatMessage> = by_id.into_values().collect();
    merged.sort_by(|x, y| x.ts.cmp(&y.ts).then_with(|| x.id.cmp(&y.id)));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> PersistentId {
        PersistentId::generate("peerns")
    }

    fn msg(id: &str, ts: u64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            ts,
            outgoing: true,
            body: format!("body-{id}"),
            status: MessageStatus::Sent,
            edited: false,
            deleted: false,
        }
    }

    #[test]
    fn put_get_delete() {
        let mut store = ContactStore::new();
        let id = pid();
        store.put(id.clone(), ContactRecord::new("alice", DiscoveryUuid::generate()));
        assert!(store.get(&id).is_some());
        assert!(store.delete(&id));
        assert!(store.get(&id).is_none());
        assert!(!store.delete(&id));
    }

    #[test]
    fn find_by_public_key_honors_exclude() {
        let mut store = ContactStore::new();
        let a = pid();
        let mut rec = ContactRecord::new("alice", DiscoveryUuid::generate());
        rec.public_key = Some("K".into());
        store.put(a.clone(), rec);

        assert_eq!(store.find_by_public_key("K", None), Some(a.clone()));
        assert_eq!(store.find_by_public_key("K", Some(&a)), None);
        assert_eq!(store.find_by_public_key("other", None), None);
    }

    #[test]
    fn public_key_is_immutable() {
        let mut store = ContactStore::new();
        let a = pid();
        store.put(a.clone(), ContactRecord::new("alice", DiscoveryUuid::generate()));

        assert_eq!(store.record_public_key(&a, "K1"), KeyOutcome::Recorded);
        assert_eq!(store.record_public_key(&a, "K1"), KeyOutcome::Confirmed);
        assert_eq!(store.record_public_key(&a, "K2"), KeyOutcome::Mismatch);
        assert_eq!(store.get(&a).unwrap().public_key.as_deref(), Some("K1"));
    }

    #[test]
    fn migrate_moves_record_chat_and_key() {
        let mut store = ContactStore::new();
        let old = pid();
        let new = pid();

        let mut rec = ContactRecord::new("carl", DiscoveryUuid::generate());
        rec.public_key = Some("K".into());
        store.put(old.clone(), rec);
        store.push_message(&old, msg("m1", 10));
        store.push_message(&old, msg("m2", 20));
        store.cache_shared_key(old.clone(), SharedKey::from_bytes([5u8; 32]));

        let event = store.migrate(&old, new.clone()).unwrap();
        assert_eq!(
            event,
            ContactEvent::Migrated {
                old: old.clone(),
                new: new.clone()
            }
        );

        assert!(store.get(&old).is_none());
        assert_eq!(store.find_by_public_key("K", None), Some(new.clone()));
        assert_eq!(store.chat(&new).len(), 2);
        assert!(store.chat(&old).is_empty());
        assert!(store.shared_key(&new).is_some());
        assert!(store.shared_key(&old).is_none());
    }

    #[test]
    fn migrate_merges_histories_sorted_and_unique() {
        let mut store = ContactStore::new();
        let old = pid();
        let new = pid();

        store.put(old.clone(), ContactRecord::new("c", DiscoveryUuid::generate()));
        store.put(new.clone(), ContactRecord::new("c", DiscoveryUuid::generate()));

        store.push_message(&old, msg("m3", 30));
        store.push_message(&old, msg("m1", 10));
        store.push_message(&new, msg("m2", 20));
        store.push_message(&new, msg("m1", 10)); // duplicate id

        store.migrate(&old, new.clone());

        let chat = store.chat(&new);
        let ids: Vec<&str> = chat.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
        let ts: Vec<u64> = chat.iter().map(|m| m.ts).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn migrate_prefers_tombstones_on_duplicate_ids() {
        let mut store = ContactStore::new();
        let old = pid();
        let new = pid();
        store.put(old.clone(), ContactRecord::new("c", DiscoveryUuid::generate()));

        let mut deleted = msg("m1", 10);
        deleted.deleted = true;
        deleted.body.clear();
        store.push_message(&old, deleted);
        store.push_message(&new, msg("m1", 10));

        store.migrate(&old, new.clone());
        assert!(store.chat(&new)[0].deleted);
    }

    #[test]
    fn migrate_to_same_id_is_noop() {
        let mut store = ContactStore::new();
        let a = pid();
        store.put(a.clone(), ContactRecord::new("x", DiscoveryUuid::generate()));
        assert!(store.migrate(&a, a.clone()).is_none());
        assert!(store.get(&a).is_some());
    }

    #[test]
    fn edit_and_delete_are_idempotent() {
        let mut store = ContactStore::new();
        let a = pid();
        store.put(a.clone(), ContactRecord::new("x", DiscoveryUuid::generate()));
        store.push_message(&a, msg("m1", 10));

        assert!(store.apply_edit(&a, "m1", "new text"));
        assert!(!store.apply_edit(&a, "m1", "new text"));
        assert_eq!(store.chat(&a)[0].body, "new text");
        assert!(store.chat(&a)[0].edited);

        assert!(store.apply_delete(&a, "m1"));
        assert!(!store.apply_delete(&a, "m1"));
        assert!(store.chat(&a)[0].deleted);
        assert!(store.chat(&a)[0].body.is_empty());

        // Edits after delete are dropped
        assert!(!store.apply_edit(&a, "m1", "zombie"));
    }

    #[test]
    fn status_pipeline_is_monotonic() {
        let mut store = ContactStore::new();
        let a = pid();
        store.put(a.clone(), ContactRecord::new("x", DiscoveryUuid::generate()));
        let mut m = msg("m1", 10);
        m.status = MessageStatus::Waiting;
        store.push_message(&a, m);

        assert!(store.mark_status(&a, "m1", MessageStatus::Sent));
        assert!(store.mark_status(&a, "m1", MessageStatus::Delivered));
        // Duplicate ack: no effect
        assert!(!store.mark_status(&a, "m1", MessageStatus::Delivered));
        // No regression
        assert!(!store.mark_status(&a, "m1", MessageStatus::Sent));
        // Delivered never becomes failed
        assert!(!store.mark_status(&a, "m1", MessageStatus::Failed));
    }

    #[test]
    fn reset_on_network_clears_presence() {
        let mut store = ContactStore::new();
        let a = pid();
        let mut rec = ContactRecord::new("x", DiscoveryUuid::generate());
        rec.on_network = true;
        rec.network_discovery_id = Some("d".into());
        store.put(a.clone(), rec);

        store.reset_on_network();
        let rec = store.get(&a).unwrap();
        assert!(!rec.on_network);
        assert!(rec.network_discovery_id.is_none());
    }
}
