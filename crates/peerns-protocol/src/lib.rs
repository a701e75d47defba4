//! peerns protocol layer.
//!
//! Implements the self-organizing mesh control plane on top of
//! `peerns-signal`: per-namespace router election with level cascade,
//! registry gossip, reverse-connect NAT fallback, peer-to-peer identity
//! handshake with per-pair shared keys, time-windowed rendezvous recovery,
//! and persistent encrypted sessions.
//!
//! Wire format: JSON frames over signaling channels.
//! Crypto: ECDSA P-521 signatures + ECDH/HKDF-derived AES-256-GCM.

pub mod contacts;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod namespace;
pub mod rendezvous;
pub mod runtime;
pub mod session;
pub mod types;
pub mod wire;

pub use contacts::{ContactEvent, ContactRecord, ContactStore, MessageStatus, PendingState};
pub use crypto::SharedKey;
pub use error::PeernsError;
pub use identity::Identity;
pub use runtime::{Node, NodeChannels, NodeCommand, NodeConfig, NodeEvent, NodeHandle};
pub use session::SessionEvent;
pub use types::{DiscoveryUuid, PersistentId};
pub use wire::Frame;
