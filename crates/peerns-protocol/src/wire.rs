//! Wire frames.
//!
//! Every message on a signaling channel is one JSON object with a `type`
//! tag. Field names are part of the protocol and never change with Rust
//! naming conventions. Unknown frame types are ignored by handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PeernsError;

/// One registry line as broadcast by a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryPeer {
    #[serde(rename = "discoveryID")]
    pub discovery_id: String,
    #[serde(rename = "friendlyName")]
    pub friendly_name: String,
    #[serde(rename = "publicKey", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// The frame vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    // ── Namespace control ───────────────────────────
    #[serde(rename = "checkin")]
    Checkin {
        #[serde(rename = "discoveryID")]
        discovery_id: String,
        #[serde(rename = "friendlyName")]
        friendly_name: String,
        #[serde(rename = "publicKey", skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    #[serde(rename = "registry")]
    Registry { peers: Vec<RegistryPeer> },
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "pong")]
    Pong {},
    #[serde(rename = "migrate")]
    Migrate { level: u8 },
    #[serde(rename = "reverse-welcome")]
    ReverseWelcome {},

    // ── Session ─────────────────────────────────────
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "friendlyName")]
        friendly_name: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        ts: u64,
        signature: String,
    },
    #[serde(rename = "message")]
    Message {
        id: String,
        ts: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        e2e: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        iv: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ct: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sig: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    #[serde(rename = "message-ack")]
    MessageAck { id: String },
    #[serde(rename = "message-edit")]
    MessageEdit {
        id: String,
        ts: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        e2e: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        iv: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ct: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sig: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    #[serde(rename = "message-delete")]
    MessageDelete { id: String },
    #[serde(rename = "name-update")]
    NameUpdate { name: String },

    // ── Contact handshake ───────────────────────────
    #[serde(rename = "request")]
    Request {
        #[serde(rename = "friendlyName")]
        friendly_name: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(rename = "persistentID")]
        persistent_id: String,
        ts: u64,
        signature: String,
    },
    #[serde(rename = "accepted")]
    Accepted {
        #[serde(rename = "persistentID")]
        persistent_id: String,
        #[serde(rename = "discoveryUUID")]
        discovery_uuid: String,
    },
    #[serde(rename = "confirm")]
    Confirm {
        #[serde(rename = "persistentID")]
        persistent_id: String,
        #[serde(rename = "friendlyName")]
        friendly_name: String,
        #[serde(rename = "discoveryUUID")]
        discovery_uuid: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    #[serde(rename = "rejected")]
    Rejected {},

    // ── Rendezvous ──────────────────────────────────
    #[serde(rename = "rvz-exchange")]
    RvzExchange {
        #[serde(rename = "persistentID")]
        persistent_id: String,
        #[serde(rename = "friendlyName")]
        friendly_name: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        ts: u64,
        signature: String,
    },

    // ── File transfer ───────────────────────────────
    #[serde(rename = "file-start")]
    FileStart {
        tid: String,
        name: String,
        size: u64,
        total: u32,
    },
    #[serde(rename = "file-chunk")]
    FileChunk { tid: String, index: u32, chunk: String },
    #[serde(rename = "file-end")]
    FileEnd { tid: String },
    #[serde(rename = "file-ack")]
    FileAck { tid: String },
}

impl Frame {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("frames always serialize")
    }

    pub fn parse(value: &Value) -> Result<Frame, PeernsError> {
        serde_json::from_value(value.clone()).map_err(|e| PeernsError::MalformedFrame {
            reason: e.to_string(),
        })
    }
}

/// Canonical bytes signed by `hello` frames.
pub fn hello_signing_bytes(friendly_name: &str, public_key: &str, ts: u64) -> Vec<u8> {
    format!("{friendly_name}|{public_key}|{ts}").into_bytes()
}

/// Canonical bytes signed by `request` and `rvz-exchange` frames.
pub fn exchange_signing_bytes(
    persistent_id: &str,
    friendly_name: &str,
    public_key: &str,
    ts: u64,
) -> Vec<u8> {
    format!("{persistent_id}|{friendly_name}|{public_key}|{ts}").into_bytes()
}
