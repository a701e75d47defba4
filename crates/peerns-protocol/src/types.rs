use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PeernsError;

// ── Protocol constants ───────────────────────────────────────────────────

/// Highest router level before discovery gives up.
pub const MAX_LEVEL: u8 = 5;

/// Join attempts per level before falling back to the reverse-connect slot.
pub const MAX_JOIN_ATTEMPTS: u32 = 3;

/// Router ping interval.
pub const PING_IV_MS: u64 = 60_000;

/// Registry entry time-to-live, measured against last-seen.
pub const PEER_TTL_MS: u64 = 90_000;

/// Grace added to the TTL before eviction.
pub const PEER_TTL_GRACE_MS: u64 = 10_000;

/// Timeout for a router channel to open during join.
pub const JOIN_TIMEOUT_MS: u64 = 8_000;

/// Spacing between join retries.
pub const JOIN_RETRY_MS: u64 = 1_500;

/// Router probe interval against the reverse-connect slot.
pub const SLOT_PROBE_IV_MS: u64 = 5_000;

/// How long a NAT-blocked peer waits on its slot before escalating.
pub const SLOT_WINDOW_MS: u64 = 30_000;

/// L1 liveness probe interval for nodes sitting at L>1.
pub const MONITOR_IV_MS: u64 = 30_000;

/// A migrate broadcast precedes the router's own teardown by this much.
pub const MIGRATE_LINGER_MS: u64 = 600;

/// Rendezvous sweep interval and initial delay.
pub const RVZ_SWEEP_MS: u64 = 300_000;
pub const RVZ_INITIAL_MS: u64 = 30_000;

/// Rendezvous window length (UTC buckets).
pub const RVZ_WINDOW_MS: u64 = 600_000;

/// Session reconnect: base delay (multiplied by the failure counter) and cap.
pub const SEND_RETRY_BASE_MS: u64 = 5_000;
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// How long an incoming contact request waits for a user decision.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 60_000;

/// Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}

fn random_hex32<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes);
    hex::encode(bytes)
}

// ── PersistentId ─────────────────────────────────────────────────────────

/// Long-lived signaling address: `{prefix}-{32 lowercase hex}`.
///
/// Regenerated only when the claim fails as already-taken; trust is anchored
/// in the public key, never in this string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersistentId {
    prefix: String,
    token: String,
}

impl PersistentId {
    pub fn generate(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            token: random_hex32(&mut rand::thread_rng()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The signaling endpoint string this id claims.
    pub fn endpoint(&self) -> String {
        format!("{}-{}", self.prefix, self.token)
    }
}

impl fmt::Display for PersistentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.token)
    }
}

impl FromStr for PersistentId {
    type Err = PeernsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, token) = s
            .rsplit_once('-')
            .ok_or_else(|| PeernsError::InvalidId(s.to_string()))?;
        if prefix.is_empty()
            || token.len() != 32
            || !token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(PeernsError::InvalidId(s.to_string()));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            token: token.to_string(),
        })
    }
}

impl Serialize for PersistentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PersistentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── DiscoveryUuid ────────────────────────────────────────────────────────

/// Device-local 32-hex opaque token used inside discovery endpoint strings.
/// Stable across sessions, carries no trust.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscoveryUuid(String);

impl DiscoveryUuid {
    pub fn generate() -> Self {
        Self(random_hex32(&mut rand::thread_rng()))
    }

    pub fn parse(s: &str) -> Result<Self, PeernsError> {
        if s.len() != 32 || !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(PeernsError::InvalidId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiscoveryUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_id_roundtrip() {
        let id = PersistentId::generate("peerns");
        let parsed: PersistentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(parsed.prefix(), "peerns");
    }

    #[test]
    fn persistent_id_rejects_bad_tokens() {
        assert!("peerns-short".parse::<PersistentId>().is_err());
        assert!("peerns-ZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<PersistentId>().is_err());
        assert!("nodash".parse::<PersistentId>().is_err());
    }

    #[test]
    fn persistent_id_allows_hyphenated_prefix() {
        // rsplit keeps everything before the last dash as the prefix
        let id = PersistentId::generate("my-app");
        let parsed: PersistentId = id.to_string().parse().unwrap();
        assert_eq!(parsed.prefix(), "my-app");
    }

    #[test]
    fn persistent_id_serde_is_string() {
        let id = PersistentId::generate("peerns");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: PersistentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn discovery_uuid_shape() {
        let uuid = DiscoveryUuid::generate();
        assert_eq!(uuid.as_str().len(), 32);
        assert!(DiscoveryUuid::parse(uuid.as_str()).is_ok());
        assert!(DiscoveryUuid::parse("nope").is_err());
    }

    #[test]
    fn regenerated_ids_differ() {
        let a = PersistentId::generate("peerns");
        let b = PersistentId::generate("peerns");
        assert_ne!(a, b);
    }
}
