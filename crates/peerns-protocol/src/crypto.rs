//! Per-pair end-to-end encryption.
//!
//! Each contact pair derives the same AES-256-GCM key from static ECDH over
//! P-521: the local signing scalar against the peer's public point, 66-byte
//! shared secret through HKDF-SHA-256 (empty salt, fixed info string).
//! Because the key is symmetric, both sides also compute identical
//! time-windowed rendezvous slugs from it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::PeernsError;
use crate::identity::{decode_public, Identity};
use crate::types::RVZ_WINDOW_MS;

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"peerns-e2e-v1";

/// HMAC message prefix for rendezvous slugs.
const RVZ_PREFIX: &str = "peerns-rvz-v1-";

/// AES-GCM IV length in bytes.
const IV_LEN: usize = 12;

/// Symmetric key shared by one contact pair.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey {
    key: [u8; 32],
}

impl SharedKey {
    /// Derive the pair key from our identity and the peer's base64 SPKI
    /// public key. Deterministic: both sides arrive at the same key.
    pub fn derive(local: &Identity, peer_spki_b64: &str) -> Result<Self, PeernsError> {
        let peer = decode_public(peer_spki_b64)?;
        let shared = p521::ecdh::diffie_hellman(
            local.secret().to_nonzero_scalar(),
            peer.as_affine(),
        );
        let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
        Ok(Self { key })
    }

    /// Restore a cached pair key (e.g. from the application's persistence).
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Raw key bytes, for the application's persistence layer.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key
    }

    /// Shared-key fingerprint: first 8 bytes of SHA-256 over the raw key
    /// bytes, hex-encoded. Both contacts see the same value.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        hex::encode(&digest[..8])
    }

    /// Encrypt with a fresh 12-byte IV. Returns `(iv, ciphertext)` base64.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(String, String), PeernsError> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .expect("AES-256-GCM accepts a 32-byte key");
        let ct = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| PeernsError::CryptoUnavailable("AES-GCM encrypt".into()))?;
        Ok((B64.encode(iv), B64.encode(ct)))
    }

    /// Decrypt a base64 `(iv, ciphertext)` pair.
    pub fn decrypt(&self, iv_b64: &str, ct_b64: &str) -> Result<Vec<u8>, PeernsError> {
        let iv = B64.decode(iv_b64).map_err(|_| PeernsError::DecryptFailed)?;
        let ct = B64.decode(ct_b64).map_err(|_| PeernsError::DecryptFailed)?;
        if iv.len() != IV_LEN {
            return Err(PeernsError::DecryptFailed);
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .expect("AES-256-GCM accepts a 32-byte key");
        cipher
            .decrypt(Nonce::from_slice(&iv), ct.as_ref())
            .map_err(|_| PeernsError::DecryptFailed)
    }

    /// Rendezvous slug for a window index: first 8 bytes of
    /// `HMAC-SHA-256(key, "peerns-rvz-v1-" || window)`, hex-encoded.
    pub fn rendezvous_slug(&self, window: u64) -> String {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(format!("{RVZ_PREFIX}{window}").as_bytes());
        let out = mac.finalize().into_bytes();
        hex::encode(&out[..8])
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Current rendezvous window: 10-minute UTC buckets.
pub fn window_index(now_ms: u64) -> u64 {
    now_ms / RVZ_WINDOW_MS
}

/// Milliseconds left in the current window.
pub fn window_remaining_ms(now_ms: u64) -> u64 {
    RVZ_WINDOW_MS - (now_ms % RVZ_WINDOW_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();

        let ab = SharedKey::derive(&a, b.public_key()).unwrap();
        let ba = SharedKey::derive(&b, a.public_key()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.fingerprint(), ba.fingerprint());
    }

    #[test]
    fn different_pairs_different_keys() {
        let a = Identity::generate();
        let b = Identity::generate();
        let c = Identity::generate();

        let ab = SharedKey::derive(&a, b.public_key()).unwrap();
        let ac = SharedKey::derive(&a, c.public_key()).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let a = Identity::generate();
        let b = Identity::generate();
        let key = SharedKey::derive(&a, b.public_key()).unwrap();

        let (iv, ct) = key.encrypt("bonjour le mesh".as_bytes()).unwrap();
        let pt = key.decrypt(&iv, &ct).unwrap();
        assert_eq!(pt, b"bonjour le mesh");
    }

    #[test]
    fn fresh_iv_per_message() {
        let key = SharedKey::from_bytes([7u8; 32]);
        let (iv1, ct1) = key.encrypt(b"same").unwrap();
        let (iv2, ct2) = key.encrypt(b"same").unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SharedKey::from_bytes([9u8; 32]);
        let (iv, ct) = key.encrypt(b"secret").unwrap();

        let mut raw = B64.decode(&ct).unwrap();
        raw[0] ^= 0xFF;
        let tampered = B64.encode(raw);

        assert!(matches!(
            key.decrypt(&iv, &tampered),
            Err(PeernsError::DecryptFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let k1 = SharedKey::from_bytes([1u8; 32]);
        let k2 = SharedKey::from_bytes([2u8; 32]);
        let (iv, ct) = k1.encrypt(b"secret").unwrap();
        assert!(k2.decrypt(&iv, &ct).is_err());
    }

    #[test]
    fn bad_iv_length_fails() {
        let key = SharedKey::from_bytes([3u8; 32]);
        let (_, ct) = key.encrypt(b"x").unwrap();
        assert!(key.decrypt(&B64.encode([0u8; 4]), &ct).is_err());
    }

    #[test]
    fn slug_is_symmetric_and_windowed() {
        let a = Identity::generate();
        let b = Identity::generate();
        let ab = SharedKey::derive(&a, b.public_key()).unwrap();
        let ba = SharedKey::derive(&b, a.public_key()).unwrap();

        let w = window_index(1_700_000_000_000);
        assert_eq!(ab.rendezvous_slug(w), ba.rendezvous_slug(w));
        assert_ne!(ab.rendezvous_slug(w), ab.rendezvous_slug(w + 1));

        let slug = ab.rendezvous_slug(w);
        assert_eq!(slug.len(), 16);
        assert!(slug.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn window_math() {
        // 10-minute buckets
        assert_eq!(window_index(0), 0);
        assert_eq!(window_index(599_999), 0);
        assert_eq!(window_index(600_000), 1);

        assert_eq!(window_remaining_ms(0), 600_000);
        assert_eq!(window_remaining_ms(599_999), 1);
        assert_eq!(window_remaining_ms(600_000), 600_000);
    }
}
