//! Long-lived cryptographic identity.
//!
//! An ECDSA keypair over NIST P-521. The base64 SPKI encoding of the public
//! key is the identity string carried in wire frames and contact records;
//! the persistent signaling id is just an address and carries no trust.
//!
//! Signatures are ECDSA/SHA-256 over a canonical byte string, transported as
//! base64 of the fixed-size (r || s) form.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ecdsa::hazmat::{sign_prehashed, verify_prehashed, bits2field};
use ecdsa::{Signature, SigningKey, VerifyingKey};
use p521::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use p521::{NistP521, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PeernsError;

/// Serialized keypair, as persisted by the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityExport {
    /// Base64 PKCS#8 DER of the private key.
    pub private_key: String,
    /// Base64 SPKI DER of the public key.
    pub public_key: String,
}

/// The local signing identity.
#[derive(Clone)]
pub struct Identity {
    secret: SecretKey,
    public_b64: String,
}

impl Identity {
    /// Create a fresh identity. Done once on first run; the result is
    /// persisted via [`Identity::export`].
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let public_b64 = encode_public(&secret.public_key());
        Self { secret, public_b64 }
    }

    /// Restore a persisted identity. Unusable key material is the
    /// crypto-unavailable condition: callers degrade rather than terminate.
    pub fn from_export(export: &IdentityExport) -> Result<Self, PeernsError> {
        let der = B64
            .decode(&export.private_key)
            .map_err(|e| PeernsError::CryptoUnavailable(format!("private key base64: {e}")))?;
        let secret = SecretKey::from_pkcs8_der(&der)
            .map_err(|e| PeernsError::CryptoUnavailable(format!("private key der: {e}")))?;
        let public_b64 = encode_public(&secret.public_key());
        if public_b64 != export.public_key {
            return Err(PeernsError::CryptoUnavailable(
                "public key does not match private key".into(),
            ));
        }
        Ok(Self { secret, public_b64 })
    }

    pub fn export(&self) -> IdentityExport {
        let der = self
            .secret
            .to_pkcs8_der()
            .expect("P-521 key always encodes to PKCS#8");
        IdentityExport {
            private_key: B64.encode(der.as_bytes()),
            public_key: self.public_b64.clone(),
        }
    }

    /// Base64 SPKI form of the public key — the identity string.
    pub fn public_key(&self) -> &str {
        &self.public_b64
    }

    /// Fingerprint of our own identity.
    pub fn fingerprint(&self) -> String {
        identity_fingerprint(&self.public_b64)
    }

    /// ECDSA/SHA-256 signature over `msg`, base64-encoded.
    pub fn sign(&self, msg: &[u8]) -> String {
        let key = SigningKey::<NistP521>::from(&self.secret);
        let sig: Signature<NistP521> = key
            .sign_prehash(&Sha256::digest(msg))
            .expect("ECDSA signing with a valid key cannot fail");
        B64.encode(sig.to_bytes())
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

fn encode_public(public: &PublicKey) -> String {
    let der = public
        .to_public_key_der()
        .expect("P-521 public key always encodes to SPKI");
    B64.encode(der.as_bytes())
}

/// Parse a peer's base64 SPKI public key.
pub fn decode_public(spki_b64: &str) -> Result<PublicKey, PeernsError> {
    let der = B64
        .decode(spki_b64)
        .map_err(|e| PeernsError::CryptoUnavailable(format!("public key base64: {e}")))?;
    PublicKey::from_public_key_der(&der)
        .map_err(|e| PeernsError::CryptoUnavailable(format!("public key der: {e}")))
}

/// Verify a base64 ECDSA/SHA-256 signature against a base64 SPKI public key.
pub fn verify_signature(spki_b64: &str, msg: &[u8], sig_b64: &str) -> Result<(), PeernsError> {
    let public = decode_public(spki_b64)?;
    let verifying = VerifyingKey::<NistP521>::from_affine(*public.as_affine())
        .map_err(|_| PeernsError::InvalidSignature)?;
    let raw = B64.decode(sig_b64).map_err(|_| PeernsError::InvalidSignature)?;
    let sig = Signature::<NistP521>::from_slice(&raw).map_err(|_| PeernsError::InvalidSignature)?;
    verifying
        .verify_prehash(&Sha256::digest(msg), &sig)
        .map_err(|_| PeernsError::InvalidSignature)
}

/// Identity fingerprint: first 8 bytes of SHA-256 over the base64 SPKI
/// string, hex-encoded. Short enough to read over the phone.
pub fn identity_fingerprint(spki_b64: &str) -> String {
    let digest = Sha256::digest(spki_b64.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let id = Identity::generate();
        let sig = id.sign(b"hello namespace");
        assert!(verify_signature(id.public_key(), b"hello namespace", &sig).is_ok());
    }

    #[test]
    fn wrong_message_rejected() {
        let id = Identity::generate();
        let sig = id.sign(b"original");
        assert!(verify_signature(id.public_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let a = Identity::generate();
        let b = Identity::generate();
        let sig = a.sign(b"message");
        assert!(verify_signature(b.public_key(), b"message", &sig).is_err());
    }

    #[test]
    fn garbage_signature_rejected() {
        let id = Identity::generate();
        assert!(verify_signature(id.public_key(), b"message", "not base64!!").is_err());
        assert!(verify_signature(id.public_key(), b"message", &B64.encode([0u8; 7])).is_err());
    }

    #[test]
    fn export_import_roundtrip() {
        let id = Identity::generate();
        let restored = Identity::from_export(&id.export()).unwrap();
        assert_eq!(id.public_key(), restored.public_key());

        // Signatures from the restored key verify against the original public key
        let sig = restored.sign(b"persisted");
        assert!(verify_signature(id.public_key(), b"persisted", &sig).is_ok());
    }

    #[test]
    fn corrupt_export_is_crypto_unavailable() {
        let mut export = Identity::generate().export();
        export.private_key = "AAAA".into();
        match Identity::from_export(&export) {
            Err(PeernsError::CryptoUnavailable(_)) => {}
            other => panic!("expected CryptoUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_export_keys_rejected() {
        let a = Identity::generate();
        let b = Identity::generate();
        let export = IdentityExport {
            private_key: a.export().private_key,
            public_key: b.public_key().to_string(),
        };
        assert!(Identity::from_export(&export).is_err());
    }

    #[test]
    fn fingerprint_is_stable_hex16() {
        let id = Identity::generate();
        let fp = id.fingerprint();
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, identity_fingerprint(id.public_key()));
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprints_differ_between_identities() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
