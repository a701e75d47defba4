//! Property tests for the crypto laws the protocol leans on.

use proptest::prelude::*;

use peerns_protocol::crypto::{window_index, window_remaining_ms, SharedKey};
use peerns_protocol::identity::verify_signature;
use peerns_protocol::types::PersistentId;
use peerns_protocol::{Frame, Identity};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// encrypt ∘ decrypt = id under one pair key, for arbitrary payloads.
    #[test]
    fn encrypt_decrypt_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..2048), seed in any::<[u8; 32]>()) {
        let key = key_from(seed);
        let (iv, ct) = key.encrypt(&payload).unwrap();
        prop_assert_eq!(key.decrypt(&iv, &ct).unwrap(), payload);
    }

    /// Any corrupted ciphertext byte is rejected, never misdecrypted.
    #[test]
    fn corrupted_ciphertext_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..256),
        seed in any::<[u8; 32]>(),
        flip in any::<u8>(),
    ) {
        use base64::engine::general_purpose::STANDARD as B64;
        use base64::Engine;

        let key = key_from(seed);
        let (iv, ct) = key.encrypt(&payload).unwrap();
        let mut raw = B64.decode(&ct).unwrap();
        let at = (flip as usize) % raw.len();
        raw[at] ^= 0x01;
        prop_assert!(key.decrypt(&iv, &B64.encode(raw)).is_err());
    }

    /// Slugs agree across windows and differ between adjacent windows.
    #[test]
    fn slug_windows(seed in any::<[u8; 32]>(), window in 0u64..10_000_000) {
        let key = key_from(seed);
        prop_assert_eq!(key.rendezvous_slug(window), key.rendezvous_slug(window));
        prop_assert_ne!(key.rendezvous_slug(window), key.rendezvous_slug(window + 1));
    }

    /// Window arithmetic: remaining always lands exactly on the boundary.
    #[test]
    fn window_arithmetic(now in 0u64..=u64::MAX - 600_000) {
        let rem = window_remaining_ms(now);
        prop_assert!(rem >= 1 && rem <= 600_000);
        prop_assert_eq!(window_index(now + rem), window_index(now) + 1);
        prop_assert_eq!(window_index(now + rem - 1), window_index(now));
    }

    /// Persistent ids survive display/parse for any prefix shape we emit.
    #[test]
    fn persistent_id_roundtrip(prefix in "[a-z][a-z0-9-]{0,12}") {
        let id = PersistentId::generate(&prefix);
        let parsed: PersistentId = id.to_string().parse().unwrap();
        prop_assert_eq!(parsed, id);
    }

    /// Wire frames survive a JSON round trip.
    #[test]
    fn message_frame_roundtrip(
        id in "[a-f0-9-]{1,36}",
        ts in any::<u64>(),
        content in ".{0,64}",
    ) {
        let frame = Frame::Message {
            id,
            ts,
            e2e: None,
            iv: None,
            ct: None,
            sig: None,
            content: Some(content),
        };
        prop_assert_eq!(Frame::parse(&frame.to_value()).unwrap(), frame);
    }
}

fn key_from(seed: [u8; 32]) -> SharedKey {
    // Deterministic pair key without a (slow) P-521 exchange per case.
    SharedKey::from_bytes(seed)
}

/// The asymmetric laws use one cached identity pair — P-521 keygen per
/// proptest case would dominate the suite.
#[test]
fn signatures_verify_iff_keypair_matches() {
    let a = Identity::generate();
    let b = Identity::generate();

    for msg in [&b"x"[..], &b"a longer message with some structure"[..], &[0u8; 512]] {
        let sig = a.sign(msg);
        assert!(verify_signature(a.public_key(), msg, &sig).is_ok());
        assert!(verify_signature(b.public_key(), msg, &sig).is_err());
    }
}

#[test]
fn pair_key_is_symmetric_and_slug_matches() {
    let a = Identity::generate();
    let b = Identity::generate();

    let ab = SharedKey::derive(&a, b.public_key()).unwrap();
    let ba = SharedKey::derive(&b, a.public_key()).unwrap();
    assert_eq!(ab, ba);

    for window in [0u64, 1, 2_862_041, u64::MAX / 600_000] {
        assert_eq!(ab.rendezvous_slug(window), ba.rendezvous_slug(window));
    }
}
