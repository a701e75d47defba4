//! Integration: public-key dedup when a contact regenerates its
//! persistent id.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect_retry, expect_session};
use peerns_protocol::contacts::ContactRecord;
use peerns_protocol::session::SessionEvent;
use peerns_protocol::types::{now_ms, DiscoveryUuid, PersistentId};
use peerns_protocol::wire::{hello_signing_bytes, Frame};
use peerns_protocol::{Identity, Node, NodeConfig};
use peerns_signal::{MemoryHub, Signaling};

/// Contact C was known at P1 with key K. C comes back from a new device
/// address P2; its verified hello carries K, so the record migrates —
/// `find_by_public_key(K)` now answers P2 and nothing is keyed by P1.
#[tokio::test]
async fn hello_migrates_regenerated_persistent_id() {
    let hub = MemoryHub::new();

    let carl = Identity::generate();
    let old_pid = PersistentId::generate("pfx");
    let new_pid = PersistentId::generate("pfx");

    // Bob restores a contact for Carl at the old id.
    let mut carl_record = ContactRecord::new("carl", DiscoveryUuid::generate());
    carl_record.public_key = Some(carl.public_key().to_string());
    let bob = Node::spawn(
        Arc::new(hub.client()),
        NodeConfig {
            prefix: "pfx".into(),
            friendly_name: "bob".into(),
            contacts: vec![(old_pid.clone(), carl_record)],
            rvz_initial: Duration::from_secs(3600),
            rvz_sweep: Duration::from_secs(3600),
            timings: common::fast_timings(),
            ..NodeConfig::default()
        },
    )
    .unwrap();
    let mut bob_session = bob.session;

    // Carl dials in from the regenerated id and says a signed hello.
    let client = hub.client();
    client.set_label(&new_pid.endpoint());
    let _claim = client.claim(&new_pid.endpoint()).await.unwrap();

    let ch = connect_retry(&client, &bob.handle.persistent_id().endpoint()).await;
    let ts = now_ms();
    let pk = carl.public_key().to_string();
    let signature = carl.sign(&hello_signing_bytes("carl", &pk, ts));
    ch.send(
        &Frame::Hello {
            friendly_name: "carl".into(),
            public_key: pk,
            ts,
            signature,
        }
        .to_value(),
    )
    .await
    .unwrap();

    let (old, new) = expect_session(&mut bob_session, "migration", |e| match e {
        SessionEvent::ContactMigrated { old, new } => Some((old.clone(), new.clone())),
        _ => None,
    })
    .await;
    assert_eq!(old, old_pid);
    assert_eq!(new, new_pid);

    expect_session(&mut bob_session, "carl connected under the new id", |e| {
        matches!(e, SessionEvent::ContactConnected { peer } if *peer == new_pid).then_some(())
    })
    .await;
}
