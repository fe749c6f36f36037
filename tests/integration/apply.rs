//! Apply and rollback across the whole stack.

use std::collections::BTreeMap;

use attune_core::Appearance;
use attune_sync::apply::PeerState;

use crate::peer_pair;

fn stored_state(peer: &crate::TestPeer, hash: &str, title: &str) -> PeerState {
    let appearance = Appearance {
        honorific_title: title.into(),
        ..Default::default()
    };
    peer.connection
        .store()
        .store_recipe("Aila Swift", hash, &appearance)
        .unwrap();
    PeerState {
        player_name: "Aila Swift".into(),
        appearance_hash: hash.into(),
        file_hashes: BTreeMap::new(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn apply_then_unwind_the_transaction_stack() {
    let (_a, b) = peer_pair(1).unwrap();
    let apply = b.connection.apply_service();

    // Apply X, then Y.
    let x = stored_state(&b, "X", "Hero");
    let t1 = apply
        .apply_outfit_atomic("Aila Swift", &x)
        .await
        .transaction_id
        .expect("first apply succeeds");

    let y = stored_state(&b, "Y", "Villain");
    let t2 = apply
        .apply_outfit_atomic("Aila Swift", &y)
        .await
        .transaction_id
        .expect("second apply succeeds");
    assert_eq!(b.applied_count().await, 2);

    // Rolling back T2 restores X.
    apply.rollback(&t2).await.unwrap();
    let state = apply.applied_state("Aila Swift").await.unwrap();
    assert_eq!(state.state_hash, "X");

    // T1 had no previous state: rolling it back removes the entry.
    apply.rollback(&t1).await.unwrap();
    assert!(apply.applied_state("Aila Swift").await.is_none());
    assert!(apply.needs_update("Aila Swift", "X").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn reapplying_the_same_state_is_shortcut() {
    let (a, b) = peer_pair(1).unwrap();

    *a.source.appearance.lock().await = Appearance {
        honorific_title: "Hero".into(),
        ..Default::default()
    };
    a.connection.sync_to_peer().await.unwrap();
    assert!(crate::eventually(|| async { b.applied_count().await == 1 }).await);

    // The same push again: the state hash matches, the sink stays quiet.
    // (The orchestrator already skips the wire entirely; force a second
    // announcement by forgetting the peer's manifest memory first.)
    a.connection.orchestrator().store_peer_manifest(
        "peer-b",
        attune_sync::differential::PeerManifest::default(),
    );
    a.connection.sync_to_peer().await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(b.applied_count().await, 1, "sink must not be re-invoked");
}
