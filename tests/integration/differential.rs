//! Differential sync: an unchanged peer gets nothing at all.

use attune_core::Appearance;
use attune_sync::orchestrator::{Strategy, SyncOutcome};

use crate::{eventually, peer_pair};

#[tokio::test(flavor = "multi_thread")]
async fn unchanged_state_sends_nothing() {
    let (a, b) = peer_pair(1).unwrap();

    let path = a.write_asset("chest.mdl", b"model bytes");
    *a.source.appearance.lock().await = Appearance {
        mod_paths: vec![path],
        honorific_title: "Hero".into(),
        ..Default::default()
    };

    let first = a.connection.sync_to_peer().await.unwrap();
    assert!(matches!(first, SyncOutcome::Sent { .. }));
    assert!(eventually(|| async { b.applied_count().await == 1 }).await);

    // Identical state again: empty delta, no response, no chunks.
    let second = a.connection.sync_to_peer().await.unwrap();
    assert_eq!(second, SyncOutcome::AlreadyInSync);

    // Give any stray traffic time to land, then confirm silence.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(b.applied_count().await, 1);

    // The destination's shortcut agrees nothing needs applying.
    let applied = b
        .connection
        .apply_service()
        .applied_state("Aila Swift")
        .await
        .unwrap();
    assert!(
        !b.connection
            .apply_service()
            .needs_update("Aila Swift", &applied.state_hash)
            .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn only_the_changed_file_travels_again() {
    let (a, b) = peer_pair(1).unwrap();

    let stable_path = a.write_asset("stable.tex", b"never changes");
    let volatile_path = a.write_asset("volatile.mdl", b"version one");
    *a.source.appearance.lock().await = Appearance {
        mod_paths: vec![stable_path.clone(), volatile_path.clone()],
        ..Default::default()
    };
    a.connection.sync_to_peer().await.unwrap();
    assert!(eventually(|| async { b.applied_count().await == 1 }).await);

    // Change one file on disk; the other keeps its hash.
    std::fs::write(a.dir.path().join("volatile.mdl"), b"version two").unwrap();
    let outcome = a.connection.sync_to_peer().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Sent {
            strategy: Strategy::Direct,
            files: 1
        }
    );
    assert!(eventually(|| async { b.applied_count().await == 2 }).await);
    assert!(b
        .connection
        .cache()
        .has(&attune_core::hashing::sha1_hex(b"version two")));
}
