//! Direct (inline) sync: small payloads travel whole in one response.

use attune_core::hashing::{component_hash, sha1_hex};
use attune_core::Appearance;
use attune_sync::orchestrator::{Strategy, SyncOutcome};

use crate::{eventually, peer_pair};

#[tokio::test(flavor = "multi_thread")]
async fn tiny_sync_goes_direct_and_applies() {
    let (a, b) = peer_pair(1).unwrap();

    // One 512-byte asset plus a title.
    let asset_bytes = vec![0x5a; 512];
    let asset_path = a.write_asset("a.mdl", &asset_bytes);
    *a.source.appearance.lock().await = Appearance {
        mod_paths: vec![asset_path.clone()],
        honorific_title: "Hero".into(),
        ..Default::default()
    };

    let outcome = a.connection.sync_to_peer().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Sent {
            strategy: Strategy::Direct,
            files: 1
        }
    );

    assert!(eventually(|| async { b.applied_count().await == 1 }).await);

    // The destination holds the file blob by content hash...
    let expected_hash = sha1_hex(&asset_bytes);
    assert!(b.connection.cache().has(&expected_hash));
    let blob = b.connection.cache().get_by_hash(&expected_hash).unwrap().unwrap();
    assert_eq!(&blob[..], &asset_bytes[..]);

    // ...and exactly the honorific component, identifier "title".
    let title_hash = component_hash("title", "Hero");
    let component = b.connection.store().get_component(&title_hash).unwrap();
    assert_eq!(component.identifier, "title");
    assert_eq!(component.data, "Hero");

    let (player, applied) = b.last_applied().await.unwrap();
    assert_eq!(player, "Aila Swift");
    assert_eq!(applied.honorific_title, "Hero");
    assert_eq!(applied.mod_paths, vec![asset_path]);

    // The recipe landed with a single honorific ref.
    let recipe = b.connection.store().get_latest_recipe("Aila Swift").unwrap();
    let honorific_refs: Vec<_> = recipe.refs.iter().filter(|r| r.starts_with("O:")).collect();
    assert_eq!(honorific_refs.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn disallowed_files_never_travel() {
    let (a, b) = peer_pair(1).unwrap();

    let allowed = a.write_asset("ok.tex", b"texture");
    let refused = a.write_asset("sneaky.exe", b"nope");
    *a.source.appearance.lock().await = Appearance {
        mod_paths: vec![allowed, refused],
        ..Default::default()
    };

    let outcome = a.connection.sync_to_peer().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Sent {
            strategy: Strategy::Direct,
            files: 1
        }
    );

    assert!(eventually(|| async { b.applied_count().await == 1 }).await);
    assert!(b.connection.cache().has(&sha1_hex(b"texture")));
    assert!(!b.connection.cache().has(&sha1_hex(b"nope")));
}
