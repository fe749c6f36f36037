//! Progressive sync: announce, then stream chunks; receiver verifies and
//! acknowledges the whole stream once.

use attune_core::hashing::sha1_hex;
use attune_core::Appearance;
use attune_sync::orchestrator::{Strategy, SyncEvent, SyncOutcome};

use crate::{collect_events, eventually, peer_pair};

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn mid_size_payload_streams_in_chunks() {
    let (a, b) = peer_pair(1).unwrap();
    let events_a = collect_events(&a.connection);

    // Two files, together past the direct limit.
    let small = patterned(1536 * 1024, 3);
    let large = patterned(2048 * 1024, 7);
    let small_path = a.write_asset("small.tex", &small);
    let large_path = a.write_asset("large.mdl", &large);
    *a.source.appearance.lock().await = Appearance {
        mod_paths: vec![small_path, large_path],
        ..Default::default()
    };

    let outcome = a.connection.sync_to_peer().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Sent {
            strategy: Strategy::Progressive,
            files: 2
        }
    );

    assert!(eventually(|| async { b.applied_count().await == 1 }).await);
    assert!(b.connection.cache().has(&sha1_hex(&small)));
    assert!(b.connection.cache().has(&sha1_hex(&large)));

    // The receiver acknowledged the stream exactly once, with exact totals.
    let total = (small.len() + large.len()) as u64;
    assert!(
        eventually(|| async {
            events_a.lock().await.iter().any(|e| matches!(
                e,
                SyncEvent::SyncAcknowledged { processed_files: 2, total_bytes } if *total_bytes == total
            ))
        })
        .await
    );
    let acks = events_a
        .lock()
        .await
        .iter()
        .filter(|e| matches!(e, SyncEvent::SyncAcknowledged { .. }))
        .count();
    assert_eq!(acks, 1);

    // Received bytes reassembled bit-identically.
    let blob = b.connection.cache().get_by_hash(&sha1_hex(&large)).unwrap().unwrap();
    assert_eq!(&blob[..], &large[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_chunk_surfaces_integrity_error() {
    use attune_core::message::FileChunkMessage;

    let (a, b) = peer_pair(1).unwrap();
    let events_b = collect_events(&b.connection);

    // Hand-feed B a chunk whose declared hash cannot match.
    let chunk = FileChunkMessage {
        session_id: "bogus".into(),
        file_name: "evil.mdl".into(),
        file_hash: "0000000000000000000000000000000000000000".into(),
        chunk_index: 0,
        total_chunks: 1,
        channel_index: 0,
        data: b"garbage".to_vec(),
    };
    let frame = attune_core::fchk::encode(&chunk);
    b.connection.handle_incoming(frame, 0).await;

    assert!(
        eventually(|| async {
            events_b.lock().await.iter().any(|e| {
                matches!(e, SyncEvent::Error { error_code, .. } if error_code == "INTEGRITY")
            })
        })
        .await
    );
    // Nothing was cached and nothing was applied.
    assert_eq!(b.applied_count().await, 0);
    let _ = a;
}
