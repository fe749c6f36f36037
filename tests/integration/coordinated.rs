//! Coordinated sessions: balanced manifest, receipts back, channel
//! high-fives, and session completion only when every contract settles.

use std::collections::HashSet;

use bytes::Bytes;
use attune_core::message::PlayerInfo;
use attune_sync::manifest::FileToSend;
use attune_sync::orchestrator::SyncEvent;

use crate::{collect_events, eventually, peer_pair};

fn patterned(len: usize, seed: u8) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed))
            .collect::<Vec<u8>>(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn two_channel_session_completes_every_contract() {
    let (a, b) = peer_pair(2).unwrap();
    let events_a = collect_events(&a.connection);
    let events_b = collect_events(&b.connection);

    // Sizes shaped like the classic work-stealing case: one dominant file
    // and a tail of smaller ones.
    let sizes = [100usize, 30, 30, 30, 10];
    let files: Vec<FileToSend> = sizes
        .iter()
        .enumerate()
        .map(|(i, kib)| FileToSend::new(format!("file{i}.mdl"), patterned(kib * 1024, i as u8)))
        .collect();
    let hashes: Vec<String> = files.iter().map(|f| f.hash.clone()).collect();

    let session_id = a
        .connection
        .orchestrator()
        .send_coordinated("peer-b", PlayerInfo::default(), files)
        .await
        .unwrap();

    // Sender sees the session complete once receipts cover every file.
    assert!(
        eventually(|| async {
            events_a.lock().await.iter().any(|e| {
                matches!(e, SyncEvent::SessionCompleted { session_id: s, .. } if *s == session_id)
            })
        })
        .await
    );

    // Both channels were active and both closed with a high-five.
    let completed_channels: HashSet<u32> = events_a
        .lock()
        .await
        .iter()
        .filter_map(|e| match e {
            SyncEvent::ChannelComplete { channel_id, .. } => Some(*channel_id),
            _ => None,
        })
        .collect();
    assert_eq!(completed_channels, HashSet::from([0, 1]));

    // Every file arrived exactly once, none twice.
    let received: Vec<String> = events_b
        .lock()
        .await
        .iter()
        .filter_map(|e| match e {
            SyncEvent::FileReceived { file_hash, .. } => Some(file_hash.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), sizes.len(), "no file may be sent twice");
    assert_eq!(
        received.iter().cloned().collect::<HashSet<_>>(),
        hashes.iter().cloned().collect::<HashSet<_>>()
    );
    for hash in &hashes {
        assert!(b.connection.cache().has(hash));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn receiver_reports_session_completion_too() {
    let (a, b) = peer_pair(2).unwrap();
    let events_b = collect_events(&b.connection);

    let files: Vec<FileToSend> = (0..3)
        .map(|i| FileToSend::new(format!("f{i}.tex"), patterned(20 * 1024, i as u8)))
        .collect();
    let session_id = a
        .connection
        .orchestrator()
        .send_coordinated("peer-b", PlayerInfo::default(), files)
        .await
        .unwrap();

    assert!(
        eventually(|| async {
            events_b.lock().await.iter().any(|e| {
                matches!(e, SyncEvent::SessionCompleted { session_id: s, .. } if *s == session_id)
            })
        })
        .await
    );
}
