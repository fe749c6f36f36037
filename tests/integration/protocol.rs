//! Protocol-level flows: chunked control messages, legacy senders,
//! request/response exchanges, and post-reconnect recovery.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use attune_core::message::{Body, ChannelNegotiation, MemberListRequest, RecoveryRequest};
use attune_core::{chunk, frame, Appearance, Message, MessageKind};
use attune_sync::connection::MemberProvider;
use attune_sync::orchestrator::SyncEvent;
use attune_sync::DataChannel;

use crate::{collect_events, eventually, peer_pair};

fn big_error_message() -> Message {
    Message::new(Body::Error(attune_core::message::ErrorMessage {
        error_code: "TEST".into(),
        // Hard-to-compress text keeps several chunks after gzip.
        error_description: (0..6000u32)
            .map(|i| format!("{:08x}", i.wrapping_mul(2654435761)))
            .collect(),
        failed_operation: None,
    }))
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_control_message_survives_reordering() {
    let (a, b) = peer_pair(1).unwrap();
    let events_b = collect_events(&b.connection);

    let message = big_error_message();
    let Body::Error(ref expected) = message.body else { unreachable!() };
    let expected_description = expected.error_description.clone();

    // Split by hand and deliver the chunks in scrambled order.
    let mut parts = chunk::split_message(&message, 1024).unwrap();
    assert!(parts.len() >= 4, "need several chunks, got {}", parts.len());
    parts.reverse();
    let mid = parts.len() / 2;
    parts.swap(0, mid);
    for part in &parts {
        let framed = frame::encode(part).unwrap();
        a.endpoint.send(Bytes::from(framed), 0).await.unwrap();
    }

    // Exactly one reassembled dispatch reaches B's error path.
    assert!(
        eventually(|| async {
            events_b.lock().await.iter().any(|e| {
                matches!(e, SyncEvent::Error { error_description, .. } if *error_description == expected_description)
            })
        })
        .await
    );
    let dispatched = events_b
        .lock()
        .await
        .iter()
        .filter(|e| matches!(e, SyncEvent::Error { .. }))
        .count();
    assert_eq!(dispatched, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_raw_json_request_gets_a_full_sync() {
    let (a, b) = peer_pair(1).unwrap();

    let path = a.write_asset("chest.mdl", b"legacy model");
    *a.source.appearance.lock().await = Appearance {
        mod_paths: vec![path],
        honorific_title: "Hero".into(),
        ..Default::default()
    };

    // An old-style sender: unframed JSON, no type, no messageId.
    let raw = br#"{"playerName":"Borel Stone"}"#;
    b.endpoint.send(Bytes::from_static(raw), 0).await.unwrap();

    assert!(eventually(|| async { b.applied_count().await == 1 }).await);
    let (player, applied) = b.last_applied().await.unwrap();
    assert_eq!(player, "Aila Swift");
    assert_eq!(applied.honorific_title, "Hero");
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_negotiation_round_trips() {
    let (a, _b) = peer_pair(2).unwrap();

    let request = Message::new(Body::ChannelNegotiation(ChannelNegotiation {
        mod_count: 200,
        large_mod_count: 10,
        small_mod_count: 190,
        available_memory_mb: 256,
        total_data_mb: 500,
        requested_channels: 8,
    }));
    let response = a
        .connection
        .dispatcher()
        .send_request(request, 0, Duration::from_secs(5))
        .await
        .unwrap()
        .expect("negotiation response");

    assert_eq!(response.kind(), MessageKind::ChannelNegotiationResponse);
    let Body::ChannelNegotiationResponse(body) = response.body else {
        unreachable!()
    };
    // 256 MiB limiting at the default 64 MiB per-channel budget.
    assert_eq!(body.limiting_memory_mb, 256);
    assert_eq!(body.my_channels, 4);
    assert_eq!(body.your_channels, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn member_list_answers_from_the_provider() {
    struct Roster;
    impl MemberProvider for Roster {
        fn members(&self, syncshell_id: Option<&str>) -> Vec<String> {
            assert_eq!(syncshell_id, Some("shell-1"));
            vec!["Aila Swift".into(), "Borel Stone".into()]
        }
    }

    crate::init_tracing();
    let ((endpoint_a, incoming_a), (endpoint_b, incoming_b)) = attune_sync::loopback::pair(1);
    let a = crate::build_peer_with_members(
        "peer-a",
        "peer-b",
        "Aila Swift",
        endpoint_a,
        incoming_a,
        None,
    )
    .unwrap();
    let b = crate::build_peer_with_members(
        "peer-b",
        "peer-a",
        "Borel Stone",
        endpoint_b,
        incoming_b,
        Some(Arc::new(Roster)),
    )
    .unwrap();

    let request = Message::new(Body::MemberListRequest(MemberListRequest {
        syncshell_id: Some("shell-1".into()),
    }));
    let response = a
        .connection
        .dispatcher()
        .send_request(request, 0, Duration::from_secs(5))
        .await
        .unwrap()
        .expect("member list response");
    let Body::MemberListResponse(body) = response.body else {
        unreachable!()
    };
    assert_eq!(body.members, vec!["Aila Swift", "Borel Stone"]);
    let _ = b;
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_request_resends_only_missing_files() {
    let (a, b) = peer_pair(1).unwrap();
    let events_b = collect_events(&b.connection);

    // Progressive sync leaves the outgoing file set live for recovery.
    let kept = a.write_asset("kept.mdl", &vec![1u8; 800 * 1024]);
    let lost = a.write_asset("lost.tex", &vec![2u8; 700 * 1024]);
    *a.source.appearance.lock().await = Appearance {
        mod_paths: vec![kept, lost],
        ..Default::default()
    };
    a.connection.sync_to_peer().await.unwrap();
    assert!(eventually(|| async { b.applied_count().await == 1 }).await);

    let kept_hash = attune_core::hashing::sha1_hex(&vec![1u8; 800 * 1024]);
    let lost_hash = attune_core::hashing::sha1_hex(&vec![2u8; 700 * 1024]);
    let before = events_b
        .lock()
        .await
        .iter()
        .filter(|e| matches!(e, SyncEvent::FileReceived { .. }))
        .count();

    // B claims it kept one file across the reconnect.
    let recovery = Message::new(Body::RecoveryRequest(RecoveryRequest {
        syncshell_id: "shell-1".into(),
        peer_id: "peer-b".into(),
        completed_files: vec!["kept.mdl".into()],
        completed_hashes: vec![kept_hash.clone()],
    }));
    let framed = frame::encode(&recovery).unwrap();
    b.endpoint.send(Bytes::from(framed), 0).await.unwrap();

    // Only the missing file streams again.
    assert!(
        eventually(|| async {
            events_b
                .lock()
                .await
                .iter()
                .skip(before)
                .any(|e| matches!(e, SyncEvent::FileReceived { file_hash, .. } if *file_hash == lost_hash))
        })
        .await
    );
    let resent_kept = events_b
        .lock()
        .await
        .iter()
        .skip(before)
        .any(|e| matches!(e, SyncEvent::FileReceived { file_hash, .. } if *file_hash == kept_hash));
    assert!(!resent_kept, "completed file must not be resent");
}
