//! Attune integration harness.
//!
//! Each test wires two complete engine stacks back to back over the
//! in-process loopback transport, with their own temp storage roots.
//! Everything a real host would inject (transport, appearance source,
//! appearance sink) is faked here; everything else is the real engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use attune_core::config::SyncConfig;
use attune_core::{Appearance, SyncError};
use attune_sync::loopback::{self, LoopbackEndpoint, LoopbackIncoming};
use attune_sync::orchestrator::SyncEvent;
use attune_sync::{AppearanceSink, AppearanceSource, SyncConnection};

mod apply;
mod coordinated;
mod differential;
mod direct;
mod progressive;
mod protocol;

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ── Fakes for the host-side seams ─────────────────────────────────────────────

/// Source serving a configurable appearance.
pub struct FakeSource {
    pub name: String,
    pub appearance: Mutex<Appearance>,
}

#[async_trait]
impl AppearanceSource for FakeSource {
    fn player_name(&self) -> String {
        self.name.clone()
    }

    async fn current_appearance(&self) -> Result<Appearance, SyncError> {
        Ok(self.appearance.lock().await.clone())
    }
}

/// Sink recording every applied appearance.
#[derive(Default)]
pub struct RecordingSink {
    pub applied: Mutex<Vec<(String, Appearance)>>,
}

#[async_trait]
impl AppearanceSink for RecordingSink {
    fn is_ready(&self, _player_id: &str) -> bool {
        true
    }

    async fn apply(&self, appearance: &Appearance, player_id: &str) -> Result<(), SyncError> {
        self.applied
            .lock()
            .await
            .push((player_id.to_string(), appearance.clone()));
        Ok(())
    }
}

// ── Peers ─────────────────────────────────────────────────────────────────────

pub struct TestPeer {
    pub connection: Arc<SyncConnection>,
    pub source: Arc<FakeSource>,
    pub sink: Arc<RecordingSink>,
    pub endpoint: Arc<LoopbackEndpoint>,
    pub dir: tempfile::TempDir,
}

impl TestPeer {
    pub async fn applied_count(&self) -> usize {
        self.sink.applied.lock().await.len()
    }

    pub async fn last_applied(&self) -> Option<(String, Appearance)> {
        self.sink.applied.lock().await.last().cloned()
    }

    /// Write an allow-listed asset under this peer's temp root.
    pub fn write_asset(&self, name: &str, bytes: &[u8]) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path.to_string_lossy().into_owned()
    }
}

/// Two connected peers, `channels` sub-channels each.
pub fn peer_pair(channels: u32) -> Result<(TestPeer, TestPeer)> {
    init_tracing();
    let ((endpoint_a, incoming_a), (endpoint_b, incoming_b)) = loopback::pair(channels);
    let a = build_peer("peer-a", "peer-b", "Aila Swift", endpoint_a, incoming_a)?;
    let b = build_peer("peer-b", "peer-a", "Borel Stone", endpoint_b, incoming_b)?;
    Ok((a, b))
}

fn build_peer(
    local_id: &str,
    peer_id: &str,
    player: &str,
    endpoint: Arc<LoopbackEndpoint>,
    incoming: LoopbackIncoming,
) -> Result<TestPeer> {
    build_peer_with_members(local_id, peer_id, player, endpoint, incoming, None)
}

pub fn build_peer_with_members(
    local_id: &str,
    peer_id: &str,
    player: &str,
    endpoint: Arc<LoopbackEndpoint>,
    incoming: LoopbackIncoming,
    members: Option<Arc<dyn attune_sync::connection::MemberProvider>>,
) -> Result<TestPeer> {
    let dir = tempfile::tempdir()?;
    let mut config = SyncConfig::default();
    config.storage.plugin_dir = dir.path().to_path_buf();
    // Keep the pacing out of test wall-clock.
    config.transfer.pause_ms = 0;
    config.transfer.send_backoff_ms = 1;

    let source = Arc::new(FakeSource {
        name: player.to_string(),
        appearance: Mutex::new(Appearance::default()),
    });
    let sink = Arc::new(RecordingSink::default());
    let connection = SyncConnection::new(
        config,
        local_id,
        peer_id,
        endpoint.clone(),
        source.clone(),
        sink.clone(),
        members,
        1024,
    )?;
    connection.spawn_pump(incoming);
    Ok(TestPeer {
        connection,
        source,
        sink,
        endpoint,
        dir,
    })
}

// ── Async test helpers ────────────────────────────────────────────────────────

/// Poll `check` until it holds or ten seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collect a connection's events in the background.
pub fn collect_events(connection: &Arc<SyncConnection>) -> Arc<Mutex<Vec<SyncEvent>>> {
    let mut rx = connection.orchestrator().subscribe_events();
    let events = Arc::new(Mutex::new(Vec::new()));
    let out = events.clone();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            out.lock().await.push(event);
        }
    });
    events
}
