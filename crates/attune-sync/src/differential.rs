//! Differential sync — decide what actually needs to travel.
//!
//! Each peer remembers the manifest it last acknowledged from us. The next
//! sync diffs the current state against that memory and ships only files
//! whose hash changed. After a successful sync the stored manifest is
//! replaced, so the next delta is relative to the newly acknowledged
//! state.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use attune_core::hashing::sha256_hex;
use attune_core::Appearance;

use crate::manifest::{chunk_count, FileToSend};

/// A peer-visible snapshot of one player's state: per-path content hashes
/// plus the scalar fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerManifest {
    pub player_name: String,
    /// game path → upper-hex SHA-1.
    pub file_hashes: BTreeMap<String, String>,
    pub glamourer_design: String,
    pub customize_scale: String,
    pub heels_offset: f32,
    pub honorific_title: String,
    pub manipulation_data: String,
}

impl PeerManifest {
    /// SHA-256 fingerprint of the whole manifest. This is the state hash
    /// carried in player info: it moves when any file content, path, or
    /// scalar field moves, which is exactly when a re-apply is due.
    pub fn state_hash(&self) -> String {
        sha256_hex(&serde_json::to_vec(self).unwrap_or_default())
    }
}

/// What changed since the previous manifest.
#[derive(Debug, Clone, Default)]
pub struct SyncDelta {
    pub files_to_send: Vec<FileToSend>,
    /// Names of scalar fields that changed.
    pub scalar_changes: Vec<&'static str>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.files_to_send.is_empty() && self.scalar_changes.is_empty()
    }
}

/// Build the manifest describing `appearance` plus the given file set.
pub fn build_manifest(player_name: &str, appearance: &Appearance, files: &[FileToSend]) -> PeerManifest {
    PeerManifest {
        player_name: player_name.to_string(),
        file_hashes: files
            .iter()
            .map(|f| (f.game_path.clone(), f.hash.clone()))
            .collect(),
        glamourer_design: appearance.glamourer_design.clone(),
        customize_scale: appearance.customize_scale.clone(),
        heels_offset: appearance.heels_offset,
        honorific_title: appearance.honorific_title.clone(),
        manipulation_data: appearance.manipulation_data.clone(),
    }
}

/// Diff `current` against `previous`. A file is included iff its hash for
/// that path differs from the previous manifest (or the path is new).
/// `previous = None` means everything goes.
pub fn delta(
    current: &PeerManifest,
    previous: Option<&PeerManifest>,
    files: &[FileToSend],
) -> SyncDelta {
    let Some(previous) = previous else {
        return SyncDelta {
            files_to_send: files.to_vec(),
            scalar_changes: Vec::new(),
        };
    };

    let files_to_send = files
        .iter()
        .filter(|f| {
            current.file_hashes.get(&f.game_path) != previous.file_hashes.get(&f.game_path)
                || !previous.file_hashes.contains_key(&f.game_path)
        })
        .cloned()
        .collect();

    let mut scalar_changes = Vec::new();
    if current.glamourer_design != previous.glamourer_design {
        scalar_changes.push("glamourerDesign");
    }
    if current.customize_scale != previous.customize_scale {
        scalar_changes.push("customizeScale");
    }
    if current.heels_offset != previous.heels_offset {
        scalar_changes.push("heelsOffset");
    }
    if current.honorific_title != previous.honorific_title {
        scalar_changes.push("honorificTitle");
    }
    if current.manipulation_data != previous.manipulation_data {
        scalar_changes.push("manipulationData");
    }

    SyncDelta {
        files_to_send,
        scalar_changes,
    }
}

/// Whole-chunk size estimate for a delta, as the orchestrator budgets it.
pub fn estimate_size(delta: &SyncDelta, chunk_size: usize) -> u64 {
    delta
        .files_to_send
        .iter()
        .map(|f| chunk_count(f.size_bytes, chunk_size) as u64 * chunk_size as u64)
        .sum()
}

/// Per-peer manifest memory.
#[derive(Default)]
pub struct DifferentialSync {
    last_known: DashMap<String, PeerManifest>,
}

impl DifferentialSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_manifest(&self, peer_id: &str) -> Option<PeerManifest> {
        self.last_known.get(peer_id).map(|m| m.clone())
    }

    /// Record the manifest a peer has acknowledged. Call after every
    /// successful sync.
    pub fn store_peer_manifest(&self, peer_id: &str, manifest: PeerManifest) {
        self.last_known.insert(peer_id.to_string(), manifest);
    }

    pub fn forget_peer(&self, peer_id: &str) {
        self.last_known.remove(peer_id);
    }
}
