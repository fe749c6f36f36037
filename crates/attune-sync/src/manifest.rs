//! Transfer manifests — the balanced file-to-channel plan for coordinated
//! sessions, and its projection onto the wire.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use attune_core::hashing::sha256_hex;
use attune_core::message::{ModDataResponse, PlayerInfo, TransferredFile};
use attune_core::SyncError;

use crate::session::ChannelContract;

/// One file queued for transmission: the plan plus the bytes.
#[derive(Debug, Clone)]
pub struct FileToSend {
    pub game_path: String,
    /// Upper-hex SHA-1 of `contents`.
    pub hash: String,
    pub size_bytes: u64,
    pub contents: Bytes,
}

impl FileToSend {
    pub fn new(game_path: impl Into<String>, contents: Bytes) -> Self {
        let hash = attune_core::hashing::sha1_hex(&contents);
        Self {
            game_path: game_path.into(),
            hash,
            size_bytes: contents.len() as u64,
            contents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAssignment {
    pub file_hash: String,
    pub game_path: String,
    pub size_bytes: u64,
    pub assigned_channel: u32,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferManifest {
    pub session_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub total_channels: u32,
    pub total_size_bytes: u64,
    pub files: Vec<FileAssignment>,
}

impl TransferManifest {
    /// Plan a session: largest file first, each into the currently
    /// least-loaded channel. Keeps the spread between channels no larger
    /// than the largest single file.
    pub fn balanced(
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        files: &[FileToSend],
        total_channels: u32,
        chunk_size: usize,
    ) -> Self {
        let total_channels = total_channels.max(1);
        let mut order: Vec<&FileToSend> = files.iter().collect();
        order.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then(a.hash.cmp(&b.hash)));

        let mut load = vec![0u64; total_channels as usize];
        let mut assignments = Vec::with_capacity(files.len());
        for file in order {
            let channel = load
                .iter()
                .enumerate()
                .min_by_key(|(_, bytes)| **bytes)
                .map(|(index, _)| index)
                .unwrap_or(0);
            load[channel] += file.size_bytes;
            assignments.push(FileAssignment {
                file_hash: file.hash.clone(),
                game_path: file.game_path.clone(),
                size_bytes: file.size_bytes,
                assigned_channel: channel as u32,
                chunk_count: chunk_count(file.size_bytes, chunk_size),
            });
        }

        Self {
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            total_channels,
            total_size_bytes: files.iter().map(|f| f.size_bytes).sum(),
            files: assignments,
        }
    }

    /// Check the manifest invariants: unique hashes, exact size total,
    /// channels in range.
    pub fn validate(&self) -> Result<(), SyncError> {
        let mut seen = BTreeSet::new();
        for file in &self.files {
            if !seen.insert(&file.file_hash) {
                return Err(SyncError::Protocol(format!(
                    "duplicate file hash {} in manifest",
                    file.file_hash
                )));
            }
            if file.assigned_channel >= self.total_channels {
                return Err(SyncError::Protocol(format!(
                    "file {} assigned to channel {} of {}",
                    file.file_hash, file.assigned_channel, self.total_channels
                )));
            }
        }
        let sum: u64 = self.files.iter().map(|f| f.size_bytes).sum();
        if sum != self.total_size_bytes {
            return Err(SyncError::Protocol(format!(
                "manifest sizes sum to {sum}, declared {}",
                self.total_size_bytes
            )));
        }
        Ok(())
    }

    /// SHA-256 fingerprint of the manifest.
    pub fn identity_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&canonical)
    }

    /// Contracts as the sender sees them: every assignment is a promised
    /// send and a receipt expected back.
    pub fn sender_contracts(&self) -> HashMap<u32, ChannelContract> {
        let mut contracts = self.empty_contracts();
        for file in &self.files {
            let contract = contracts
                .entry(file.assigned_channel)
                .or_insert_with(|| ChannelContract::new(file.assigned_channel));
            contract.assign_send(&file.file_hash, file.size_bytes);
            contract.assign_receive(&file.file_hash, file.size_bytes);
        }
        contracts
    }

    /// Contracts as the receiver sees them: every assignment is a promised
    /// receive.
    pub fn receiver_contracts(&self) -> HashMap<u32, ChannelContract> {
        let mut contracts = self.empty_contracts();
        for file in &self.files {
            let contract = contracts
                .entry(file.assigned_channel)
                .or_insert_with(|| ChannelContract::new(file.assigned_channel));
            contract.assign_receive(&file.file_hash, file.size_bytes);
        }
        contracts
    }

    fn empty_contracts(&self) -> HashMap<u32, ChannelContract> {
        let mut contracts = HashMap::new();
        for channel in 0..self.total_channels {
            contracts.insert(channel, ChannelContract::new(channel));
        }
        // Channels with no assignment have nothing to promise; drop them so
        // an idle channel cannot hold the session open.
        contracts.retain(|channel, _| {
            self.files.iter().any(|f| f.assigned_channel == *channel)
        });
        contracts
    }

    /// Project the manifest onto the announcement message that precedes
    /// streaming. Contents stay empty; the bytes follow as chunks.
    pub fn to_response(&self, player_info: PlayerInfo) -> ModDataResponse {
        ModDataResponse {
            player_info,
            files: self
                .files
                .iter()
                .map(|f| TransferredFile {
                    game_path: f.game_path.clone(),
                    hash: f.file_hash.clone(),
                    size_bytes: f.size_bytes,
                    contents: Vec::new(),
                    assigned_channel: f.assigned_channel,
                    chunk_count: f.chunk_count,
                })
                .collect(),
            session_id: Some(self.session_id.clone()),
            total_channels: Some(self.total_channels),
            total_size_bytes: Some(self.total_size_bytes),
        }
    }

    /// Rebuild a manifest from a received announcement. `None` when the
    /// response is not a coordinated-session announcement.
    pub fn from_response(response: &ModDataResponse, sender_id: &str, receiver_id: &str) -> Option<Self> {
        let session_id = response.session_id.clone()?;
        Some(Self {
            session_id,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            total_channels: response.total_channels.unwrap_or(1),
            total_size_bytes: response
                .total_size_bytes
                .unwrap_or_else(|| response.files.iter().map(|f| f.size_bytes).sum()),
            files: response
                .files
                .iter()
                .map(|f| FileAssignment {
                    file_hash: f.hash.clone(),
                    game_path: f.game_path.clone(),
                    size_bytes: f.size_bytes,
                    assigned_channel: f.assigned_channel,
                    chunk_count: f.chunk_count,
                })
                .collect(),
        })
    }
}

pub fn chunk_count(size_bytes: u64, chunk_size: usize) -> u32 {
    (size_bytes.div_ceil(chunk_size as u64)).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, kib: usize) -> FileToSend {
        // Distinct fill byte per path so hashes differ.
        let fill = path.as_bytes().iter().fold(0u8, |a, b| a.wrapping_add(*b));
        FileToSend::new(path, Bytes::from(vec![fill; kib * 1024]))
    }

    #[test]
    fn balanced_spread_is_bounded_by_largest_file() {
        let files = vec![
            file("a.mdl", 100),
            file("b.tex", 30),
            file("c.tex", 30),
            file("d.tex", 30),
            file("e.scd", 10),
        ];
        let manifest = TransferManifest::balanced("s", "src", "dst", &files, 2, 16 * 1024);
        manifest.validate().unwrap();

        let mut load = [0u64; 2];
        for assignment in &manifest.files {
            load[assignment.assigned_channel as usize] += assignment.size_bytes;
        }
        let spread = load.iter().max().unwrap() - load.iter().min().unwrap();
        let largest = files.iter().map(|f| f.size_bytes).max().unwrap();
        assert!(spread <= largest, "spread {spread} exceeds largest file {largest}");
        // 100 on one channel, 30+30+30+10 on the other.
        assert_eq!(load.iter().sum::<u64>(), manifest.total_size_bytes);
    }

    #[test]
    fn single_channel_takes_everything() {
        let files = vec![file("a.mdl", 1), file("b.tex", 2)];
        let manifest = TransferManifest::balanced("s", "src", "dst", &files, 1, 16 * 1024);
        assert!(manifest.files.iter().all(|f| f.assigned_channel == 0));
    }

    #[test]
    fn validate_catches_duplicates_and_bad_channels() {
        let files = vec![file("a.mdl", 1)];
        let mut manifest = TransferManifest::balanced("s", "src", "dst", &files, 1, 16 * 1024);
        manifest.files.push(manifest.files[0].clone());
        assert!(manifest.validate().is_err());

        let mut manifest = TransferManifest::balanced("s", "src", "dst", &files, 1, 16 * 1024);
        manifest.files[0].assigned_channel = 9;
        assert!(manifest.validate().is_err());

        let mut manifest = TransferManifest::balanced("s", "src", "dst", &files, 1, 16 * 1024);
        manifest.total_size_bytes += 1;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn contracts_cover_both_directions() {
        let files = vec![file("a.mdl", 1), file("b.tex", 1)];
        let manifest = TransferManifest::balanced("s", "src", "dst", &files, 2, 16 * 1024);

        let sender = manifest.sender_contracts();
        let receiver = manifest.receiver_contracts();
        let sends: usize = sender.values().map(|c| c.files_to_send.len()).sum();
        let expected_receipts: usize = sender.values().map(|c| c.files_to_receive.len()).sum();
        let receives: usize = receiver.values().map(|c| c.files_to_receive.len()).sum();
        assert_eq!(sends, 2);
        assert_eq!(expected_receipts, 2);
        assert_eq!(receives, 2);
        assert!(receiver.values().all(|c| c.files_to_send.is_empty()));
    }

    #[test]
    fn response_round_trip() {
        let files = vec![file("a.mdl", 1), file("b.tex", 3)];
        let manifest = TransferManifest::balanced("s1", "src", "dst", &files, 2, 16 * 1024);
        let response = manifest.to_response(PlayerInfo::default());
        assert!(response.files.iter().all(|f| f.contents.is_empty()));

        let rebuilt = TransferManifest::from_response(&response, "src", "dst").unwrap();
        assert_eq!(rebuilt, manifest);
    }

    #[test]
    fn identity_hash_tracks_content() {
        let files = vec![file("a.mdl", 1)];
        let m1 = TransferManifest::balanced("s1", "src", "dst", &files, 1, 16 * 1024);
        let mut m2 = m1.clone();
        assert_eq!(m1.identity_hash(), m2.identity_hash());
        m2.files[0].size_bytes += 1;
        assert_ne!(m1.identity_hash(), m2.identity_hash());
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 16 * 1024), 1);
        assert_eq!(chunk_count(1, 16 * 1024), 1);
        assert_eq!(chunk_count(16 * 1024, 16 * 1024), 1);
        assert_eq!(chunk_count(16 * 1024 + 1, 16 * 1024), 2);
    }
}
