//! Persisted data model for the stores.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use attune_core::ComponentKind;

/// One observed asset file. `cached_blob_location` names a file on disk
/// whose SHA-1 equals `hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Upper-hex SHA-1 of the file bytes.
    pub hash: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
    pub cached_blob_location: PathBuf,
}

/// A content-addressed unit of an appearance: one blob, one scalar, one
/// path list. Reference-counted; recipes point at components by hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub hash: String,
    pub kind: ComponentKind,
    pub identifier: String,
    #[serde(default)]
    pub data: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub reference_count: u64,
}

/// A persisted, ordered reference list that reconstructs an appearance
/// from stored components. Refs are `"<tag>:<hash>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub appearance_hash: String,
    pub player_name: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub refs: Vec<String>,
}

impl Recipe {
    pub fn key(&self) -> String {
        recipe_key(&self.player_name, &self.appearance_hash)
    }

    /// On-disk file name; `:` is not filesystem-safe and becomes `_`.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.key().replace(':', "_"))
    }
}

pub fn recipe_key(player_name: &str, appearance_hash: &str) -> String {
    format!("{player_name}:{appearance_hash}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub components: usize,
    pub recipes: usize,
    pub component_bytes: u64,
    pub total_references: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub unique_components: usize,
    pub total_references: u64,
    /// Bytes that re-referencing spared us from storing again.
    pub bytes_saved: u64,
}
