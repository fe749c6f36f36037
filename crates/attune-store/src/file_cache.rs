//! Content-addressed asset file cache.
//!
//! Blobs are stored flat as `<cache_dir>/<SHA1>.cache`. Files are
//! immutable — if the hash exists, the content is correct. Writes are
//! atomic (temp file, then rename), so racing writers of the same hash
//! settle on bit-identical content and readers never observe a partial
//! blob.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use memmap2::Mmap;

use attune_core::hashing::sha1_hex;

use crate::types::FileEntry;

/// Extensions eligible for caching and transfer. Everything else is
/// ignored at the boundary.
pub const ALLOWED_EXTENSIONS: [&str; 14] = [
    "mdl", "tex", "mtrl", "tmb", "pap", "avfx", "atex", "sklb", "eid", "phyb", "pbd", "scd",
    "skp", "shpk",
];

/// Case-insensitive allow-list check.
pub fn is_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Content-addressed file cache.
pub struct FileCache {
    root: PathBuf,
    entries: DashMap<String, FileEntry>,
    /// Hashes with a copy in flight. At most one writer per hash does the
    /// work; latecomers skip it.
    in_flight: DashMap<String, ()>,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root: {}", root.display()))?;
        Ok(Self {
            root,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
        })
    }

    /// Observe `path`: hash it, copy the bytes into the cache if this
    /// content is new, and return its entry. Returns `None` for paths
    /// outside the extension allow-list.
    pub fn ensure(&self, path: &Path) -> Result<Option<FileEntry>> {
        if !is_allowed_extension(path) {
            return Ok(None);
        }

        let bytes = fs::read(path)
            .with_context(|| format!("failed to read asset: {}", path.display()))?;
        let hash = sha1_hex(&bytes);
        let blob = self.blob_path(&hash);

        if !blob.exists() && self.in_flight.insert(hash.clone(), ()).is_none() {
            let written = write_atomic(&blob, &bytes);
            self.in_flight.remove(&hash);
            written?;
            tracing::trace!(hash = %hash, bytes = bytes.len(), "asset blob cached");
        }

        let last_modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let entry = FileEntry {
            path: path.to_path_buf(),
            hash: hash.clone(),
            size: bytes.len() as u64,
            last_modified,
            cached_at: Utc::now(),
            cached_blob_location: blob,
        };
        self.entries.insert(hash, entry.clone());
        Ok(Some(entry))
    }

    /// Store already-received bytes under their hash (the receive path,
    /// where there is no source file on disk yet).
    pub fn put_bytes(&self, hash: &str, bytes: &[u8]) -> Result<PathBuf> {
        let blob = self.blob_path(hash);
        if !blob.exists() {
            write_atomic(&blob, bytes)?;
        }
        Ok(blob)
    }

    /// Read a cached blob back. The mapping is page-cache backed, so large
    /// blobs fault in from disk on demand.
    pub fn get_by_hash(&self, hash: &str) -> Result<Option<Bytes>> {
        let blob = self.blob_path(hash);
        if !blob.exists() {
            return Ok(None);
        }
        let file = fs::File::open(&blob)
            .with_context(|| format!("failed to open blob: {}", blob.display()))?;
        // Safety: opened read-only and never mutated through the map.
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap blob: {}", blob.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    pub fn has(&self, hash: &str) -> bool {
        self.blob_path(hash).exists()
    }

    pub fn entry(&self, hash: &str) -> Option<FileEntry> {
        self.entries.get(hash).map(|e| e.clone())
    }

    /// Drop entries cached before the cutoff and delete their blobs.
    /// Orphan blobs (no in-memory entry) age out by file mtime.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut removed = 0;

        let expired: Vec<(String, PathBuf)> = self
            .entries
            .iter()
            .filter(|e| e.cached_at < cutoff)
            .map(|e| (e.hash.clone(), e.cached_blob_location.clone()))
            .collect();
        for (hash, blob) in expired {
            self.entries.remove(&hash);
            if fs::remove_file(&blob).is_ok() {
                removed += 1;
            }
        }

        if let Ok(dir) = fs::read_dir(&self.root) {
            for file in dir.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("cache") {
                    continue;
                }
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                if self.entries.contains_key(stem) {
                    continue;
                }
                let stale = file
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|t| DateTime::<Utc>::from(t) < cutoff)
                    .unwrap_or(false);
                if stale && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "file cache cleanup");
        }
        removed
    }

    pub fn count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|dir| {
                dir.flatten()
                    .filter(|f| f.path().extension().and_then(|e| e.to_str()) == Some("cache"))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.entries.clear();
        if let Ok(dir) = fs::read_dir(&self.root) {
            for file in dir.flatten() {
                let _ = fs::remove_file(file.path());
            }
        }
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{hash}.cache"))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create temp blob: {}", tmp.display()))?;
        file.write_all(bytes).context("failed to write blob")?;
        file.sync_all().context("failed to sync blob")?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))
}
