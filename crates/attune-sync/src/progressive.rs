//! Progressive file transfer — streaming one file as an ordered run of
//! fixed-size chunks, and reassembling it on the far side.
//!
//! The sender paces itself (a short sleep every few chunks, a yield a
//! little less often) and retries each chunk with backoff before giving
//! up on the file. The receiver buffers per (session, file), verifies
//! SHA-1 on completion, and sweeps assemblies that have gone quiet.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};

use attune_core::config::TransferConfig;
use attune_core::hashing::sha1_hex;
use attune_core::message::{Body, FileChunkMessage};
use attune_core::{fchk, frame, Message, SyncError};

use crate::manifest::{chunk_count, FileToSend};
use crate::transport::DataChannel;

// ── Sending ───────────────────────────────────────────────────────────────────

pub struct ProgressiveSender {
    channel: Arc<dyn DataChannel>,
    config: TransferConfig,
}

/// Which encoding the chunks travel in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEncoding {
    /// Compact binary frames at the coordinated chunk size.
    Binary,
    /// Framed-JSON fallback at the streaming chunk size.
    Json,
}

impl ProgressiveSender {
    pub fn new(channel: Arc<dyn DataChannel>, config: TransferConfig) -> Self {
        Self { channel, config }
    }

    /// Stream one file on `channel_index`. Respects the session token:
    /// a cancellation between chunks aborts the file.
    pub async fn send_file(
        &self,
        session_id: &str,
        file: &FileToSend,
        channel_index: u32,
        encoding: ChunkEncoding,
        cancel: &mut broadcast::Receiver<()>,
    ) -> Result<(), SyncError> {
        let chunk_size = match encoding {
            ChunkEncoding::Binary => self.config.file_chunk_size,
            ChunkEncoding::Json => self.config.json_chunk_size,
        };
        let total_chunks = chunk_count(file.size_bytes, chunk_size);

        let mut pieces: Vec<&[u8]> = file.contents.chunks(chunk_size).collect();
        if pieces.is_empty() {
            // Zero-byte file still needs one (empty) chunk so the receiver
            // can complete and verify it.
            pieces.push(&[]);
        }

        for (index, piece) in pieces.into_iter().enumerate() {
            if cancelled(cancel) {
                return Err(SyncError::Cancelled);
            }

            let chunk = FileChunkMessage {
                session_id: session_id.to_string(),
                file_name: file.game_path.clone(),
                file_hash: file.hash.clone(),
                chunk_index: index as u32,
                total_chunks,
                channel_index,
                data: piece.to_vec(),
            };
            let wire = match encoding {
                ChunkEncoding::Binary => fchk::encode(&chunk),
                ChunkEncoding::Json => {
                    Bytes::from(frame::encode(&Message::new(Body::FileChunkMessage(chunk)))?)
                }
            };
            self.send_with_retry(wire, channel_index).await?;

            let sent = index as u32 + 1;
            if self.config.pause_every_chunks > 0 && sent % self.config.pause_every_chunks == 0 {
                tokio::time::sleep(Duration::from_millis(self.config.pause_ms)).await;
            } else if self.config.yield_every_chunks > 0
                && sent % self.config.yield_every_chunks == 0
            {
                tokio::task::yield_now().await;
            }
        }

        tracing::debug!(
            file = %file.game_path,
            bytes = file.size_bytes,
            chunks = total_chunks,
            channel = channel_index,
            "file streamed"
        );
        Ok(())
    }

    /// One chunk, up to `max_send_attempts` tries with doubling backoff.
    async fn send_with_retry(&self, wire: Bytes, channel_index: u32) -> Result<(), SyncError> {
        let mut last_error = SyncError::TransportClosed;
        for attempt in 0..self.config.max_send_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.send_backoff(attempt - 1)).await;
            }
            if !self.channel.is_open(channel_index) {
                last_error = SyncError::TransportClosed;
                continue;
            }
            match self.channel.send(wire.clone(), channel_index).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(channel = channel_index, attempt, error = %e, "chunk send failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

fn cancelled(cancel: &mut broadcast::Receiver<()>) -> bool {
    !matches!(cancel.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

// ── Receiving ─────────────────────────────────────────────────────────────────

/// A fully received, hash-verified file.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub session_id: String,
    pub file_name: String,
    pub file_hash: String,
    pub channel_index: u32,
    pub bytes: Bytes,
}

struct FileAssembly {
    pieces: BTreeMap<u32, Vec<u8>>,
    total_chunks: u32,
    channel_index: u32,
    last_chunk_at: Instant,
}

/// Buffers in-flight files per (session, file name).
pub struct FileReceiver {
    active: Mutex<HashMap<(String, String), FileAssembly>>,
    idle_max: Duration,
}

impl FileReceiver {
    pub fn new(idle_max: Duration) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            idle_max,
        }
    }

    /// Accept one chunk. Returns the completed file once all chunks are
    /// in and the SHA-1 matches. A mismatch discards the whole assembly
    /// and surfaces an integrity error for the caller to report.
    pub async fn add_chunk(
        &self,
        chunk: FileChunkMessage,
    ) -> Result<Option<CompletedFile>, SyncError> {
        if chunk.total_chunks == 0 || chunk.chunk_index >= chunk.total_chunks {
            tracing::warn!(
                file = %chunk.file_name,
                index = chunk.chunk_index,
                total = chunk.total_chunks,
                "malformed file chunk, dropping"
            );
            return Ok(None);
        }

        let key = (chunk.session_id.clone(), chunk.file_name.clone());
        let mut active = self.active.lock().await;
        let assembly = active.entry(key.clone()).or_insert_with(|| FileAssembly {
            pieces: BTreeMap::new(),
            total_chunks: chunk.total_chunks,
            channel_index: chunk.channel_index,
            last_chunk_at: Instant::now(),
        });

        if assembly.total_chunks != chunk.total_chunks {
            tracing::warn!(
                file = %chunk.file_name,
                expected = assembly.total_chunks,
                got = chunk.total_chunks,
                "total_chunks mismatch mid-file, dropping chunk"
            );
            return Ok(None);
        }
        // Duplicate delivery is a no-op.
        if assembly.pieces.contains_key(&chunk.chunk_index) {
            return Ok(None);
        }

        assembly.pieces.insert(chunk.chunk_index, chunk.data);
        assembly.last_chunk_at = Instant::now();
        if assembly.pieces.len() < assembly.total_chunks as usize {
            return Ok(None);
        }

        let assembly = active.remove(&key).expect("assembly present");
        drop(active);

        let mut bytes = Vec::new();
        for piece in assembly.pieces.values() {
            bytes.extend_from_slice(piece);
        }
        let actual = sha1_hex(&bytes);
        if !actual.eq_ignore_ascii_case(&chunk.file_hash) {
            tracing::warn!(file = %chunk.file_name, expected = %chunk.file_hash, actual = %actual, "file failed verification, discarding");
            return Err(SyncError::Integrity {
                path: chunk.file_name,
                expected: chunk.file_hash,
                actual,
            });
        }

        tracing::info!(
            file = %chunk.file_name,
            bytes = bytes.len(),
            chunks = assembly.total_chunks,
            "file received and verified"
        );
        Ok(Some(CompletedFile {
            session_id: chunk.session_id,
            file_name: chunk.file_name,
            file_hash: chunk.file_hash,
            channel_index: assembly.channel_index,
            bytes: Bytes::from(bytes),
        }))
    }

    /// Drop assemblies that have gone quiet. Returns how many were freed.
    pub async fn sweep_stale(&self) -> usize {
        let mut active = self.active.lock().await;
        let before = active.len();
        let idle_max = self.idle_max;
        active.retain(|(session, file), assembly| {
            let stale = assembly.last_chunk_at.elapsed() > idle_max;
            if stale {
                tracing::warn!(session = %session, file = %file, "dropping stale file assembly");
            }
            !stale
        });
        before - active.len()
    }

    pub async fn in_progress(&self) -> usize {
        self.active.lock().await.len()
    }
}
