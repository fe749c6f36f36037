//! Chunked control messages — splitting oversized frames and gluing them
//! back together.
//!
//! A framed message larger than the chunk size is split into ordered
//! `ChunkedMessage` sub-messages sharing a random `chunk_id`. Chunks of one
//! id arrive in sender order but interleave freely with other ids on the
//! wire; reassembly buffers are independent per id.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::SyncError;
use crate::frame;
use crate::message::{Body, ChunkedMessage, Message};

/// Chunk size for control traffic.
pub const CONTROL_CHUNK_SIZE: usize = 1024;

/// Split a message into `ChunkedMessage`s if its framed form exceeds
/// `chunk_size`; otherwise return it unchanged. Chunking operates on the
/// framed bytes, so the body stays compressed in transit.
pub fn split_message(message: &Message, chunk_size: usize) -> Result<Vec<Message>, SyncError> {
    let framed = frame::encode(message)?;
    if framed.len() <= chunk_size {
        return Ok(vec![message.clone()]);
    }

    let chunk_id = uuid::Uuid::new_v4().to_string();
    let total_chunks = framed.len().div_ceil(chunk_size) as u32;

    let mut metadata = HashMap::new();
    metadata.insert("messageId".to_string(), message.message_id.clone());
    metadata.insert("timestamp".to_string(), message.timestamp.to_string());
    if let Some(ref to) = message.response_to {
        metadata.insert("responseTo".to_string(), to.clone());
    }

    Ok(framed
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, piece)| {
            Message::new(Body::ChunkedMessage(ChunkedMessage {
                chunk_id: chunk_id.clone(),
                chunk_index: index as u32,
                total_chunks,
                original_message_type: message.kind().code(),
                chunk_data: piece.to_vec(),
                message_metadata: metadata.clone(),
            }))
        })
        .collect())
}

struct ChunkBuffer {
    data: Vec<u8>,
    received: Vec<bool>,
    received_count: u32,
    total_chunks: u32,
    last_chunk_len: usize,
    last_activity: Instant,
}

/// Buffers in-flight chunked messages and yields the reconstructed framed
/// body once every chunk of an id has arrived.
///
/// Malformed chunks are logged and dropped; they never abort the session.
pub struct Reassembler {
    buffers: HashMap<String, ChunkBuffer>,
    chunk_size: usize,
}

impl Reassembler {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            chunk_size,
        }
    }

    /// Accept one chunk. Returns the reconstructed framed body when this
    /// chunk completes its message. Re-delivery of an already-received
    /// index is a no-op.
    pub fn insert(&mut self, chunk: &ChunkedMessage) -> Option<Bytes> {
        if chunk.total_chunks == 0 {
            tracing::warn!(chunk_id = %chunk.chunk_id, "chunk with zero total_chunks, dropping");
            return None;
        }
        if chunk.chunk_index >= chunk.total_chunks {
            tracing::warn!(
                chunk_id = %chunk.chunk_id,
                index = chunk.chunk_index,
                total = chunk.total_chunks,
                "chunk index out of range, dropping"
            );
            return None;
        }
        if chunk.chunk_data.is_empty() {
            tracing::warn!(chunk_id = %chunk.chunk_id, index = chunk.chunk_index, "empty chunk, dropping");
            return None;
        }

        let chunk_size = self.chunk_size;
        let buffer = self
            .buffers
            .entry(chunk.chunk_id.clone())
            .or_insert_with(|| ChunkBuffer {
                data: vec![0; chunk.total_chunks as usize * chunk_size],
                received: vec![false; chunk.total_chunks as usize],
                received_count: 0,
                total_chunks: chunk.total_chunks,
                last_chunk_len: 0,
                last_activity: Instant::now(),
            });

        if buffer.total_chunks != chunk.total_chunks {
            tracing::warn!(
                chunk_id = %chunk.chunk_id,
                expected = buffer.total_chunks,
                got = chunk.total_chunks,
                "total_chunks mismatch within one chunk id, dropping"
            );
            return None;
        }
        if buffer.received[chunk.chunk_index as usize] {
            return None;
        }

        let offset = chunk.chunk_index as usize * chunk_size;
        if offset + chunk.chunk_data.len() > buffer.data.len() {
            tracing::warn!(
                chunk_id = %chunk.chunk_id,
                index = chunk.chunk_index,
                len = chunk.chunk_data.len(),
                "chunk would overflow its buffer, dropping"
            );
            return None;
        }

        buffer.data[offset..offset + chunk.chunk_data.len()].copy_from_slice(&chunk.chunk_data);
        buffer.received[chunk.chunk_index as usize] = true;
        buffer.received_count += 1;
        buffer.last_activity = Instant::now();
        if chunk.chunk_index == chunk.total_chunks - 1 {
            buffer.last_chunk_len = chunk.chunk_data.len();
        }

        if buffer.received_count < buffer.total_chunks {
            return None;
        }

        let mut complete = self.buffers.remove(&chunk.chunk_id)?;
        let actual_size =
            (complete.total_chunks as usize - 1) * chunk_size + complete.last_chunk_len;
        complete.data.truncate(actual_size);
        Some(Bytes::from(complete.data))
    }

    /// Drop buffers that have seen no chunk within `max_idle`.
    pub fn sweep(&mut self, max_idle: Duration) {
        self.buffers.retain(|chunk_id, buffer| {
            let stale = buffer.last_activity.elapsed() > max_idle;
            if stale {
                tracing::warn!(
                    chunk_id = %chunk_id,
                    received = buffer.received_count,
                    total = buffer.total_chunks,
                    "dropping stale chunk buffer"
                );
            }
            !stale
        });
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}
