//! Binary framing for bulk file chunks.
//!
//! JSON-with-base64 is fine for control traffic but wasteful at tens of
//! thousands of 16 KiB chunks, so bulk chunks may travel in a compact
//! binary form instead. Receivers accept both encodings.
//!
//! Layout (all lengths little-endian u32, all length-prefixed fields raw
//! bytes):
//!
//! ```text
//! "FCHK" | session_id | chunk_index | total_chunks | channel_index
//!        | file_name  | file_hash   | data
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::SyncError;
use crate::message::FileChunkMessage;

pub const MAGIC: &[u8; 4] = b"FCHK";

/// Does this frame start with the binary chunk magic?
pub fn is_binary_chunk(frame: &[u8]) -> bool {
    frame.len() >= MAGIC.len() && &frame[..MAGIC.len()] == MAGIC
}

pub fn encode(chunk: &FileChunkMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        MAGIC.len()
            + 4 * 6
            + chunk.session_id.len()
            + chunk.file_name.len()
            + chunk.file_hash.len()
            + chunk.data.len(),
    );
    buf.put_slice(MAGIC);
    put_bytes(&mut buf, chunk.session_id.as_bytes());
    buf.put_u32_le(chunk.chunk_index);
    buf.put_u32_le(chunk.total_chunks);
    buf.put_u32_le(chunk.channel_index);
    put_bytes(&mut buf, chunk.file_name.as_bytes());
    put_bytes(&mut buf, chunk.file_hash.as_bytes());
    put_bytes(&mut buf, &chunk.data);
    buf.freeze()
}

pub fn decode(frame: &[u8]) -> Result<FileChunkMessage, SyncError> {
    if !is_binary_chunk(frame) {
        return Err(SyncError::Decode("missing FCHK magic".into()));
    }
    let mut cursor = &frame[MAGIC.len()..];

    let session_id = read_string(&mut cursor, "session_id")?;
    if cursor.remaining() < 12 {
        return Err(SyncError::Decode("truncated FCHK header".into()));
    }
    let chunk_index = cursor.get_u32_le();
    let total_chunks = cursor.get_u32_le();
    let channel_index = cursor.get_u32_le();
    let file_name = read_string(&mut cursor, "file_name")?;
    let file_hash = read_string(&mut cursor, "file_hash")?;
    let data = read_vec(&mut cursor, "data")?;
    if cursor.has_remaining() {
        return Err(SyncError::Decode(format!(
            "{} trailing bytes after FCHK frame",
            cursor.remaining()
        )));
    }

    Ok(FileChunkMessage {
        session_id,
        file_name,
        file_hash,
        chunk_index,
        total_chunks,
        channel_index,
        data,
    })
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn read_vec(cursor: &mut &[u8], field: &str) -> Result<Vec<u8>, SyncError> {
    if cursor.remaining() < 4 {
        return Err(SyncError::Decode(format!("truncated length for {field}")));
    }
    let len = cursor.get_u32_le() as usize;
    if cursor.remaining() < len {
        return Err(SyncError::Decode(format!(
            "{field} declares {len} bytes but only {} remain",
            cursor.remaining()
        )));
    }
    let mut out = vec![0; len];
    cursor.copy_to_slice(&mut out);
    Ok(out)
}

fn read_string(cursor: &mut &[u8], field: &str) -> Result<String, SyncError> {
    String::from_utf8(read_vec(cursor, field)?)
        .map_err(|e| SyncError::Decode(format!("{field} is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileChunkMessage {
        FileChunkMessage {
            session_id: "sess-1".into(),
            file_name: "chest.mdl".into(),
            file_hash: "AB".repeat(20),
            chunk_index: 3,
            total_chunks: 7,
            channel_index: 1,
            data: vec![0x42; 16 * 1024],
        }
    }

    #[test]
    fn round_trip() {
        let chunk = sample();
        let frame = encode(&chunk);
        assert!(is_binary_chunk(&frame));
        assert_eq!(decode(&frame).unwrap(), chunk);
    }

    #[test]
    fn empty_data_round_trips() {
        let mut chunk = sample();
        chunk.data.clear();
        assert_eq!(decode(&encode(&chunk)).unwrap(), chunk);
    }

    #[test]
    fn truncation_rejected_at_every_length() {
        let frame = encode(&sample());
        for cut in [3, 4, 8, 11, 20, frame.len() - 1] {
            assert!(decode(&frame[..cut]).is_err(), "cut={cut}");
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut frame = encode(&sample()).to_vec();
        frame[0] = b'X';
        assert!(decode(&frame).is_err());
        assert!(!is_binary_chunk(&frame));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = encode(&sample()).to_vec();
        frame.push(0);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn json_frames_are_not_binary_chunks() {
        assert!(!is_binary_chunk(br#"{"type":9}"#));
        assert!(!is_binary_chunk(b"FCH"));
    }
}
