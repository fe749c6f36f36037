//! Framing codec — the on-wire envelope around every control message.
//!
//! Layout:
//!
//! | Offset | Size           | Meaning                                   |
//! |--------|----------------|-------------------------------------------|
//! | 0      | 1              | flag: 0x00 = plain, 0x01 = gzip           |
//! | 1      | 4 (gzip only)  | original body size, little-endian u32     |
//! | rest   | n              | UTF-8 JSON body (gzip-inflated if flagged)|
//!
//! Decoding additionally accepts unframed raw JSON (first byte `{` or `[`)
//! from legacy senders, and strips embedded NUL bytes before parsing.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::SyncError;
use crate::message::Message;

pub const FLAG_PLAIN: u8 = 0x00;
pub const FLAG_GZIP: u8 = 0x01;

/// Bodies strictly larger than this are gzip-compressed.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// Encode a message into a framed byte buffer.
pub fn encode(message: &Message) -> Result<Vec<u8>, SyncError> {
    let body = serde_json::to_vec(&message.to_value()?)?;
    encode_body(&body)
}

/// Frame an already-serialized JSON body.
pub fn encode_body(body: &[u8]) -> Result<Vec<u8>, SyncError> {
    if body.len() > COMPRESS_THRESHOLD {
        let mut out = Vec::with_capacity(body.len() / 2 + 5);
        out.push(FLAG_GZIP);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        let mut encoder = GzEncoder::new(out, Compression::default());
        encoder.write_all(body)?;
        Ok(encoder.finish()?)
    } else {
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(FLAG_PLAIN);
        out.extend_from_slice(body);
        Ok(out)
    }
}

/// Decode a framed byte buffer into a message.
pub fn decode(frame: &[u8]) -> Result<Message, SyncError> {
    let mut body = decode_body(frame)?;
    // Some senders pad JSON with NULs; strip them before parsing.
    body.retain(|b| *b != 0);
    let value: serde_json::Value = serde_json::from_slice(&body)?;
    Message::from_value(value)
}

/// Unframe to the raw JSON body without parsing it.
pub fn decode_body(frame: &[u8]) -> Result<Vec<u8>, SyncError> {
    match frame.first() {
        None => Err(SyncError::Decode("empty frame".into())),
        Some(&FLAG_PLAIN) => Ok(frame[1..].to_vec()),
        Some(&FLAG_GZIP) => {
            if frame.len() < 5 {
                return Err(SyncError::Decode(format!(
                    "gzip frame too short: {} bytes",
                    frame.len()
                )));
            }
            let declared = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
            let mut body = Vec::with_capacity(declared);
            GzDecoder::new(&frame[5..])
                .read_to_end(&mut body)
                .map_err(|e| SyncError::Decode(format!("gzip inflate failed: {e}")))?;
            if body.len() != declared {
                return Err(SyncError::Decode(format!(
                    "inflated size {} does not match declared size {declared}",
                    body.len()
                )));
            }
            Ok(body)
        }
        // Unframed raw JSON from legacy senders.
        Some(&b'{') | Some(&b'[') => Ok(frame.to_vec()),
        Some(other) => Err(SyncError::Decode(format!(
            "unknown framing flag 0x{other:02x}"
        ))),
    }
}
