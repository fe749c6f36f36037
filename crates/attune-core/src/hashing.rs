//! Hash helpers.
//!
//! File content and transfer signatures use SHA-1; data fingerprints and
//! component identity use SHA-256. All hashes are rendered upper-case hex.

use sha1::{Digest, Sha1};
use sha2::Sha256;

/// SHA-1 of `data`, upper-case hex. Used for file blobs and transfer
/// signatures.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(data))
}

/// SHA-256 of `data`, upper-case hex. Used for manifest identity and
/// receiver signatures.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(data))
}

/// Length a component hash is truncated to.
pub const COMPONENT_HASH_LEN: usize = 16;

/// Component identity — SHA-256 of the component's data, or of its
/// identifier when the data is empty, truncated to [`COMPONENT_HASH_LEN`]
/// hex chars. The truncation policy must never change within a deployment.
pub fn component_hash(identifier: &str, data: &str) -> String {
    let source = if data.is_empty() { identifier } else { data };
    let mut digest = sha256_hex(source.as_bytes());
    digest.truncate(COMPONENT_HASH_LEN);
    digest
}
