//! Channel negotiation and post-reconnect recovery.
//!
//! Negotiation caps the session's sub-channel count by the more
//! memory-constrained peer. After a transport loss, the receiver reports
//! what it already holds so the sender can resume with a delta instead of
//! starting over.

use attune_core::message::{ChannelNegotiation, ChannelNegotiationResponse, RecoveryRequest};

use crate::manifest::FileToSend;

/// Answer a peer's channel negotiation.
///
/// The agreed count is `min(requested, limiting_memory / per-channel
/// budget)`, never below one, where the limiting memory is the smaller of
/// the two peers' advertisements.
pub fn negotiate_channels(
    negotiation: &ChannelNegotiation,
    local_available_memory_mb: u64,
    per_channel_budget_mb: u64,
) -> ChannelNegotiationResponse {
    let limiting_memory_mb = negotiation.available_memory_mb.min(local_available_memory_mb);
    let budget = per_channel_budget_mb.max(1);
    let by_memory = (limiting_memory_mb / budget).max(1) as u32;
    let agreed = negotiation.requested_channels.clamp(1, by_memory);
    ChannelNegotiationResponse {
        my_channels: agreed,
        your_channels: agreed,
        limiting_memory_mb,
    }
}

/// Final channel count from a negotiation response.
pub fn agreed_channels(response: &ChannelNegotiationResponse) -> u32 {
    response.my_channels.min(response.your_channels).max(1)
}

/// Files still owed after a reconnect: everything whose hash the receiver
/// did not list as already complete.
pub fn resume_delta(files: Vec<FileToSend>, recovery: &RecoveryRequest) -> Vec<FileToSend> {
    files
        .into_iter()
        .filter(|file| {
            !recovery
                .completed_hashes
                .iter()
                .any(|done| done.eq_ignore_ascii_case(&file.hash))
        })
        .collect()
}
