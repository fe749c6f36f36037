//! Seams to the outside world.
//!
//! The engine never opens sockets and never touches the game. It talks to
//! an already-established datagram transport through [`DataChannel`], reads
//! local state through [`AppearanceSource`], and writes reconstructed state
//! through [`AppearanceSink`]. Hosts implement these three traits; the
//! engine owns everything in between.

use async_trait::async_trait;
use bytes::Bytes;

use attune_core::{Appearance, SyncError};

/// An established bidirectional datagram transport with N sub-channels.
///
/// Channel 0 carries control traffic; the rest carry bulk file chunks.
/// Sends on one channel preserve order; channels are independent.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, bytes: Bytes, channel: u32) -> Result<(), SyncError>;

    /// Whether `channel` is currently open for sending.
    fn is_open(&self, channel: u32) -> bool;

    /// Number of sub-channels, including the control channel.
    fn channel_count(&self) -> u32;
}

/// Read access to the local player's appearance state.
#[async_trait]
pub trait AppearanceSource: Send + Sync {
    fn player_name(&self) -> String;

    async fn current_appearance(&self) -> Result<Appearance, SyncError>;
}

/// Applies a reconstructed appearance to a named in-game target.
#[async_trait]
pub trait AppearanceSink: Send + Sync {
    /// Whether the target can be mutated right now (loaded, not zoning).
    fn is_ready(&self, player_id: &str) -> bool;

    async fn apply(&self, appearance: &Appearance, player_id: &str) -> Result<(), SyncError>;
}
