//! attune-core — wire protocol, framing, hashing, and configuration.
//! All other Attune crates depend on this one.

pub mod appearance;
pub mod chunk;
pub mod config;
pub mod error;
pub mod fchk;
pub mod frame;
pub mod hashing;
pub mod message;

pub use appearance::{Appearance, ComponentKind};
pub use error::SyncError;
pub use message::{Body, Message, MessageKind};
