//! attune-sync — transfer orchestration: the protocol dispatcher,
//! progressive and differential transfer machinery, coordinated sessions,
//! and the atomic apply service.

pub mod apply;
pub mod connection;
pub mod differential;
pub mod dispatcher;
pub mod loopback;
pub mod manifest;
pub mod orchestrator;
pub mod progressive;
pub mod recovery;
pub mod session;
pub mod transport;

pub use apply::{ApplicationResult, AppliedState, ApplyService, PeerState, Transaction};
pub use connection::SyncConnection;
pub use differential::{DifferentialSync, PeerManifest, SyncDelta};
pub use dispatcher::{Dispatcher, MessageHandler};
pub use manifest::{FileToSend, TransferManifest};
pub use orchestrator::{Orchestrator, Strategy, SyncEvent};
pub use session::{ChannelContract, ContractStatus, TransferSession};
pub use transport::{AppearanceSink, AppearanceSource, DataChannel};
