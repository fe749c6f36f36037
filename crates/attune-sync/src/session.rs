//! Transfer sessions and per-channel contracts.
//!
//! A contract is the ledger for one (session, channel) pair. On the
//! sending side, `files_to_send` is the channel's assignment and
//! `files_to_receive` the receipt set expected back for those files; on
//! the receiving side only `files_to_receive` is populated. A contract is
//! `Complete` exactly when both ledgers are settled, which is what gates
//! the channel-close high-five.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use attune_core::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractStatus {
    Assigned,
    Active,
    /// All local sends done, remote receives still outstanding.
    SendComplete,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelContract {
    pub channel_id: u32,
    pub files_to_send: BTreeSet<String>,
    pub files_to_receive: BTreeSet<String>,
    pub completed_sends: BTreeSet<String>,
    pub completed_receives: BTreeSet<String>,
    pub total_send_bytes: u64,
    pub total_receive_bytes: u64,
    pub status: ContractStatus,
}

impl ChannelContract {
    pub fn new(channel_id: u32) -> Self {
        Self {
            channel_id,
            files_to_send: BTreeSet::new(),
            files_to_receive: BTreeSet::new(),
            completed_sends: BTreeSet::new(),
            completed_receives: BTreeSet::new(),
            total_send_bytes: 0,
            total_receive_bytes: 0,
            status: ContractStatus::Assigned,
        }
    }

    pub fn assign_send(&mut self, file_hash: &str, size_bytes: u64) {
        self.files_to_send.insert(file_hash.to_string());
        self.total_send_bytes += size_bytes;
    }

    pub fn assign_receive(&mut self, file_hash: &str, size_bytes: u64) {
        self.files_to_receive.insert(file_hash.to_string());
        self.total_receive_bytes += size_bytes;
    }

    /// Mark one promised send as done.
    pub fn record_send(&mut self, file_hash: &str) -> Result<(), SyncError> {
        if !self.files_to_send.contains(file_hash) {
            return Err(SyncError::Protocol(format!(
                "file {file_hash} was not assigned to channel {}",
                self.channel_id
            )));
        }
        if self.status == ContractStatus::Assigned {
            self.status = ContractStatus::Active;
        }
        self.completed_sends.insert(file_hash.to_string());
        self.advance();
        Ok(())
    }

    /// Mark one promised receive (or receipt for a sent file) as done.
    pub fn record_receive(&mut self, file_hash: &str) -> Result<(), SyncError> {
        if !self.files_to_receive.contains(file_hash) {
            return Err(SyncError::Protocol(format!(
                "file {file_hash} was not expected on channel {}",
                self.channel_id
            )));
        }
        if self.status == ContractStatus::Assigned {
            self.status = ContractStatus::Active;
        }
        self.completed_receives.insert(file_hash.to_string());
        self.advance();
        Ok(())
    }

    pub fn fail(&mut self) {
        if !matches!(self.status, ContractStatus::Complete) {
            self.status = ContractStatus::Failed;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ContractStatus::Complete
    }

    fn advance(&mut self) {
        if matches!(self.status, ContractStatus::Complete | ContractStatus::Failed) {
            return;
        }
        let sends_done = self.completed_sends == self.files_to_send;
        let receives_done = self.completed_receives == self.files_to_receive;
        self.status = match (sends_done, receives_done) {
            (true, true) => ContractStatus::Complete,
            (true, false) => ContractStatus::SendComplete,
            _ => ContractStatus::Active,
        };
    }
}

/// The lifetime of one coordinated multi-file transfer between two peers.
/// The orchestrator exclusively owns live sessions; everything long-running
/// inside one is cancellable through its token.
pub struct TransferSession {
    pub session_id: String,
    pub peer_id: String,
    pub started_at: Instant,
    contracts: Mutex<HashMap<u32, ChannelContract>>,
    last_activity: Mutex<Instant>,
    cancel: broadcast::Sender<()>,
}

/// What a receive/receipt did to the session's ledgers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionProgress {
    pub channel_id: u32,
    pub contract_complete: bool,
    pub session_complete: bool,
}

impl TransferSession {
    pub fn new(session_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        let (cancel, _) = broadcast::channel(1);
        Self {
            session_id: session_id.into(),
            peer_id: peer_id.into(),
            started_at: Instant::now(),
            contracts: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            cancel,
        }
    }

    /// Subscribe to session cancellation.
    pub fn cancel_token(&self) -> broadcast::Receiver<()> {
        self.cancel.subscribe()
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(());
    }

    pub async fn install_contracts(&self, contracts: HashMap<u32, ChannelContract>) {
        *self.contracts.lock().await = contracts;
    }

    pub async fn record_send(&self, channel_id: u32, file_hash: &str) -> Result<(), SyncError> {
        self.touch().await;
        let mut contracts = self.contracts.lock().await;
        let contract = contracts
            .get_mut(&channel_id)
            .ok_or_else(|| SyncError::Protocol(format!("no contract for channel {channel_id}")))?;
        contract.record_send(file_hash)
    }

    /// Record a receive on the channel whose contract expects `file_hash`.
    /// Receipts do not carry a channel index, so the contract is found by
    /// its ledger.
    pub async fn record_receive(&self, file_hash: &str) -> Result<SessionProgress, SyncError> {
        self.touch().await;
        let mut contracts = self.contracts.lock().await;
        let contract = contracts
            .values_mut()
            .find(|c| c.files_to_receive.contains(file_hash))
            .ok_or_else(|| {
                SyncError::Protocol(format!("no contract expects file {file_hash}"))
            })?;
        contract.record_receive(file_hash)?;
        let channel_id = contract.channel_id;
        let contract_complete = contract.is_complete();
        let session_complete = contracts.values().all(ChannelContract::is_complete);
        Ok(SessionProgress {
            channel_id,
            contract_complete,
            session_complete,
        })
    }

    pub async fn fail_channel(&self, channel_id: u32) {
        if let Some(contract) = self.contracts.lock().await.get_mut(&channel_id) {
            contract.fail();
        }
    }

    pub async fn is_complete(&self) -> bool {
        let contracts = self.contracts.lock().await;
        !contracts.is_empty() && contracts.values().all(ChannelContract::is_complete)
    }

    pub async fn contract(&self, channel_id: u32) -> Option<ChannelContract> {
        self.contracts.lock().await.get(&channel_id).cloned()
    }

    pub async fn contract_snapshot(&self) -> Vec<ChannelContract> {
        let mut contracts: Vec<_> = self.contracts.lock().await.values().cloned().collect();
        contracts.sort_by_key(|c| c.channel_id);
        contracts
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }
}

/// Live sessions, keyed by session id. Shared across tasks.
pub type SessionTable = Arc<DashMap<String, Arc<TransferSession>>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}
