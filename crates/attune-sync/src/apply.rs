//! Atomic application of a reconstructed appearance, with a bounded
//! transaction history for rollback.
//!
//! An apply either commits fully — new state installed, transaction
//! recorded — or leaves the applied-state map untouched. The service owns
//! that map and the history; nothing else mutates them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use attune_core::config::ApplyConfig;
use attune_core::{Appearance, SyncError};
use attune_store::{is_allowed_extension, ComponentStore, FileCache};

use crate::transport::AppearanceSink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    pub player_id: String,
    pub state_hash: String,
    /// Tagged component refs that went into this state.
    pub applied_components: Vec<String>,
    pub applied_at: DateTime<Utc>,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub player_id: String,
    pub state_hash: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub previous_state: Option<AppliedState>,
    pub new_state: Option<AppliedState>,
}

/// What arrived from the peer for one player.
#[derive(Debug, Clone, Default)]
pub struct PeerState {
    pub player_name: String,
    pub appearance_hash: String,
    /// game path → upper-hex SHA-1 of the file that should back it.
    pub file_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationResult {
    pub success: bool,
    pub state_hash: String,
    pub transaction_id: Option<String>,
    pub message: Option<String>,
}

pub struct ApplyService {
    sink: Arc<dyn AppearanceSink>,
    store: Arc<ComponentStore>,
    cache: Arc<FileCache>,
    config: ApplyConfig,
    applied: Mutex<HashMap<String, AppliedState>>,
    transactions: Mutex<VecDeque<Transaction>>,
}

impl ApplyService {
    pub fn new(
        sink: Arc<dyn AppearanceSink>,
        store: Arc<ComponentStore>,
        cache: Arc<FileCache>,
        config: ApplyConfig,
    ) -> Self {
        Self {
            sink,
            store,
            cache,
            config,
            applied: Mutex::new(HashMap::new()),
            transactions: Mutex::new(VecDeque::new()),
        }
    }

    /// Does `player_id` need `state_hash` applied, or is it already worn?
    pub async fn needs_update(&self, player_id: &str, state_hash: &str) -> bool {
        self.applied
            .lock()
            .await
            .get(player_id)
            .map(|state| state.state_hash != state_hash)
            .unwrap_or(true)
    }

    pub async fn applied_state(&self, player_id: &str) -> Option<AppliedState> {
        self.applied.lock().await.get(player_id).cloned()
    }

    pub async fn transaction_history(&self) -> Vec<Transaction> {
        self.transactions.lock().await.iter().cloned().collect()
    }

    /// Reconstruct and apply `peer_state` to `player_id`.
    ///
    /// On success the new state is installed and a transaction recorded;
    /// on failure the applied-state map is unchanged.
    pub async fn apply_outfit_atomic(
        &self,
        player_id: &str,
        peer_state: &PeerState,
    ) -> ApplicationResult {
        let started_at = Utc::now();
        let transaction_id = uuid::Uuid::new_v4().to_string();

        if let Err(e) = self.wait_ready(player_id).await {
            return failure(&peer_state.appearance_hash, &e);
        }

        let previous_state = self.applied.lock().await.get(player_id).cloned();

        let (appearance, applied_components) = match self.resolve(peer_state) {
            Ok(resolved) => resolved,
            Err(e) => return failure(&peer_state.appearance_hash, &e),
        };

        if let Err(e) = self.sink.apply(&appearance, player_id).await {
            let e = SyncError::ApplyFailed(e.to_string());
            tracing::warn!(player = player_id, error = %e, "sink rejected appearance");
            self.push_transaction(Transaction {
                transaction_id,
                player_id: player_id.to_string(),
                state_hash: peer_state.appearance_hash.clone(),
                started_at,
                finished_at: Utc::now(),
                success: false,
                previous_state,
                new_state: None,
            })
            .await;
            return failure(&peer_state.appearance_hash, &e);
        }

        let new_state = AppliedState {
            player_id: player_id.to_string(),
            state_hash: peer_state.appearance_hash.clone(),
            applied_components,
            applied_at: Utc::now(),
            transaction_id: transaction_id.clone(),
        };
        self.applied
            .lock()
            .await
            .insert(player_id.to_string(), new_state.clone());
        self.push_transaction(Transaction {
            transaction_id: transaction_id.clone(),
            player_id: player_id.to_string(),
            state_hash: peer_state.appearance_hash.clone(),
            started_at,
            finished_at: Utc::now(),
            success: true,
            previous_state,
            new_state: Some(new_state),
        })
        .await;

        tracing::info!(player = player_id, state = %peer_state.appearance_hash, "appearance applied");
        ApplicationResult {
            success: true,
            state_hash: peer_state.appearance_hash.clone(),
            transaction_id: Some(transaction_id),
            message: None,
        }
    }

    /// Restore the state a transaction replaced, or remove the player's
    /// entry when there was none.
    pub async fn rollback(&self, transaction_id: &str) -> Result<(), SyncError> {
        let transaction = self
            .transactions
            .lock()
            .await
            .iter()
            .find(|t| t.transaction_id == transaction_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("transaction {transaction_id}")))?;

        let mut applied = self.applied.lock().await;
        match &transaction.previous_state {
            Some(previous) => {
                applied.insert(transaction.player_id.clone(), previous.clone());
                tracing::info!(
                    player = %transaction.player_id,
                    state = %previous.state_hash,
                    "rolled back to previous state"
                );
            }
            None => {
                applied.remove(&transaction.player_id);
                tracing::info!(player = %transaction.player_id, "rolled back to no state");
            }
        }
        Ok(())
    }

    /// Resolve the recipe into a concrete appearance, keeping only mod
    /// paths that pass the allow-list and are actually backed by a cached
    /// blob.
    fn resolve(&self, peer_state: &PeerState) -> Result<(Appearance, Vec<String>), SyncError> {
        let mut appearance = self
            .store
            .get_appearance(&peer_state.player_name, &peer_state.appearance_hash)
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "recipe {}:{}",
                    peer_state.player_name, peer_state.appearance_hash
                ))
            })?;

        appearance.mod_paths.retain(|path| {
            if !is_allowed_extension(std::path::Path::new(path)) {
                tracing::warn!(path = %path, "dropping mod path outside allow-list");
                return false;
            }
            let backed = peer_state
                .file_hashes
                .get(path)
                .map(|hash| self.cache.has(hash))
                .unwrap_or(false);
            if !backed {
                tracing::warn!(path = %path, "dropping mod path with no cached blob");
            }
            backed
        });

        let applied_components = self
            .store
            .get_recipe(&peer_state.player_name, &peer_state.appearance_hash)
            .map(|recipe| recipe.refs)
            .unwrap_or_default();
        Ok((appearance, applied_components))
    }

    /// Poll the sink's readiness, bounded by the configured timeout.
    async fn wait_ready(&self, player_id: &str) -> Result<(), SyncError> {
        let deadline = Duration::from_secs(self.config.ready_timeout_secs);
        let started = std::time::Instant::now();
        while !self.sink.is_ready(player_id) {
            if started.elapsed() >= deadline {
                return Err(SyncError::Timeout(deadline));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    async fn push_transaction(&self, transaction: Transaction) {
        let mut transactions = self.transactions.lock().await;
        transactions.push_back(transaction);
        while transactions.len() > self.config.max_transactions {
            transactions.pop_front();
        }
    }
}

fn failure(state_hash: &str, error: &SyncError) -> ApplicationResult {
    ApplicationResult {
        success: false,
        state_hash: state_hash.to_string(),
        transaction_id: None,
        message: Some(error.to_string()),
    }
}
