//! Transfer orchestrator — strategy choice, multi-channel dispatch, and
//! the coordinated manifest/receipt/high-five protocol.
//!
//! Outbound, a sync is: diff against what the peer last acknowledged,
//! pick a strategy by payload size, announce, stream, remember. Inbound,
//! the orchestrator tracks expected transfers per session, turns finished
//! chunk runs into verified cached files, and answers with receipts. A
//! coordinated session closes channel by channel through high-fives.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use attune_core::config::SyncConfig;
use attune_core::hashing::sha256_hex;
use attune_core::message::{
    Body, ChannelCompletionHighFive, ErrorMessage, FileChunkMessage, FileCompletionReceipt,
    ModDataResponse, PlayerInfo, SyncComplete, TransferredFile,
};
use attune_core::{Appearance, Message, SyncError};
use attune_store::{ComponentStore, FileCache};

use crate::differential::{self, DifferentialSync, PeerManifest};
use crate::dispatcher::Dispatcher;
use crate::manifest::{FileToSend, TransferManifest};
use crate::progressive::{ChunkEncoding, CompletedFile, FileReceiver, ProgressiveSender};
use crate::session::{new_session_table, SessionTable, TransferSession};
use crate::transport::DataChannel;

/// Channel 0 carries announcements, receipts, and everything else small.
pub const CONTROL_CHANNEL: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Everything inline in one response.
    Direct,
    /// Announce, then stream chunks.
    Progressive,
    /// Diff against the peer's last manifest, then stream the changes.
    Differential,
}

/// Payload size decides. The differential path needs a previous manifest
/// to diff against; without one even a huge payload streams progressively.
pub fn choose_strategy(
    total_bytes: u64,
    has_previous_manifest: bool,
    config: &attune_core::config::TransferConfig,
) -> Strategy {
    if total_bytes <= config.direct_limit_bytes {
        Strategy::Direct
    } else if total_bytes > config.progressive_limit_bytes && has_previous_manifest {
        Strategy::Differential
    } else {
        Strategy::Progressive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The delta was empty: nothing sent, nothing owed.
    AlreadyInSync,
    Sent { strategy: Strategy, files: usize },
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    SessionCompleted {
        session_id: String,
        peer_id: String,
    },
    ChannelComplete {
        session_id: String,
        channel_id: u32,
    },
    FileReceived {
        session_id: String,
        game_path: String,
        file_hash: String,
    },
    TransferFailed {
        session_id: String,
        channel_id: u32,
        reason: String,
    },
    /// The peer acknowledged an uncoordinated sync.
    SyncAcknowledged {
        processed_files: u64,
        total_bytes: u64,
    },
    /// A reconnect offer/answer to relay through the host.
    ReconnectSignal {
        peer_id: String,
        payload: String,
        offer: bool,
    },
    Error {
        error_code: String,
        error_description: String,
        failed_operation: Option<String>,
    },
}

/// A fully received state, ready for the apply service.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub session_id: String,
    pub peer_id: String,
    pub player_info: PlayerInfo,
    pub file_hashes: BTreeMap<String, String>,
    pub processed_files: u64,
    pub total_bytes: u64,
}

/// What one inbound chunk produced: messages to send back, and possibly
/// the whole transfer.
#[derive(Debug, Default)]
pub struct ChunkDisposition {
    pub replies: Vec<Message>,
    pub completed: Option<CompletedTransfer>,
}

/// Inbound bookkeeping for one announced transfer.
struct ExpectedTransfer {
    peer_id: String,
    player_info: PlayerInfo,
    /// game path → hash, as announced.
    expected: BTreeMap<String, String>,
    received: BTreeSet<String>,
    received_bytes: u64,
    coordinated: bool,
}

pub struct Orchestrator {
    config: SyncConfig,
    local_id: String,
    channel: Arc<dyn DataChannel>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<ComponentStore>,
    cache: Arc<FileCache>,
    differential: DifferentialSync,
    sender: Arc<ProgressiveSender>,
    receiver: FileReceiver,
    sessions: SessionTable,
    /// session id → announced transfer we are receiving.
    expected: DashMap<String, ExpectedTransfer>,
    /// Files that finished reassembly before their announcement arrived
    /// (chunks and control messages ride different channels).
    unclaimed: DashMap<String, Vec<CompletedFile>>,
    /// session id → file set we are sending (kept for recovery resends).
    outgoing: DashMap<String, Vec<FileToSend>>,
    /// session id → manifest to remember once the peer confirms.
    pending_manifests: DashMap<String, PeerManifest>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: broadcast::Sender<()>,
}

impl Orchestrator {
    pub fn new(
        config: SyncConfig,
        local_id: impl Into<String>,
        channel: Arc<dyn DataChannel>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<ComponentStore>,
        cache: Arc<FileCache>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            local_id: local_id.into(),
            sender: Arc::new(ProgressiveSender::new(channel.clone(), config.transfer.clone())),
            receiver: FileReceiver::new(config.transfer.idle_session_max()),
            channel,
            dispatcher,
            store,
            cache,
            differential: DifferentialSync::new(),
            sessions: new_session_table(),
            expected: DashMap::new(),
            unclaimed: DashMap::new(),
            outgoing: DashMap::new(),
            pending_manifests: DashMap::new(),
            events,
            shutdown,
            config,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Sync the local appearance to one peer: store the recipe, diff
    /// against the peer's last acknowledged state, and ship the delta with
    /// whatever strategy its size calls for.
    pub async fn sync_appearance(
        &self,
        peer_id: &str,
        player_name: &str,
        appearance: &Appearance,
        files: Vec<FileToSend>,
    ) -> anyhow::Result<SyncOutcome> {
        let current = differential::build_manifest(player_name, appearance, &files);
        let state_hash = current.state_hash();
        self.store
            .store_recipe(player_name, &state_hash, appearance)?;

        let previous = self.differential.last_manifest(peer_id);
        let delta = differential::delta(&current, previous.as_ref(), &files);
        if delta.is_empty() {
            self.differential.store_peer_manifest(peer_id, current);
            tracing::debug!(peer = peer_id, "peer already in sync, nothing to send");
            return Ok(SyncOutcome::AlreadyInSync);
        }

        let total_bytes: u64 = delta.files_to_send.iter().map(|f| f.size_bytes).sum();
        let strategy = choose_strategy(total_bytes, previous.is_some(), &self.config.transfer);
        let player_info = PlayerInfo {
            player_name: player_name.to_string(),
            appearance: appearance.clone(),
            state_hash,
        };
        let file_count = delta.files_to_send.len();
        tracing::info!(
            peer = peer_id,
            ?strategy,
            files = file_count,
            bytes = total_bytes,
            "syncing appearance"
        );

        match strategy {
            Strategy::Direct => self.send_direct(player_info, &delta.files_to_send).await?,
            Strategy::Progressive | Strategy::Differential => {
                self.send_progressive(peer_id, player_info, delta.files_to_send)
                    .await?
            }
        }

        self.differential.store_peer_manifest(peer_id, current);
        Ok(SyncOutcome::Sent {
            strategy,
            files: file_count,
        })
    }

    /// One response, contents inline.
    async fn send_direct(
        &self,
        player_info: PlayerInfo,
        files: &[FileToSend],
    ) -> Result<(), SyncError> {
        let response = ModDataResponse {
            player_info,
            files: files
                .iter()
                .map(|f| TransferredFile {
                    game_path: f.game_path.clone(),
                    hash: f.hash.clone(),
                    size_bytes: f.size_bytes,
                    contents: f.contents.to_vec(),
                    assigned_channel: 0,
                    chunk_count: 0,
                })
                .collect(),
            session_id: None,
            total_channels: None,
            total_size_bytes: None,
        };
        self.dispatcher
            .send_message(&Message::new(Body::ModDataResponse(response)), CONTROL_CHANNEL)
            .await
    }

    /// Announce with empty contents, then drain the file queue across all
    /// channels. Workers steal from one shared queue, so load balances
    /// itself without up-front size estimates.
    async fn send_progressive(
        &self,
        peer_id: &str,
        player_info: PlayerInfo,
        files: Vec<FileToSend>,
    ) -> Result<(), SyncError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let announcement = ModDataResponse {
            player_info,
            files: files
                .iter()
                .map(|f| TransferredFile {
                    game_path: f.game_path.clone(),
                    hash: f.hash.clone(),
                    size_bytes: f.size_bytes,
                    contents: Vec::new(),
                    assigned_channel: 0,
                    chunk_count: crate::manifest::chunk_count(
                        f.size_bytes,
                        self.config.transfer.file_chunk_size,
                    ),
                })
                .collect(),
            session_id: Some(session_id.clone()),
            total_channels: None,
            total_size_bytes: None,
        };
        self.dispatcher
            .send_message(
                &Message::new(Body::ModDataResponse(announcement)),
                CONTROL_CHANNEL,
            )
            .await?;

        let session = Arc::new(TransferSession::new(session_id.clone(), peer_id));
        self.sessions.insert(session_id.clone(), session.clone());
        self.outgoing.insert(session_id.clone(), files.clone());

        let queue = Arc::new(Mutex::new(VecDeque::from(files)));
        let mut workers = Vec::new();
        for channel_index in 0..self.channel.channel_count().max(1) {
            let queue = queue.clone();
            let session = session.clone();
            let sender = self.sender.clone();
            let channel = self.channel.clone();
            let poll = Duration::from_millis(self.config.transfer.channel_poll_ms);
            let open_timeout = Duration::from_secs(self.config.transfer.channel_open_timeout_secs);
            let session_id = session_id.clone();

            workers.push(tokio::spawn(async move {
                let mut cancel = session.cancel_token();
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some(file) = next else {
                        return Ok::<(), SyncError>(());
                    };
                    wait_channel_open(channel.as_ref(), channel_index, open_timeout, poll).await?;
                    sender
                        .send_file(
                            &session_id,
                            &file,
                            channel_index,
                            ChunkEncoding::Binary,
                            &mut cancel,
                        )
                        .await?;
                    session.touch().await;
                }
            }));
        }

        let mut first_error = None;
        for (channel_index, worker) in workers.into_iter().enumerate() {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(channel = channel_index, error = %e, "stream worker failed");
                    self.emit(SyncEvent::TransferFailed {
                        session_id: session_id.clone(),
                        channel_id: channel_index as u32,
                        reason: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    first_error.get_or_insert(SyncError::Protocol(format!(
                        "stream worker panicked: {join_error}"
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Coordinated protocol: balanced manifest, per-channel contracts,
    /// receipts back, high-fives out. Returns the session id; the session
    /// completes asynchronously as receipts arrive.
    pub async fn send_coordinated(
        &self,
        peer_id: &str,
        player_info: PlayerInfo,
        files: Vec<FileToSend>,
    ) -> anyhow::Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let manifest = TransferManifest::balanced(
            session_id.clone(),
            self.local_id.clone(),
            peer_id,
            &files,
            self.channel.channel_count().max(1),
            self.config.transfer.file_chunk_size,
        );
        manifest.validate()?;

        let session = Arc::new(TransferSession::new(session_id.clone(), peer_id));
        session.install_contracts(manifest.sender_contracts()).await;
        self.sessions.insert(session_id.clone(), session.clone());
        self.outgoing.insert(session_id.clone(), files.clone());
        self.pending_manifests.insert(
            session_id.clone(),
            differential::build_manifest(&player_info.player_name, &player_info.appearance, &files),
        );

        self.dispatcher
            .send_message(
                &Message::new(Body::ModDataResponse(manifest.to_response(player_info))),
                CONTROL_CHANNEL,
            )
            .await?;

        let mut workers = Vec::new();
        for channel_index in 0..manifest.total_channels {
            let assigned: Vec<FileToSend> = manifest
                .files
                .iter()
                .filter(|a| a.assigned_channel == channel_index)
                .filter_map(|a| files.iter().find(|f| f.hash == a.file_hash).cloned())
                .collect();
            if assigned.is_empty() {
                continue;
            }

            let session = session.clone();
            let sender = self.sender.clone();
            let channel = self.channel.clone();
            let poll = Duration::from_millis(self.config.transfer.channel_poll_ms);
            let open_timeout = Duration::from_secs(self.config.transfer.channel_open_timeout_secs);
            let session_id = session_id.clone();

            workers.push((
                channel_index,
                tokio::spawn(async move {
                    let mut cancel = session.cancel_token();
                    for file in assigned {
                        wait_channel_open(channel.as_ref(), channel_index, open_timeout, poll)
                            .await?;
                        sender
                            .send_file(
                                &session_id,
                                &file,
                                channel_index,
                                ChunkEncoding::Binary,
                                &mut cancel,
                            )
                            .await?;
                        session.record_send(channel_index, &file.hash).await?;
                    }
                    Ok::<(), SyncError>(())
                }),
            ));
        }

        for (channel_index, worker) in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // One failed contract does not take the session down;
                    // the other channels keep their promises.
                    tracing::warn!(channel = channel_index, error = %e, "contract failed");
                    session.fail_channel(channel_index).await;
                    self.emit(SyncEvent::TransferFailed {
                        session_id: session_id.clone(),
                        channel_id: channel_index,
                        reason: e.to_string(),
                    });
                }
                Err(join_error) => {
                    session.fail_channel(channel_index).await;
                    self.emit(SyncEvent::TransferFailed {
                        session_id: session_id.clone(),
                        channel_id: channel_index,
                        reason: format!("worker panicked: {join_error}"),
                    });
                }
            }
        }

        Ok(session_id)
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Register an announced transfer (progressive or coordinated) so the
    /// incoming chunks have somewhere to land. Direct responses carry
    /// their bytes inline and complete immediately. Files that finished
    /// reassembly ahead of this announcement are settled on the spot, so
    /// the returned disposition may already carry receipts.
    pub async fn register_incoming(
        &self,
        peer_id: &str,
        response: &ModDataResponse,
    ) -> Result<ChunkDisposition, SyncError> {
        let mut disposition = ChunkDisposition::default();

        let Some(session_id) = response.session_id.clone() else {
            // Direct: everything is already here.
            let mut file_hashes = BTreeMap::new();
            let mut total_bytes = 0u64;
            for file in &response.files {
                self.cache.put_bytes(&file.hash, &file.contents).map_err(io_error)?;
                file_hashes.insert(file.game_path.clone(), file.hash.clone());
                total_bytes += file.contents.len() as u64;
            }
            disposition.completed = Some(CompletedTransfer {
                session_id: String::new(),
                peer_id: peer_id.to_string(),
                player_info: response.player_info.clone(),
                file_hashes,
                processed_files: response.files.len() as u64,
                total_bytes,
            });
            return Ok(disposition);
        };

        let coordinated = response.total_channels.is_some();
        if coordinated {
            let manifest = TransferManifest::from_response(response, peer_id, &self.local_id)
                .ok_or_else(|| SyncError::Protocol("manifest announcement without session".into()))?;
            manifest.validate()?;
            let session = Arc::new(TransferSession::new(session_id.clone(), peer_id));
            session.install_contracts(manifest.receiver_contracts()).await;
            self.sessions.insert(session_id.clone(), session);
        }

        // Skip files we already hold; they will never be streamed again
        // after a recovery handshake.
        let mut expected = BTreeMap::new();
        for file in &response.files {
            expected.insert(file.game_path.clone(), file.hash.clone());
        }
        self.expected.insert(
            session_id.clone(),
            ExpectedTransfer {
                peer_id: peer_id.to_string(),
                player_info: response.player_info.clone(),
                expected,
                received: BTreeSet::new(),
                received_bytes: 0,
                coordinated,
            },
        );
        tracing::debug!(
            session = %session_id,
            files = response.files.len(),
            coordinated,
            "incoming transfer registered"
        );

        // Settle anything that beat the announcement here.
        if let Some((_, early)) = self.unclaimed.remove(&session_id) {
            for completed in early {
                self.settle_completed(completed, &mut disposition).await;
            }
        }
        Ok(disposition)
    }

    /// Feed one inbound file chunk through reassembly and the session
    /// ledgers.
    pub async fn handle_file_chunk(&self, chunk: FileChunkMessage) -> ChunkDisposition {
        let mut disposition = ChunkDisposition::default();
        let game_path = chunk.file_name.clone();

        let completed = match self.receiver.add_chunk(chunk).await {
            Ok(Some(done)) => done,
            Ok(None) => return disposition,
            Err(e) => {
                // Integrity failure: discard and tell the sender which
                // path needs to come back.
                self.emit(SyncEvent::Error {
                    error_code: e.error_code().to_string(),
                    error_description: e.to_string(),
                    failed_operation: Some(format!("receive {game_path}")),
                });
                disposition.replies.push(Message::new(Body::Error(ErrorMessage {
                    error_code: e.error_code().to_string(),
                    error_description: e.to_string(),
                    failed_operation: Some(game_path),
                })));
                return disposition;
            }
        };

        if let Err(e) = self.cache.put_bytes(&completed.file_hash, &completed.bytes) {
            tracing::warn!(error = %e, file = %completed.file_name, "failed to cache received file");
            return disposition;
        }
        self.emit(SyncEvent::FileReceived {
            session_id: completed.session_id.clone(),
            game_path: completed.file_name.clone(),
            file_hash: completed.file_hash.clone(),
        });

        self.settle_completed(completed, &mut disposition).await;
        disposition
    }

    /// Fold one verified file into the expected-transfer ledger and the
    /// session contracts. Files for sessions not yet announced are parked
    /// until registration.
    async fn settle_completed(&self, completed: CompletedFile, disposition: &mut ChunkDisposition) {
        let Some(mut expected) = self.expected.get_mut(&completed.session_id) else {
            tracing::debug!(session = %completed.session_id, "file finished before its announcement, parking");
            self.unclaimed
                .entry(completed.session_id.clone())
                .or_default()
                .push(completed);
            return;
        };
        expected.received.insert(completed.file_name.clone());
        expected.received_bytes += completed.bytes.len() as u64;
        let transfer_done = expected.received.len() == expected.expected.len();
        let coordinated = expected.coordinated;
        let peer_id = expected.peer_id.clone();
        let player_info = expected.player_info.clone();
        let file_hashes = expected.expected.clone();
        let processed_files = expected.received.len() as u64;
        let total_bytes = expected.received_bytes;
        drop(expected);

        if coordinated {
            // Receipt per file; the sender's ledger is waiting on it.
            disposition.replies.push(Message::new(Body::SyncComplete(SyncComplete {
                success: true,
                processed_files: 1,
                total_bytes: completed.bytes.len() as u64,
                message: None,
                receipt: Some(FileCompletionReceipt {
                    session_id: completed.session_id.clone(),
                    file_hash: completed.file_hash.clone(),
                    game_path: completed.file_name.clone(),
                    received_bytes: completed.bytes.len() as u64,
                    receiver_signature: sha256_hex(&completed.bytes),
                }),
                high_five: None,
            })));

            let session = self.sessions.get(&completed.session_id).map(|s| s.clone());
            if let Some(session) = session {
                match session.record_receive(&completed.file_hash).await {
                    Ok(progress) if progress.session_complete => {
                        self.finish_session(&completed.session_id).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "receive outside contract")
                    }
                }
            }
        }

        if transfer_done {
            self.expected.remove(&completed.session_id);
            if !coordinated {
                // One summary acknowledgement for the whole stream.
                disposition.replies.push(Message::new(Body::SyncComplete(SyncComplete {
                    success: true,
                    processed_files,
                    total_bytes,
                    message: None,
                    receipt: None,
                    high_five: None,
                })));
            }
            disposition.completed = Some(CompletedTransfer {
                session_id: completed.session_id.clone(),
                peer_id,
                player_info,
                file_hashes,
                processed_files,
                total_bytes,
            });
        }
    }

    /// Sender side: a `SyncComplete` arrived — a receipt, a high-five, or
    /// the summary acknowledgement of an uncoordinated stream.
    pub async fn handle_sync_complete(&self, body: &SyncComplete) -> Vec<Message> {
        let mut replies = Vec::new();

        if let Some(receipt) = &body.receipt {
            let Some(session) = self.sessions.get(&receipt.session_id).map(|s| s.clone()) else {
                tracing::debug!(session = %receipt.session_id, "receipt for unknown session");
                return replies;
            };
            let progress = match session.record_receive(&receipt.file_hash).await {
                Ok(progress) => progress,
                Err(e) => {
                    tracing::warn!(error = %e, "unexpected receipt");
                    return replies;
                }
            };
            let session_id = session.session_id.clone();
            let contract = session.contract(progress.channel_id).await;

            if progress.contract_complete {
                // The channel kept every promise in both directions; tell
                // the peer it is safe to close.
                let completed_files = contract
                    .map(|c| c.completed_receives.iter().cloned().collect())
                    .unwrap_or_default();
                replies.push(Message::new(Body::SyncComplete(SyncComplete {
                    success: true,
                    processed_files: 0,
                    total_bytes: 0,
                    message: None,
                    receipt: None,
                    high_five: Some(ChannelCompletionHighFive {
                        channel_id: progress.channel_id,
                        completed_files,
                        ready_to_close: true,
                    }),
                })));
                self.emit(SyncEvent::ChannelComplete {
                    session_id: session_id.clone(),
                    channel_id: progress.channel_id,
                });
            }
            if progress.session_complete {
                self.finish_session(&session_id).await;
            }
            return replies;
        }

        if let Some(high_five) = &body.high_five {
            tracing::info!(
                channel = high_five.channel_id,
                files = high_five.completed_files.len(),
                "channel high-five received"
            );
            self.emit(SyncEvent::ChannelComplete {
                session_id: String::new(),
                channel_id: high_five.channel_id,
            });
            return replies;
        }

        self.emit(SyncEvent::SyncAcknowledged {
            processed_files: body.processed_files,
            total_bytes: body.total_bytes,
        });
        replies
    }

    /// Resume after reconnect: for every live outgoing session with this
    /// peer, re-stream whatever the receiver did not list as complete.
    pub async fn handle_recovery(
        &self,
        recovery: &attune_core::message::RecoveryRequest,
    ) -> Result<usize, SyncError> {
        let sessions: Vec<Arc<TransferSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().peer_id == recovery.peer_id)
            .map(|entry| entry.value().clone())
            .collect();
        if sessions.is_empty() {
            return Err(SyncError::NotFound(format!(
                "no live session with peer {}",
                recovery.peer_id
            )));
        }

        let mut resent = 0;
        for session in sessions {
            let Some(files) = self.outgoing.get(&session.session_id).map(|f| f.clone()) else {
                continue;
            };
            let remaining = crate::recovery::resume_delta(files, recovery);
            if remaining.is_empty() {
                continue;
            }
            tracing::info!(
                session = %session.session_id,
                files = remaining.len(),
                "resuming after recovery request"
            );
            let mut cancel = session.cancel_token();
            for (index, file) in remaining.iter().enumerate() {
                let channel_index = index as u32 % self.channel.channel_count().max(1);
                self.sender
                    .send_file(
                        &session.session_id,
                        file,
                        channel_index,
                        ChunkEncoding::Binary,
                        &mut cancel,
                    )
                    .await?;
                resent += 1;
            }
        }
        Ok(resent)
    }

    /// A peer reported a failure; surface it to the host.
    pub fn report_remote_error(&self, error: &ErrorMessage) {
        tracing::warn!(
            code = %error.error_code,
            description = %error.error_description,
            operation = ?error.failed_operation,
            "peer reported error"
        );
        self.emit(SyncEvent::Error {
            error_code: error.error_code.clone(),
            error_description: error.error_description.clone(),
            failed_operation: error.failed_operation.clone(),
        });
    }

    /// Pass a reconnect offer/answer up to the host's signaling layer.
    pub fn relay_reconnect(&self, peer_id: &str, payload: &str, offer: bool) {
        self.emit(SyncEvent::ReconnectSignal {
            peer_id: peer_id.to_string(),
            payload: payload.to_string(),
            offer,
        });
    }

    async fn finish_session(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        if let Some((_, manifest)) = self.pending_manifests.remove(session_id) {
            self.differential.store_peer_manifest(&session.peer_id, manifest);
        }
        self.outgoing.remove(session_id);
        tracing::info!(session = session_id, peer = %session.peer_id, "transfer session completed");
        self.emit(SyncEvent::SessionCompleted {
            session_id: session_id.to_string(),
            peer_id: session.peer_id.clone(),
        });
    }

    // ── Differential memory ───────────────────────────────────────────────────

    pub fn last_peer_manifest(&self, peer_id: &str) -> Option<PeerManifest> {
        self.differential.last_manifest(peer_id)
    }

    pub fn store_peer_manifest(&self, peer_id: &str, manifest: PeerManifest) {
        self.differential.store_peer_manifest(peer_id, manifest);
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    /// Per-session transfer ledger, for diagnostics.
    pub async fn transfer_stats(&self, session_id: &str) -> Option<Vec<crate::session::ChannelContract>> {
        let session = self.sessions.get(session_id)?.clone();
        Some(session.contract_snapshot().await)
    }

    /// Drop idle sessions, stale reassembly buffers, and (when configured)
    /// aged-out cache entries and components.
    pub async fn sweep(&self) {
        self.receiver.sweep_stale().await;

        let file_age_hours = self.config.storage.file_cache_max_age_hours;
        if file_age_hours > 0 {
            self.cache
                .cleanup(Duration::from_secs(file_age_hours * 3600));
        }
        self.store
            .sweep_components(self.config.storage.component_max_age_hours);

        let idle_max = self.config.transfer.idle_session_max();
        let snapshot: Vec<(String, Arc<TransferSession>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut stale = Vec::new();
        for (session_id, session) in snapshot {
            if session.idle_for().await > idle_max {
                stale.push(session_id);
            }
        }
        for session_id in stale {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                session.cancel();
                self.expected.remove(&session_id);
                self.unclaimed.remove(&session_id);
                self.outgoing.remove(&session_id);
                tracing::warn!(session = %session_id, "idle session dropped");
            }
        }
    }

    /// Periodic sweep until shutdown. Spawn once after construction.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let orchestrator = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("sweeper shutting down");
                        return;
                    }
                    _ = interval.tick() => orchestrator.sweep().await,
                }
            }
        });
    }

    /// Cancel every session, fail pending requests, and write the store
    /// manifest. Disposing twice is harmless.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
        self.sessions.clear();
        self.expected.clear();
        self.unclaimed.clear();
        self.outgoing.clear();
        self.dispatcher.cancel_all().await;
        if let Err(e) = self.store.shutdown() {
            tracing::warn!(error = %e, "store manifest write failed on shutdown");
        }
    }
}

/// Bounded wait for a channel to open, polling the transport.
async fn wait_channel_open(
    channel: &dyn DataChannel,
    channel_index: u32,
    timeout: Duration,
    poll: Duration,
) -> Result<(), SyncError> {
    let started = std::time::Instant::now();
    while !channel.is_open(channel_index) {
        if started.elapsed() >= timeout {
            return Err(SyncError::Timeout(timeout));
        }
        tokio::time::sleep(poll).await;
    }
    Ok(())
}

fn io_error(e: anyhow::Error) -> SyncError {
    SyncError::Protocol(format!("cache write failed: {e}"))
}
