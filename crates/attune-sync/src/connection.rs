//! Per-peer connection glue.
//!
//! One `SyncConnection` binds one peer's `DataChannel` to the engine:
//! raw inbound bytes are sniffed (binary file chunk / chunked control
//! message / plain control message) and routed, typed handlers bridge the
//! protocol to the stores and the apply service, and fully received
//! states are applied atomically to the game sink.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;

use attune_core::chunk::Reassembler;
use attune_core::config::SyncConfig;
use attune_core::message::{
    Body, ComponentResponse, ErrorMessage, MemberListResponse, ModApplicationResponse,
    ModDataResponse, PlayerInfo, TransferredFile,
};
use attune_core::{fchk, frame, Message, MessageKind, SyncError};
use attune_store::{Component, ComponentStore, FileCache};

use crate::apply::{ApplyService, PeerState};
use crate::dispatcher::{Dispatcher, MessageHandler};
use crate::manifest::FileToSend;
use crate::orchestrator::{CompletedTransfer, Orchestrator, SyncOutcome, CONTROL_CHANNEL};
use crate::transport::{AppearanceSink, AppearanceSource, DataChannel};

/// Supplies syncshell membership for `MemberListRequest`. Optional; an
/// absent provider answers with an empty roster.
pub trait MemberProvider: Send + Sync {
    fn members(&self, syncshell_id: Option<&str>) -> Vec<String>;
}

pub struct SyncConnection {
    peer_id: String,
    config: SyncConfig,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    apply: Arc<ApplyService>,
    store: Arc<ComponentStore>,
    cache: Arc<FileCache>,
    source: Arc<dyn AppearanceSource>,
    reassembler: Mutex<Reassembler>,
    /// Last received file map per remote player, for later re-applies.
    received_files: DashMap<String, BTreeMap<String, String>>,
}

impl SyncConnection {
    /// Wire up the full engine for one peer. Storage directories hang off
    /// `config.storage.plugin_dir`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        local_id: impl Into<String>,
        peer_id: impl Into<String>,
        channel: Arc<dyn DataChannel>,
        source: Arc<dyn AppearanceSource>,
        sink: Arc<dyn AppearanceSink>,
        members: Option<Arc<dyn MemberProvider>>,
        available_memory_mb: u64,
    ) -> anyhow::Result<Arc<Self>> {
        let cache = Arc::new(FileCache::new(config.storage.file_cache_dir())?);
        let store = Arc::new(ComponentStore::new(config.storage.component_dir())?);
        let apply = Arc::new(ApplyService::new(
            sink,
            store.clone(),
            cache.clone(),
            config.apply.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            channel.clone(),
            config.transfer.control_chunk_size,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            local_id,
            channel,
            dispatcher.clone(),
            store.clone(),
            cache.clone(),
        ));

        let connection = Arc::new(Self {
            peer_id: peer_id.into(),
            reassembler: Mutex::new(Reassembler::new(config.transfer.control_chunk_size)),
            dispatcher: dispatcher.clone(),
            orchestrator: orchestrator.clone(),
            apply,
            store: store.clone(),
            cache,
            source,
            received_files: DashMap::new(),
            config,
        });

        let weak = Arc::downgrade(&connection);
        dispatcher.register(
            MessageKind::ModDataRequest,
            Arc::new(ModDataRequestHandler { connection: weak.clone() }),
        );
        dispatcher.register(
            MessageKind::ModDataResponse,
            Arc::new(ModDataResponseHandler { connection: weak.clone() }),
        );
        dispatcher.register(
            MessageKind::ComponentRequest,
            Arc::new(ComponentRequestHandler { store: store.clone() }),
        );
        dispatcher.register(
            MessageKind::ComponentResponse,
            Arc::new(ComponentResponseHandler { store }),
        );
        dispatcher.register(
            MessageKind::ModApplicationRequest,
            Arc::new(ModApplicationRequestHandler { connection: weak.clone() }),
        );
        dispatcher.register(
            MessageKind::SyncComplete,
            Arc::new(SyncCompleteHandler { connection: weak.clone() }),
        );
        dispatcher.register(
            MessageKind::Error,
            Arc::new(ErrorHandler { connection: weak.clone() }),
        );
        dispatcher.register(
            MessageKind::MemberListRequest,
            Arc::new(MemberListHandler { members }),
        );
        dispatcher.register(
            MessageKind::ChannelNegotiation,
            Arc::new(NegotiationHandler {
                available_memory_mb,
                per_channel_budget_mb: connection.config.transfer.per_channel_budget_mb,
            }),
        );
        dispatcher.register(
            MessageKind::ReconnectOffer,
            Arc::new(ReconnectHandler { connection: weak.clone(), offer: true }),
        );
        dispatcher.register(
            MessageKind::ReconnectAnswer,
            Arc::new(ReconnectHandler { connection: weak.clone(), offer: false }),
        );
        dispatcher.register(
            MessageKind::RecoveryRequest,
            Arc::new(RecoveryHandler { connection: weak }),
        );

        orchestrator.spawn_sweeper();

        // Reassembly buffers age out with the same idle policy as
        // sessions. The task dies with the connection.
        let sweep = Arc::downgrade(&connection);
        let idle_max = connection.config.transfer.idle_session_max();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let Some(connection) = sweep.upgrade() else { return };
                connection.reassembler.lock().await.sweep(idle_max);
            }
        });

        Ok(connection)
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn apply_service(&self) -> &Arc<ApplyService> {
        &self.apply
    }

    pub fn store(&self) -> &Arc<ComponentStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Push the local appearance to this peer.
    pub async fn sync_to_peer(&self) -> anyhow::Result<SyncOutcome> {
        let appearance = self.source.current_appearance().await?;
        let files = self.collect_local_files(&appearance);
        self.orchestrator
            .sync_appearance(&self.peer_id, &self.source.player_name(), &appearance, files)
            .await
    }

    /// Entry point for every inbound byte batch from the transport.
    pub async fn handle_incoming(&self, bytes: Bytes, channel_index: u32) {
        if fchk::is_binary_chunk(&bytes) {
            match fchk::decode(&bytes) {
                Ok(chunk) => self.process_file_chunk(chunk).await,
                Err(e) => tracing::warn!(error = %e, "dropping undecodable binary chunk"),
            }
            return;
        }
        match frame::decode(&bytes) {
            Ok(message) => self.process_message(message, channel_index).await,
            Err(e) => {
                tracing::warn!(channel = channel_index, error = %e, "dropping undecodable frame")
            }
        }
    }

    /// Drive the connection from a generic incoming queue. Returns the
    /// task handle; dropping the queue ends it.
    pub fn spawn_pump(
        self: &Arc<Self>,
        mut incoming: tokio::sync::mpsc::UnboundedReceiver<(u32, Bytes)>,
    ) -> tokio::task::JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            while let Some((channel_index, bytes)) = incoming.recv().await {
                connection.handle_incoming(bytes, channel_index).await;
            }
            tracing::debug!(peer = %connection.peer_id, "incoming queue closed");
        })
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }

    async fn process_message(&self, message: Message, channel_index: u32) {
        match message.body {
            Body::ChunkedMessage(ref chunk) => {
                let completed = self.reassembler.lock().await.insert(chunk);
                if let Some(body) = completed {
                    match frame::decode(&body) {
                        Ok(inner) => Box::pin(self.process_message(inner, channel_index)).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "reassembled message failed to decode")
                        }
                    }
                }
            }
            Body::FileChunkMessage(chunk) => self.process_file_chunk(chunk).await,
            _ => {
                if let Some(reply) = self.dispatcher.dispatch(message).await {
                    self.send_reply(reply).await;
                }
            }
        }
    }

    async fn process_file_chunk(&self, chunk: attune_core::message::FileChunkMessage) {
        let disposition = self.orchestrator.handle_file_chunk(chunk).await;
        for reply in disposition.replies {
            self.send_reply(reply).await;
        }
        if let Some(completed) = disposition.completed {
            self.apply_completed(completed).await;
        }
    }

    async fn send_reply(&self, reply: Message) {
        if let Err(e) = self.dispatcher.send_message(&reply, CONTROL_CHANNEL).await {
            tracing::warn!(kind = reply.kind().name(), error = %e, "failed to send reply");
        }
    }

    /// Store and apply a fully received state.
    async fn apply_completed(&self, completed: CompletedTransfer) {
        let player = completed.player_info.player_name.clone();
        let appearance = completed.player_info.appearance.clone();
        let state_hash = if completed.player_info.state_hash.is_empty() {
            appearance.state_hash()
        } else {
            completed.player_info.state_hash.clone()
        };

        if let Err(e) = self.store.store_recipe(&player, &state_hash, &appearance) {
            tracing::warn!(player = %player, error = %e, "failed to store received recipe");
            return;
        }
        // A differential sync only carries the changed files; fold them
        // into what we already hold so unchanged paths stay backed.
        let mut file_hashes = self
            .received_files
            .get(&player)
            .map(|f| f.clone())
            .unwrap_or_default();
        file_hashes.extend(completed.file_hashes);
        self.received_files.insert(player.clone(), file_hashes.clone());

        if !self.apply.needs_update(&player, &state_hash).await {
            tracing::debug!(player = %player, "state already applied, skipping");
            return;
        }
        let peer_state = PeerState {
            player_name: player.clone(),
            appearance_hash: state_hash,
            file_hashes,
        };
        let result = self.apply.apply_outfit_atomic(&player, &peer_state).await;
        if !result.success {
            tracing::warn!(player = %player, message = ?result.message, "apply failed");
        }
    }

    /// Resolve the source's mod paths into sendable files through the
    /// cache. Paths outside the allow-list or unreadable are skipped.
    fn collect_local_files(&self, appearance: &attune_core::Appearance) -> Vec<FileToSend> {
        let mut files = Vec::new();
        for path in &appearance.mod_paths {
            let entry = match self.cache.ensure(std::path::Path::new(path)) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "skipping unreadable asset");
                    continue;
                }
            };
            match self.cache.get_by_hash(&entry.hash) {
                Ok(Some(contents)) => files.push(FileToSend {
                    game_path: path.clone(),
                    hash: entry.hash,
                    size_bytes: entry.size,
                    contents,
                }),
                Ok(None) => tracing::warn!(path = %path, "cached blob vanished"),
                Err(e) => tracing::warn!(path = %path, error = %e, "failed to read cached blob"),
            }
        }
        files
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

macro_rules! upgrade_or_drop {
    ($weak:expr) => {
        match $weak.upgrade() {
            Some(connection) => connection,
            None => return Ok(None),
        }
    };
}

struct ModDataRequestHandler {
    connection: Weak<SyncConnection>,
}

#[async_trait]
impl MessageHandler for ModDataRequestHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let connection = upgrade_or_drop!(self.connection);
        let appearance = connection.source.current_appearance().await?;
        let files = connection.collect_local_files(&appearance);
        let player_name = connection.source.player_name();
        let state_hash =
            crate::differential::build_manifest(&player_name, &appearance, &files).state_hash();
        let response = ModDataResponse {
            player_info: PlayerInfo {
                player_name,
                state_hash,
                appearance,
            },
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
        Ok(Some(Message::reply_to(
            &message,
            Body::ModDataResponse(response),
        )))
    }
}

struct ModDataResponseHandler {
    connection: Weak<SyncConnection>,
}

#[async_trait]
impl MessageHandler for ModDataResponseHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let connection = upgrade_or_drop!(self.connection);
        let Body::ModDataResponse(ref response) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        let disposition = connection
            .orchestrator
            .register_incoming(&connection.peer_id, response)
            .await?;
        for reply in disposition.replies {
            connection.send_reply(reply).await;
        }
        if let Some(completed) = disposition.completed {
            connection.apply_completed(completed).await;
        }
        Ok(None)
    }
}

struct ComponentRequestHandler {
    store: Arc<ComponentStore>,
}

#[async_trait]
impl MessageHandler for ComponentRequestHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let Body::ComponentRequest(ref request) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        let Some(component) = self.store.get_component(&request.component_id) else {
            return Ok(Some(Message::reply_to(
                &message,
                Body::Error(ErrorMessage {
                    error_code: "NOT_FOUND".into(),
                    error_description: format!("component {} not stored", request.component_id),
                    failed_operation: Some("component request".into()),
                }),
            )));
        };
        let file_data = serde_json::to_vec(&component)?;
        Ok(Some(Message::reply_to(
            &message,
            Body::ComponentResponse(ComponentResponse {
                component_id: request.component_id.clone(),
                file_data,
            }),
        )))
    }
}

struct ComponentResponseHandler {
    store: Arc<ComponentStore>,
}

#[async_trait]
impl MessageHandler for ComponentResponseHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let Body::ComponentResponse(ref response) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        let component: Component = serde_json::from_slice(&response.file_data)?;
        self.store
            .adopt_component(component)
            .map_err(|e| SyncError::Protocol(format!("component store rejected: {e}")))?;
        Ok(None)
    }
}

struct ModApplicationRequestHandler {
    connection: Weak<SyncConnection>,
}

#[async_trait]
impl MessageHandler for ModApplicationRequestHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let connection = upgrade_or_drop!(self.connection);
        let Body::ModApplicationRequest(ref request) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        let file_hashes = connection
            .received_files
            .get(&request.player_name)
            .map(|f| f.clone())
            .unwrap_or_default();
        let peer_state = PeerState {
            player_name: request.player_name.clone(),
            appearance_hash: request.state_hash.clone(),
            file_hashes,
        };
        let result = connection
            .apply
            .apply_outfit_atomic(&request.player_name, &peer_state)
            .await;
        Ok(Some(Message::reply_to(
            &message,
            Body::ModApplicationResponse(ModApplicationResponse {
                player_name: request.player_name.clone(),
                success: result.success,
                message: result.message,
            }),
        )))
    }
}

struct SyncCompleteHandler {
    connection: Weak<SyncConnection>,
}

#[async_trait]
impl MessageHandler for SyncCompleteHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let connection = upgrade_or_drop!(self.connection);
        let Body::SyncComplete(ref body) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        let mut replies = connection.orchestrator.handle_sync_complete(body).await;
        Ok(replies.pop())
    }
}

struct ErrorHandler {
    connection: Weak<SyncConnection>,
}

#[async_trait]
impl MessageHandler for ErrorHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let connection = upgrade_or_drop!(self.connection);
        let Body::Error(ref error) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        connection.orchestrator.report_remote_error(error);
        Ok(None)
    }
}

struct MemberListHandler {
    members: Option<Arc<dyn MemberProvider>>,
}

#[async_trait]
impl MessageHandler for MemberListHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let Body::MemberListRequest(ref request) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        let members = self
            .members
            .as_ref()
            .map(|provider| provider.members(request.syncshell_id.as_deref()))
            .unwrap_or_default();
        Ok(Some(Message::reply_to(
            &message,
            Body::MemberListResponse(MemberListResponse { members }),
        )))
    }
}

struct NegotiationHandler {
    available_memory_mb: u64,
    per_channel_budget_mb: u64,
}

#[async_trait]
impl MessageHandler for NegotiationHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let Body::ChannelNegotiation(ref negotiation) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        let response = crate::recovery::negotiate_channels(
            negotiation,
            self.available_memory_mb,
            self.per_channel_budget_mb,
        );
        Ok(Some(Message::reply_to(
            &message,
            Body::ChannelNegotiationResponse(response),
        )))
    }
}

struct ReconnectHandler {
    connection: Weak<SyncConnection>,
    offer: bool,
}

#[async_trait]
impl MessageHandler for ReconnectHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let connection = upgrade_or_drop!(self.connection);
        let (peer_id, payload) = match &message.body {
            Body::ReconnectOffer(offer) => (&offer.peer_id, &offer.offer),
            Body::ReconnectAnswer(answer) => (&answer.peer_id, &answer.answer),
            _ => return Err(SyncError::Protocol("mis-routed message".into())),
        };
        connection
            .orchestrator
            .relay_reconnect(peer_id, payload, self.offer);
        Ok(None)
    }
}

struct RecoveryHandler {
    connection: Weak<SyncConnection>,
}

#[async_trait]
impl MessageHandler for RecoveryHandler {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError> {
        let connection = upgrade_or_drop!(self.connection);
        let Body::RecoveryRequest(ref recovery) = message.body else {
            return Err(SyncError::Protocol("mis-routed message".into()));
        };
        match connection.orchestrator.handle_recovery(recovery).await {
            Ok(resent) => {
                tracing::info!(peer = %recovery.peer_id, resent, "recovery resend finished");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
