//! Protocol dispatcher — request/response correlation and per-kind
//! handler routing.
//!
//! `pending_requests` lives behind one coarse lock; holds are bounded to
//! map lookup/insert/remove and never span I/O. Handler failures are
//! logged and dropped — a bad message never kills the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};

use attune_core::{chunk, frame, Message, MessageKind, SyncError};

use crate::transport::DataChannel;

/// Handles one message kind. Request handlers return the response to
/// transmit; event handlers return `None`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<Option<Message>, SyncError>;
}

pub struct Dispatcher {
    channel: Arc<dyn DataChannel>,
    handlers: std::sync::RwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    control_chunk_size: usize,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn DataChannel>, control_chunk_size: usize) -> Self {
        Self {
            channel,
            handlers: std::sync::RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            control_chunk_size,
        }
    }

    /// Register the handler for one kind. Last registration wins.
    pub fn register(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(kind, handler);
        }
    }

    /// Frame (and split, when oversized) a message and transmit it.
    pub async fn send_message(&self, message: &Message, channel_index: u32) -> Result<(), SyncError> {
        for part in chunk::split_message(message, self.control_chunk_size)? {
            let framed = frame::encode(&part)?;
            self.channel.send(Bytes::from(framed), channel_index).await?;
        }
        Ok(())
    }

    /// Send a request and wait for its correlated response.
    ///
    /// A timeout yields `Ok(None)` — the caller decides whether to retry.
    /// The pending slot is removed on every exit path.
    pub async fn send_request(
        &self,
        message: Message,
        channel_index: u32,
        timeout: Duration,
    ) -> Result<Option<Message>, SyncError> {
        let message_id = message.message_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(message_id.clone(), tx);

        if let Err(e) = self.send_message(&message, channel_index).await {
            self.pending.lock().await.remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            // Slot dropped without a response: the dispatcher was disposed.
            Ok(Err(_)) => Err(SyncError::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(&message_id);
                tracing::debug!(message_id = %message_id, ?timeout, "request timed out");
                Ok(None)
            }
        }
    }

    /// Route one decoded message. A response completes its pending slot;
    /// everything else goes to the handler for its kind. Returns the reply
    /// the caller should transmit, if any.
    pub async fn dispatch(&self, message: Message) -> Option<Message> {
        if let Some(response_to) = message.response_to.clone() {
            let slot = self.pending.lock().await.remove(&response_to);
            if let Some(tx) = slot {
                let _ = tx.send(message);
                return None;
            }
            // Correlated to nothing we asked — fall through to the handler
            // so unsolicited-but-typed traffic still routes.
        }

        let kind = message.kind();
        let handler = self
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(&kind).cloned());
        let Some(handler) = handler else {
            tracing::debug!(kind = kind.name(), "no handler registered, dropping");
            return None;
        };
        match handler.handle(message).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(kind = kind.name(), error = %e, "handler failed");
                None
            }
        }
    }

    /// Resolve every pending request with a cancellation failure.
    pub async fn cancel_all(&self) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (message_id, slot) in drained {
            drop(slot);
            tracing::debug!(message_id = %message_id, "pending request cancelled");
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
