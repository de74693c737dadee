use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use sealing::SealedEnvelope;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, MessageId},
    message::ServerHeader,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is offline")]
    Offline,
    #[error("rate limited by server, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("server rejected the message: {reason}")]
    Rejected { reason: String },
}

/// A sealed message together with what the server stamped on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub server_header: ServerHeader,
    pub sealed: SealedEnvelope,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        conversation_id: ConversationId,
        sealed: &SealedEnvelope,
    ) -> Result<MessageId, TransportError>;
    /// The newest `limit` messages older than `before`, oldest first.
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<InboundMessage>, TransportError>;
    async fn fetch_latest(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<InboundMessage>, TransportError>;
}

pub struct MissingTransport;

#[async_trait]
impl Transport for MissingTransport {
    async fn deliver(
        &self,
        _conversation_id: ConversationId,
        _sealed: &SealedEnvelope,
    ) -> Result<MessageId, TransportError> {
        Err(TransportError::Offline)
    }

    async fn fetch_messages(
        &self,
        _conversation_id: ConversationId,
        _before: Option<MessageId>,
        _limit: u32,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        Err(TransportError::Offline)
    }

    async fn fetch_latest(
        &self,
        _conversation_id: ConversationId,
    ) -> Result<Option<InboundMessage>, TransportError> {
        Err(TransportError::Offline)
    }
}

/// In-process server: assigns ids per conversation and keeps every envelope.
/// Failures can be scripted to exercise the sender loop.
pub struct LoopbackTransport {
    inner: Mutex<LoopbackState>,
}

#[derive(Default)]
struct LoopbackState {
    online: bool,
    conversations: HashMap<ConversationId, Vec<InboundMessage>>,
    scripted_failures: VecDeque<TransportError>,
    delivered: usize,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LoopbackState {
                online: true,
                ..LoopbackState::default()
            }),
        }
    }

    pub async fn set_online(&self, online: bool) {
        self.inner.lock().await.online = online;
    }

    /// The next delivery fails with `err` instead of being accepted.
    pub async fn fail_next(&self, err: TransportError) {
        self.inner.lock().await.scripted_failures.push_back(err);
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<InboundMessage> {
        self.inner
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn delivered_count(&self) -> usize {
        self.inner.lock().await.delivered
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn deliver(
        &self,
        conversation_id: ConversationId,
        sealed: &SealedEnvelope,
    ) -> Result<MessageId, TransportError> {
        let mut guard = self.inner.lock().await;
        if !guard.online {
            return Err(TransportError::Offline);
        }
        if let Some(err) = guard.scripted_failures.pop_front() {
            return Err(err);
        }

        let messages = guard.conversations.entry(conversation_id).or_default();
        let message_id = messages
            .last()
            .map(|m| m.server_header.message_id.next())
            .unwrap_or(MessageId(1));
        messages.push(InboundMessage {
            server_header: ServerHeader {
                message_id,
                ctime: Utc::now(),
                superseded_by: None,
            },
            sealed: sealed.clone(),
        });
        guard.delivered += 1;
        debug!(
            conversation_id = conversation_id.0,
            message_id = message_id.0,
            "loopback: accepted envelope"
        );
        Ok(message_id)
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let guard = self.inner.lock().await;
        if !guard.online {
            return Err(TransportError::Offline);
        }
        let older: Vec<&InboundMessage> = guard
            .conversations
            .get(&conversation_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| before.map_or(true, |b| m.server_header.message_id < b))
                    .collect()
            })
            .unwrap_or_default();
        let skip = older.len().saturating_sub(limit as usize);
        Ok(older.into_iter().skip(skip).cloned().collect())
    }

    async fn fetch_latest(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<InboundMessage>, TransportError> {
        let guard = self.inner.lock().await;
        if !guard.online {
            return Err(TransportError::Offline);
        }
        Ok(guard
            .conversations
            .get(&conversation_id)
            .and_then(|messages| messages.last().cloned()))
    }
}
