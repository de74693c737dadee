use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, MessageId},
    message::{ChainHead, MessageUnboxed},
};
use storage::Storage;
use tokio::sync::Mutex;

/// Unboxed messages keyed by (ConversationID, MessageID), plus each
/// conversation's chain head.
#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn put_message(
        &self,
        conversation_id: ConversationId,
        message: &MessageUnboxed,
    ) -> Result<()>;
    async fn load_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Option<MessageUnboxed>>;
    /// Newest `limit` messages older than `before`, oldest first.
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageUnboxed>>;
    async fn latest_message_id(&self, conversation_id: ConversationId)
        -> Result<Option<MessageId>>;
    async fn save_chain_head(&self, conversation_id: ConversationId, head: &ChainHead)
        -> Result<()>;
    async fn load_chain_head(&self, conversation_id: ConversationId) -> Result<Option<ChainHead>>;
}

#[async_trait]
impl MessageCache for Storage {
    async fn put_message(
        &self,
        conversation_id: ConversationId,
        message: &MessageUnboxed,
    ) -> Result<()> {
        self.put_cached_message(conversation_id, message).await
    }

    async fn load_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Option<MessageUnboxed>> {
        self.load_cached_message(conversation_id, message_id).await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageUnboxed>> {
        self.list_cached_messages(conversation_id, before, limit)
            .await
    }

    async fn latest_message_id(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<MessageId>> {
        self.latest_cached_message_id(conversation_id).await
    }

    async fn save_chain_head(
        &self,
        conversation_id: ConversationId,
        head: &ChainHead,
    ) -> Result<()> {
        Storage::save_chain_head(self, conversation_id, head).await
    }

    async fn load_chain_head(&self, conversation_id: ConversationId) -> Result<Option<ChainHead>> {
        Storage::load_chain_head(self, conversation_id).await
    }
}

#[derive(Default)]
pub struct MemoryMessageCache {
    inner: Mutex<MemoryCacheState>,
}

#[derive(Default)]
struct MemoryCacheState {
    messages: HashMap<ConversationId, BTreeMap<MessageId, MessageUnboxed>>,
    heads: HashMap<ConversationId, ChainHead>,
}

impl MemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageCache for MemoryMessageCache {
    async fn put_message(
        &self,
        conversation_id: ConversationId,
        message: &MessageUnboxed,
    ) -> Result<()> {
        let message_id = message
            .message_id()
            .ok_or_else(|| anyhow!("outbox entries have no message id and are not cached"))?;
        self.inner
            .lock()
            .await
            .messages
            .entry(conversation_id)
            .or_default()
            .insert(message_id, message.clone());
        Ok(())
    }

    async fn load_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Option<MessageUnboxed>> {
        Ok(self
            .inner
            .lock()
            .await
            .messages
            .get(&conversation_id)
            .and_then(|messages| messages.get(&message_id))
            .cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageUnboxed>> {
        let guard = self.inner.lock().await;
        let Some(messages) = guard.messages.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        let upper = before.unwrap_or(MessageId(i64::MAX));
        let mut page: Vec<MessageUnboxed> = messages
            .range(..upper)
            .rev()
            .take(limit as usize)
            .map(|(_, message)| message.clone())
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn latest_message_id(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<MessageId>> {
        Ok(self
            .inner
            .lock()
            .await
            .messages
            .get(&conversation_id)
            .and_then(|messages| messages.keys().next_back().copied()))
    }

    async fn save_chain_head(
        &self,
        conversation_id: ConversationId,
        head: &ChainHead,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let current = guard.heads.entry(conversation_id).or_insert(*head);
        if head.message_id > current.message_id {
            *current = *head;
        }
        Ok(())
    }

    async fn load_chain_head(&self, conversation_id: ConversationId) -> Result<Option<ChainHead>> {
        Ok(self.inner.lock().await.heads.get(&conversation_id).copied())
    }
}
