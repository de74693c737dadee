use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use sealing::SealingService;
use shared::{
    domain::ConversationId,
    message::{ChainHead, MessageUnboxedValid},
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    cache::MessageCache,
    state_resolution::{resolve_first, StateSource},
    transport::Transport,
    ChatClient,
};

pub(crate) fn head_of(valid: &MessageUnboxedValid) -> ChainHead {
    ChainHead {
        message_id: valid.server_header.message_id,
        header_hash: valid.header_hash,
    }
}

struct MemoryHeads<'a> {
    conversation_id: ConversationId,
    heads: &'a Mutex<HashMap<ConversationId, ChainHead>>,
}

#[async_trait]
impl StateSource<ChainHead> for MemoryHeads<'_> {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<Option<ChainHead>> {
        Ok(self.heads.lock().await.get(&self.conversation_id).copied())
    }

    async fn store(&self, value: &ChainHead) -> Result<()> {
        let mut heads = self.heads.lock().await;
        let current = heads.entry(self.conversation_id).or_insert(*value);
        if value.message_id > current.message_id {
            *current = *value;
        }
        Ok(())
    }
}

struct CachedHead<'a> {
    conversation_id: ConversationId,
    cache: &'a dyn MessageCache,
}

#[async_trait]
impl StateSource<ChainHead> for CachedHead<'_> {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn load(&self) -> Result<Option<ChainHead>> {
        self.cache.load_chain_head(self.conversation_id).await
    }

    async fn store(&self, value: &ChainHead) -> Result<()> {
        self.cache.save_chain_head(self.conversation_id, value).await
    }
}

/// Opens the newest envelope the server holds to recover its header hash.
struct RemoteHead<'a> {
    conversation_id: ConversationId,
    transport: &'a dyn Transport,
    sealing: &'a dyn SealingService,
    timeout: Option<Duration>,
}

#[async_trait]
impl StateSource<ChainHead> for RemoteHead<'_> {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn load(&self) -> Result<Option<ChainHead>> {
        let Some(latest) = self.transport.fetch_latest(self.conversation_id).await? else {
            return Ok(None);
        };
        let opened = self.sealing.verify_and_open(&latest.sealed).await?;
        Ok(Some(ChainHead {
            message_id: latest.server_header.message_id,
            header_hash: opened.encoded.header_hash(),
        }))
    }
}

impl ChatClient {
    /// Latest confirmed envelope of the conversation: memory, then the local
    /// cache, then the server.
    pub(crate) async fn resolve_chain_head(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ChainHead>> {
        let memory = MemoryHeads {
            conversation_id,
            heads: &self.chain_heads,
        };
        let cached = CachedHead {
            conversation_id,
            cache: self.cache.as_ref(),
        };
        let remote = RemoteHead {
            conversation_id,
            transport: self.transport.as_ref(),
            sealing: self.sealing.as_ref(),
            timeout: self.config.remote_lookup_timeout,
        };
        resolve_first::<ChainHead>(&[&memory, &cached, &remote], None).await
    }

    pub(crate) async fn advance_chain_head(
        &self,
        conversation_id: ConversationId,
        head: ChainHead,
    ) -> Result<()> {
        MemoryHeads {
            conversation_id,
            heads: &self.chain_heads,
        }
        .store(&head)
        .await?;
        self.cache.save_chain_head(conversation_id, &head).await?;
        debug!(
            conversation_id = conversation_id.0,
            message_id = head.message_id.0,
            "chain: head advanced"
        );
        Ok(())
    }
}
