use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, MessageId, OutboxId},
    message::{OutboxRecord, OutboxState},
};
use tokio::sync::Mutex;

use crate::{AppendOutcome, CasOutcome, NewOutboxEntry, OutboxStore};

/// Process-local outbox store. Loses everything on restart.
#[derive(Default)]
pub struct MemoryOutboxStore {
    inner: Mutex<MemoryOutboxState>,
}

#[derive(Default)]
struct MemoryOutboxState {
    records: HashMap<OutboxId, OutboxRecord>,
    last_ordinals: HashMap<ConversationId, u64>,
    confirmations: HashMap<OutboxId, MessageId>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn append_record(&self, entry: NewOutboxEntry) -> Result<AppendOutcome> {
        let mut guard = self.inner.lock().await;
        if guard.records.contains_key(&entry.outbox_id)
            || guard.confirmations.contains_key(&entry.outbox_id)
        {
            return Ok(AppendOutcome::DuplicateId);
        }
        let ordinal = guard
            .last_ordinals
            .entry(entry.conversation_id)
            .and_modify(|last| *last += 1)
            .or_insert(1);
        let record = OutboxRecord {
            outbox_id: entry.outbox_id,
            conversation_id: entry.conversation_id,
            ordinal: *ordinal,
            state: OutboxState::fresh(),
            ctime: entry.ctime,
            msg: entry.msg,
            client_prev: entry.client_prev,
            reply_to: entry.reply_to,
            preview: entry.preview,
        };
        guard.records.insert(record.outbox_id, record.clone());
        Ok(AppendOutcome::Appended(record))
    }

    async fn load_record(&self, outbox_id: OutboxId) -> Result<Option<OutboxRecord>> {
        Ok(self.inner.lock().await.records.get(&outbox_id).cloned())
    }

    async fn list_records(&self, conversation_id: ConversationId) -> Result<Vec<OutboxRecord>> {
        let guard = self.inner.lock().await;
        let mut records: Vec<OutboxRecord> = guard
            .records
            .values()
            .filter(|record| record.conversation_id == conversation_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.ordinal);
        Ok(records)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationId>> {
        let guard = self.inner.lock().await;
        let conversations: BTreeSet<ConversationId> = guard
            .records
            .values()
            .map(|record| record.conversation_id)
            .collect();
        Ok(conversations.into_iter().collect())
    }

    async fn swap_state(
        &self,
        outbox_id: OutboxId,
        expected: &OutboxState,
        next: &OutboxState,
    ) -> Result<CasOutcome> {
        let mut guard = self.inner.lock().await;
        let Some(record) = guard.records.get_mut(&outbox_id) else {
            return Ok(CasOutcome::Missing);
        };
        if &record.state != expected {
            return Ok(CasOutcome::Conflict(record.state.clone()));
        }
        record.state = next.clone();
        Ok(CasOutcome::Applied)
    }

    async fn remove_record(
        &self,
        outbox_id: OutboxId,
        expected: &OutboxState,
    ) -> Result<CasOutcome> {
        let mut guard = self.inner.lock().await;
        let Some(record) = guard.records.get(&outbox_id) else {
            return Ok(CasOutcome::Missing);
        };
        if &record.state != expected {
            return Ok(CasOutcome::Conflict(record.state.clone()));
        }
        guard.records.remove(&outbox_id);
        Ok(CasOutcome::Applied)
    }

    async fn confirm_record(
        &self,
        outbox_id: OutboxId,
        message_id: MessageId,
    ) -> Result<Option<OutboxRecord>> {
        let mut guard = self.inner.lock().await;
        guard.confirmations.insert(outbox_id, message_id);
        Ok(guard.records.remove(&outbox_id))
    }

    async fn load_confirmation(&self, outbox_id: OutboxId) -> Result<Option<MessageId>> {
        Ok(self.inner.lock().await.confirmations.get(&outbox_id).copied())
    }
}
