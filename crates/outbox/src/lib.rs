use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::{
    domain::{ConversationId, MessageId, OutboxId},
    message::{MessagePlaintext, OutboxErrorKind, OutboxRecord, OutboxState},
};
use thiserror::Error;
use tracing::{debug, info, warn};

mod memory;
pub use memory::MemoryOutboxStore;

/// Attempts at a compare-and-swap before giving up on a contended record.
const MAX_CAS_ATTEMPTS: usize = 8;

/// A record about to be appended. The store assigns its ordinal.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub outbox_id: OutboxId,
    pub conversation_id: ConversationId,
    pub msg: MessagePlaintext,
    pub client_prev: MessageId,
    pub reply_to: Option<MessageId>,
    pub preview: Option<String>,
    pub ctime: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(OutboxRecord),
    DuplicateId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    Conflict(OutboxState),
    Missing,
}

/// Durable home of outbox records, keyed by (ConversationID, OutboxID).
///
/// Every method is atomic on its own. `swap_state` and `remove_record` only
/// apply when the stored state still equals `expected`.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append_record(&self, entry: NewOutboxEntry) -> Result<AppendOutcome>;
    async fn load_record(&self, outbox_id: OutboxId) -> Result<Option<OutboxRecord>>;
    /// Records of one conversation in ordinal order.
    async fn list_records(&self, conversation_id: ConversationId) -> Result<Vec<OutboxRecord>>;
    async fn list_conversations(&self) -> Result<Vec<ConversationId>>;
    async fn swap_state(
        &self,
        outbox_id: OutboxId,
        expected: &OutboxState,
        next: &OutboxState,
    ) -> Result<CasOutcome>;
    async fn remove_record(&self, outbox_id: OutboxId, expected: &OutboxState)
        -> Result<CasOutcome>;
    /// Removes the record if present and always remembers `outbox_id -> message_id`.
    async fn confirm_record(
        &self,
        outbox_id: OutboxId,
        message_id: MessageId,
    ) -> Result<Option<OutboxRecord>>;
    async fn load_confirmation(&self, outbox_id: OutboxId) -> Result<Option<MessageId>>;
}

#[async_trait]
impl<T: OutboxStore + ?Sized> OutboxStore for Arc<T> {
    async fn append_record(&self, entry: NewOutboxEntry) -> Result<AppendOutcome> {
        (**self).append_record(entry).await
    }

    async fn load_record(&self, outbox_id: OutboxId) -> Result<Option<OutboxRecord>> {
        (**self).load_record(outbox_id).await
    }

    async fn list_records(&self, conversation_id: ConversationId) -> Result<Vec<OutboxRecord>> {
        (**self).list_records(conversation_id).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationId>> {
        (**self).list_conversations().await
    }

    async fn swap_state(
        &self,
        outbox_id: OutboxId,
        expected: &OutboxState,
        next: &OutboxState,
    ) -> Result<CasOutcome> {
        (**self).swap_state(outbox_id, expected, next).await
    }

    async fn remove_record(
        &self,
        outbox_id: OutboxId,
        expected: &OutboxState,
    ) -> Result<CasOutcome> {
        (**self).remove_record(outbox_id, expected).await
    }

    async fn confirm_record(
        &self,
        outbox_id: OutboxId,
        message_id: MessageId,
    ) -> Result<Option<OutboxRecord>> {
        (**self).confirm_record(outbox_id, message_id).await
    }

    async fn load_confirmation(&self, outbox_id: OutboxId) -> Result<Option<MessageId>> {
        (**self).load_confirmation(outbox_id).await
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox record {0} not found")]
    NotFound(OutboxId),
    #[error("outbox record {outbox_id} failed with {kind:?}, which cannot be retried")]
    NotRetryable {
        outbox_id: OutboxId,
        kind: OutboxErrorKind,
    },
    #[error("outbox record {outbox_id} was already delivered as message {message_id}")]
    AlreadySent {
        outbox_id: OutboxId,
        message_id: MessageId,
    },
    #[error("outbox record {outbox_id} is in error state {kind:?} and must be retried first")]
    NotSending {
        outbox_id: OutboxId,
        kind: OutboxErrorKind,
    },
    #[error("outbox id {0} is already in use")]
    DuplicateOutboxId(OutboxId),
    #[error("outbox record {outbox_id} kept changing under concurrent updates")]
    Conflict { outbox_id: OutboxId },
    #[error("outbox store failure: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Reuse a caller-generated id, e.g. one the UI already rendered.
    pub outbox_id: Option<OutboxId>,
    pub client_prev: Option<MessageId>,
    pub reply_to: Option<MessageId>,
    pub preview: Option<String>,
}

enum Transition {
    Keep,
    Set(OutboxState),
    Remove,
}

pub struct Outbox<S: OutboxStore> {
    store: S,
}

impl<S: OutboxStore> Outbox<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Durably records a new send in `Sending` state. Never waits on the network.
    pub async fn enqueue(
        &self,
        conversation_id: ConversationId,
        msg: MessagePlaintext,
        options: EnqueueOptions,
    ) -> Result<OutboxRecord, OutboxError> {
        let outbox_id = options.outbox_id.unwrap_or_else(OutboxId::generate);
        let entry = NewOutboxEntry {
            outbox_id,
            conversation_id,
            msg,
            client_prev: options.client_prev.unwrap_or(MessageId::NONE),
            reply_to: options.reply_to,
            preview: options.preview,
            ctime: Utc::now(),
        };
        match self.store.append_record(entry).await? {
            AppendOutcome::Appended(record) => {
                info!(
                    conversation_id = conversation_id.0,
                    outbox_id = %record.outbox_id,
                    ordinal = record.ordinal,
                    "outbox: enqueued"
                );
                Ok(record)
            }
            AppendOutcome::DuplicateId => Err(OutboxError::DuplicateOutboxId(outbox_id)),
        }
    }

    pub async fn record(&self, outbox_id: OutboxId) -> Result<OutboxRecord, OutboxError> {
        match self.store.load_record(outbox_id).await? {
            Some(record) => Ok(record),
            None => Err(self.missing(outbox_id).await),
        }
    }

    pub async fn pending(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        Ok(self.store.list_records(conversation_id).await?)
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationId>, OutboxError> {
        Ok(self.store.list_conversations().await?)
    }

    pub async fn confirmation(&self, outbox_id: OutboxId) -> Result<Option<MessageId>, OutboxError> {
        Ok(self.store.load_confirmation(outbox_id).await?)
    }

    /// Counts one delivery attempt. Fails with `NotSending` if the record is in error.
    pub async fn record_attempt(&self, outbox_id: OutboxId) -> Result<OutboxRecord, OutboxError> {
        self.transition(outbox_id, |record| match &record.state {
            OutboxState::Sending { attempts } => Ok(Transition::Set(OutboxState::Sending {
                attempts: attempts.saturating_add(1),
            })),
            OutboxState::Error { kind, .. } => Err(OutboxError::NotSending {
                outbox_id,
                kind: *kind,
            }),
        })
        .await
    }

    pub async fn mark_error(
        &self,
        outbox_id: OutboxId,
        kind: OutboxErrorKind,
        message: impl Into<String>,
    ) -> Result<OutboxRecord, OutboxError> {
        let next = OutboxState::Error {
            kind,
            message: message.into(),
        };
        let record = self
            .transition(outbox_id, |record| {
                if record.state == next {
                    Ok(Transition::Keep)
                } else {
                    Ok(Transition::Set(next.clone()))
                }
            })
            .await?;
        warn!(
            conversation_id = record.conversation_id.0,
            outbox_id = %outbox_id,
            ordinal = record.ordinal,
            kind = ?kind,
            "outbox: send failed"
        );
        Ok(record)
    }

    /// Removes a delivered record. Returns `None` when it was already gone,
    /// e.g. cancelled while the send was in flight. The confirmation is kept
    /// either way so later cancels report `AlreadySent`.
    pub async fn mark_sent(
        &self,
        outbox_id: OutboxId,
        message_id: MessageId,
    ) -> Result<Option<OutboxRecord>, OutboxError> {
        let removed = self.store.confirm_record(outbox_id, message_id).await?;
        match &removed {
            Some(record) => info!(
                conversation_id = record.conversation_id.0,
                outbox_id = %outbox_id,
                ordinal = record.ordinal,
                message_id = message_id.0,
                "outbox: confirmed"
            ),
            None => warn!(
                outbox_id = %outbox_id,
                message_id = message_id.0,
                "outbox: confirmation arrived for a record that is no longer queued"
            ),
        }
        Ok(removed)
    }

    pub async fn cancel(&self, outbox_id: OutboxId) -> Result<OutboxRecord, OutboxError> {
        let record = self
            .transition(outbox_id, |_| Ok(Transition::Remove))
            .await?;
        info!(
            conversation_id = record.conversation_id.0,
            outbox_id = %outbox_id,
            ordinal = record.ordinal,
            "outbox: cancelled"
        );
        Ok(record)
    }

    /// Puts a failed record back into `Sending`. Terminal kinds are refused
    /// without touching the stored state.
    pub async fn retry(&self, outbox_id: OutboxId) -> Result<OutboxRecord, OutboxError> {
        let record = self
            .transition(outbox_id, |record| match &record.state {
                OutboxState::Sending { .. } => Ok(Transition::Keep),
                OutboxState::Error { kind, .. } if !kind.is_retryable() => {
                    Err(OutboxError::NotRetryable {
                        outbox_id,
                        kind: *kind,
                    })
                }
                OutboxState::Error { .. } => Ok(Transition::Set(OutboxState::fresh())),
            })
            .await?;
        info!(
            conversation_id = record.conversation_id.0,
            outbox_id = %outbox_id,
            "outbox: retry requested"
        );
        Ok(record)
    }

    /// Moves `Sending` records older than `max_age` to `Error{Expired}`.
    pub async fn expire_stale(
        &self,
        now: DateTime<Utc>,
        max_age: ChronoDuration,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut expired = Vec::new();
        for conversation_id in self.store.list_conversations().await? {
            for record in self.store.list_records(conversation_id).await? {
                if !record.state.is_sending() || record.ctime + max_age > now {
                    continue;
                }
                match self
                    .mark_error(
                        record.outbox_id,
                        OutboxErrorKind::Expired,
                        "message expired before it could be sent",
                    )
                    .await
                {
                    Ok(updated) => expired.push(updated),
                    Err(OutboxError::NotFound(_) | OutboxError::AlreadySent { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(expired)
    }

    async fn transition<F>(
        &self,
        outbox_id: OutboxId,
        mut decide: F,
    ) -> Result<OutboxRecord, OutboxError>
    where
        F: FnMut(&OutboxRecord) -> Result<Transition, OutboxError> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(mut record) = self.store.load_record(outbox_id).await? else {
                return Err(self.missing(outbox_id).await);
            };
            let outcome = match decide(&record)? {
                Transition::Keep => return Ok(record),
                Transition::Set(next) => {
                    let outcome = self.store.swap_state(outbox_id, &record.state, &next).await?;
                    record.state = next;
                    outcome
                }
                Transition::Remove => self.store.remove_record(outbox_id, &record.state).await?,
            };
            match outcome {
                CasOutcome::Applied => return Ok(record),
                CasOutcome::Conflict(current) => {
                    debug!(
                        outbox_id = %outbox_id,
                        current = ?current,
                        "outbox: state changed underneath, retrying"
                    );
                }
                CasOutcome::Missing => return Err(self.missing(outbox_id).await),
            }
        }
        Err(OutboxError::Conflict { outbox_id })
    }

    async fn missing(&self, outbox_id: OutboxId) -> OutboxError {
        match self.store.load_confirmation(outbox_id).await {
            Ok(Some(message_id)) => OutboxError::AlreadySent {
                outbox_id,
                message_id,
            },
            Ok(None) => OutboxError::NotFound(outbox_id),
            Err(err) => OutboxError::Store(err),
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
