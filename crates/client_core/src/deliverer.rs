use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use outbox::OutboxError;
use sealing::SealError;
use shared::{
    body::MessageBody,
    domain::{ConversationId, MessageId},
    message::{
        MessageUnboxed, MessageUnboxedValid, OutboxErrorKind, OutboxRecord, OutboxState,
        ReactionMap, ServerHeader,
    },
};
use tracing::{debug, info, warn};

use crate::{
    boxer::{oversized_text, prepare_envelope, PreparedEnvelope},
    chain_head::head_of,
    error::ChatError,
    transport::TransportError,
    ChatClient, ChatEvent,
};

/// What one pass over a conversation's queue should do next.
enum Step {
    Continue,
    Stop,
}

impl ChatClient {
    /// One pass of the sender loop over every conversation with queued sends.
    /// Conversations run in parallel; each queue is drained in ordinal order.
    pub async fn deliver_pending_once(&self) -> Result<usize, ChatError> {
        self.expire_stale().await?;
        let conversations = self.outbox.conversations().await?;
        let results = join_all(
            conversations
                .iter()
                .map(|conversation_id| self.deliver_conversation(*conversation_id)),
        )
        .await;

        let mut sent = 0;
        for result in results {
            sent += result?;
        }
        Ok(sent)
    }

    /// Sends queued records of one conversation until the queue empties or
    /// its head cannot go out yet. A failed head blocks everything behind it.
    ///
    /// The conversation lock is held for one head at a time, so a cancel or
    /// retry queued behind it runs before the next head is picked.
    pub async fn deliver_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, ChatError> {
        let mut sent = 0;
        loop {
            let lock = self.conversation_lock(conversation_id).await;
            let step = {
                let _guard = lock.lock().await;
                match self.outbox.pending(conversation_id).await {
                    Ok(pending) => match pending.into_iter().next() {
                        Some(head) => self.deliver_head(head).await.map(Some),
                        None => Ok(None),
                    },
                    Err(err) => Err(err.into()),
                }
            };
            self.release_conversation_lock(conversation_id, lock).await;

            match step? {
                Some((Step::Continue, delivered)) => sent += usize::from(delivered),
                Some((Step::Stop, delivered)) => {
                    sent += usize::from(delivered);
                    break;
                }
                None => break,
            }
        }
        Ok(sent)
    }

    async fn deliver_head(&self, record: OutboxRecord) -> Result<(Step, bool), ChatError> {
        let outbox_id = record.outbox_id;
        if self.backing_off(&record).await {
            return Ok((Step::Stop, false));
        }

        let attempts = match &record.state {
            OutboxState::Sending { attempts } => *attempts,
            OutboxState::Error { kind, .. } if kind.is_auto_retryable() => {
                debug!(
                    conversation_id = record.conversation_id.0,
                    outbox_id = %outbox_id,
                    "deliverer: retrying offline send"
                );
                return match self.outbox.retry(outbox_id).await {
                    Ok(_) => Ok((Step::Continue, false)),
                    Err(OutboxError::NotFound(_) | OutboxError::AlreadySent { .. }) => {
                        Ok((Step::Continue, false))
                    }
                    Err(err) => Err(err.into()),
                };
            }
            OutboxState::Error { .. } => return Ok((Step::Stop, false)),
        };

        if attempts >= self.config.max_attempts {
            self.fail(&record, OutboxErrorKind::TooManyAttempts, "too many send attempts")
                .await?;
            return Ok((Step::Stop, false));
        }
        if let Some(len) = oversized_text(&record.msg.body, self.config.max_text_length) {
            let message = format!(
                "message is {len} characters, the limit is {}",
                self.config.max_text_length
            );
            self.fail(&record, OutboxErrorKind::TooLong, message).await?;
            return Ok((Step::Stop, false));
        }
        if let Some(target) = self.deleted_target(&record).await? {
            let message = format!("message {target} was already deleted");
            self.fail(&record, OutboxErrorKind::AlreadyDeleted, message)
                .await?;
            return Ok((Step::Stop, false));
        }

        let head = match self.resolve_chain_head(record.conversation_id).await {
            Ok(head) => head,
            Err(err) => {
                warn!(
                    conversation_id = record.conversation_id.0,
                    outbox_id = %outbox_id,
                    "deliverer: chain head unavailable: {err:#}"
                );
                if err.downcast_ref::<TransportError>() == Some(&TransportError::Offline) {
                    self.fail(&record, OutboxErrorKind::Offline, "transport is offline")
                        .await?;
                    self.back_off_offline(&record).await;
                } else {
                    self.back_off(&record, attempts + 1).await;
                }
                return Ok((Step::Stop, false));
            }
        };

        let record = match self.outbox.record_attempt(outbox_id).await {
            Ok(record) => record,
            Err(OutboxError::NotFound(_) | OutboxError::AlreadySent { .. }) => {
                return Ok((Step::Continue, false))
            }
            Err(err) => return Err(err.into()),
        };
        let prepared = match prepare_envelope(&record, head.as_ref()) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.fail(&record, OutboxErrorKind::Misc, err.to_string())
                    .await?;
                return Ok((Step::Stop, false));
            }
        };
        let sealed = match self
            .sealing
            .seal(
                record.conversation_id,
                &prepared.encoded,
                record.msg.ephemeral_metadata,
            )
            .await
        {
            Ok(sealed) => sealed,
            Err(err) => {
                let kind = match err {
                    SealError::Identify { .. } => OutboxErrorKind::Identify,
                    _ => OutboxErrorKind::Misc,
                };
                self.fail(&record, kind, err.to_string()).await?;
                return Ok((Step::Stop, false));
            }
        };

        match self.transport.deliver(record.conversation_id, &sealed).await {
            Ok(message_id) => {
                self.confirm(&record, prepared, message_id).await?;
                Ok((Step::Continue, true))
            }
            Err(TransportError::Offline) => {
                self.fail(&record, OutboxErrorKind::Offline, "transport is offline")
                    .await?;
                self.back_off_offline(&record).await;
                Ok((Step::Stop, false))
            }
            Err(TransportError::RateLimited { retry_after }) => {
                warn!(
                    conversation_id = record.conversation_id.0,
                    outbox_id = %outbox_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "deliverer: rate limited"
                );
                let delay = retry_after.max(self.config.backoff(record_attempts(&record)));
                self.inner
                    .lock()
                    .await
                    .retry_after
                    .insert(outbox_id, Instant::now() + delay);
                Ok((Step::Stop, false))
            }
            Err(TransportError::Rejected { reason }) => {
                self.fail(&record, OutboxErrorKind::Misc, reason).await?;
                Ok((Step::Stop, false))
            }
        }
    }

    async fn confirm(
        &self,
        record: &OutboxRecord,
        prepared: PreparedEnvelope,
        message_id: MessageId,
    ) -> Result<(), ChatError> {
        let conversation_id = record.conversation_id;
        self.outbox.mark_sent(record.outbox_id, message_id).await?;
        self.forget_backoff(record.outbox_id).await;

        let mentions = self.unboxer.resolve_mentions(&record.msg.body).await;
        let valid = MessageUnboxedValid {
            conversation_id,
            server_header: ServerHeader {
                message_id,
                ctime: Utc::now(),
                superseded_by: None,
            },
            header_hash: prepared.encoded.header_hash(),
            client_header: prepared.header,
            body: record.msg.body.clone(),
            sender_username: self.identity.username.clone(),
            sender_device_name: self.identity.device_name.clone(),
            at_mention_usernames: mentions.at_mention_usernames,
            at_mentions: mentions.at_mentions,
            channel_mention: mentions.channel_mention,
            team_mentions: mentions.team_mentions,
            reactions: ReactionMap::default(),
            unfurls: Default::default(),
            reply_to: record.reply_to,
        };
        let head = head_of(&valid);
        self.store_confirmed(conversation_id, &MessageUnboxed::Valid(valid))
            .await?;
        self.advance_chain_head(conversation_id, head).await?;

        info!(
            conversation_id = conversation_id.0,
            outbox_id = %record.outbox_id,
            ordinal = record.ordinal,
            message_id = message_id.0,
            "deliverer: sent"
        );
        let _ = self.events.send(ChatEvent::OutboxSent {
            conversation_id,
            outbox_id: record.outbox_id,
            message_id,
        });
        Ok(())
    }

    async fn fail(
        &self,
        record: &OutboxRecord,
        kind: OutboxErrorKind,
        message: impl Into<String>,
    ) -> Result<(), ChatError> {
        match self.outbox.mark_error(record.outbox_id, kind, message).await {
            Ok(_) => {
                self.emit_failed(record, kind);
                Ok(())
            }
            // Cancelled or confirmed meanwhile; nothing left to fail.
            Err(OutboxError::NotFound(_) | OutboxError::AlreadySent { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete or edit whose target is already gone from the cache view.
    async fn deleted_target(&self, record: &OutboxRecord) -> Result<Option<MessageId>, ChatError> {
        if !matches!(record.msg.body, MessageBody::Edit(_) | MessageBody::Delete(_)) {
            return Ok(None);
        }
        for target in record.msg.body.target_message_ids() {
            let cached = self
                .cache
                .load_message(record.conversation_id, target)
                .await?;
            if matches!(cached, Some(MessageUnboxed::Placeholder(p)) if p.hidden) {
                return Ok(Some(target));
            }
        }
        Ok(None)
    }

    async fn backing_off(&self, record: &OutboxRecord) -> bool {
        let mut state = self.inner.lock().await;
        match state.retry_after.get(&record.outbox_id) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                state.retry_after.remove(&record.outbox_id);
                false
            }
            None => false,
        }
    }

    async fn back_off(&self, record: &OutboxRecord, attempts: u32) {
        let delay = self.config.backoff(attempts);
        self.inner
            .lock()
            .await
            .retry_after
            .insert(record.outbox_id, Instant::now() + delay);
    }

    /// The automatic retry resets the record's attempts, so offline failures
    /// are counted here instead.
    async fn back_off_offline(&self, record: &OutboxRecord) {
        let mut state = self.inner.lock().await;
        let failures = state
            .offline_failures
            .entry(record.outbox_id)
            .or_insert(0);
        *failures = failures.saturating_add(1);
        let delay = self.config.backoff(*failures);
        state
            .retry_after
            .insert(record.outbox_id, Instant::now() + delay);
    }
}

fn record_attempts(record: &OutboxRecord) -> u32 {
    match record.state {
        OutboxState::Sending { attempts } => attempts,
        OutboxState::Error { .. } => 1,
    }
}
