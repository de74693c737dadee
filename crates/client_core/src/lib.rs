use std::{collections::HashMap, sync::Arc, time::Instant};

use anyhow::Result as AnyResult;
use chrono::Utc;
use outbox::{EnqueueOptions, MemoryOutboxStore, Outbox, OutboxStore};
use sealing::{MissingSealingService, SealedEnvelope, SealingService};
use shared::{
    body::{MessageBody, MessageDelete, MessageEdit, MessageText},
    domain::{ConversationId, ConversationTriple, DeviceId, MessageId, OutboxId, UserId},
    message::{
        ChainHead, MessagePlaintext, MessageUnboxed, MessageUnboxedValid, OutboxErrorKind,
        OutboxRecord, ServerHeader,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

pub mod boxer;
pub mod cache;
mod chain_head;
pub mod config;
mod deliverer;
pub mod error;
pub mod mentions;
pub mod state_resolution;
pub mod thread;
pub mod transport;
pub mod unboxer;

pub use cache::{MemoryMessageCache, MessageCache};
pub use config::ClientConfig;
pub use error::ChatError;
pub use mentions::{DirectoryMentionResolver, MentionResolver, MissingMentionResolver};
pub use thread::{Pagination, ThreadView};
pub use transport::{
    InboundMessage, LoopbackTransport, MissingTransport, Transport, TransportError,
};
pub use unboxer::Unboxer;

/// The local user and device messages are composed as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub username: String,
    pub device_name: String,
}

/// What a conversation header needs beyond the conversation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationInfo {
    pub triple: ConversationTriple,
    pub tlf_name: String,
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    OutboxEnqueued(OutboxRecord),
    OutboxSent {
        conversation_id: ConversationId,
        outbox_id: OutboxId,
        message_id: MessageId,
    },
    OutboxFailed {
        conversation_id: ConversationId,
        outbox_id: OutboxId,
        kind: OutboxErrorKind,
    },
    OutboxCancelled {
        conversation_id: ConversationId,
        outbox_id: OutboxId,
    },
    MessageReceived(MessageUnboxed),
    Error(String),
}

pub struct ChatClient {
    config: ClientConfig,
    identity: ClientIdentity,
    outbox: Outbox<Arc<dyn OutboxStore>>,
    cache: Arc<dyn MessageCache>,
    sealing: Arc<dyn SealingService>,
    transport: Arc<dyn Transport>,
    unboxer: Unboxer,
    inner: Mutex<ChatClientState>,
    /// One entry per conversation this client has sent or received in, the
    /// same bound as `ChatClientState::conversations`.
    chain_heads: Mutex<HashMap<ConversationId, ChainHead>>,
    /// Serializes sends, cancels and retries within one conversation. An
    /// entry is dropped once nobody holds or waits on it.
    conversation_locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
    events: broadcast::Sender<ChatEvent>,
}

struct ChatClientState {
    conversations: HashMap<ConversationId, ConversationInfo>,
    retry_after: HashMap<OutboxId, Instant>,
    /// Consecutive offline failures per record. Survives the automatic
    /// retry so the backoff keeps growing while the transport is down.
    offline_failures: HashMap<OutboxId, u32>,
}

impl ChatClient {
    /// A client with in-memory stores and no sealing or network backends.
    pub fn new(config: ClientConfig, identity: ClientIdentity) -> Arc<Self> {
        Self::new_with_dependencies(
            config,
            identity,
            Arc::new(MemoryOutboxStore::new()),
            Arc::new(MemoryMessageCache::new()),
            Arc::new(MissingSealingService),
            Arc::new(MissingTransport),
            Arc::new(MissingMentionResolver),
        )
    }

    pub fn new_with_dependencies(
        config: ClientConfig,
        identity: ClientIdentity,
        outbox_store: Arc<dyn OutboxStore>,
        cache: Arc<dyn MessageCache>,
        sealing: Arc<dyn SealingService>,
        transport: Arc<dyn Transport>,
        mentions: Arc<dyn MentionResolver>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            identity,
            outbox: Outbox::new(outbox_store),
            cache,
            unboxer: Unboxer::new(Arc::clone(&sealing), mentions),
            sealing,
            transport,
            inner: Mutex::new(ChatClientState {
                conversations: HashMap::new(),
                retry_after: HashMap::new(),
                offline_failures: HashMap::new(),
            }),
            chain_heads: Mutex::new(HashMap::new()),
            conversation_locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub async fn register_conversation(
        &self,
        conversation_id: ConversationId,
        info: ConversationInfo,
    ) {
        self.inner
            .lock()
            .await
            .conversations
            .insert(conversation_id, info);
    }

    /// Queues `msg` for delivery and returns at once with the new record.
    pub async fn post_message(
        &self,
        conversation_id: ConversationId,
        msg: MessagePlaintext,
        mut options: EnqueueOptions,
    ) -> Result<OutboxRecord, ChatError> {
        if options.client_prev.is_none() {
            options.client_prev = self.cache.latest_message_id(conversation_id).await?;
        }
        if options.reply_to.is_none() {
            options.reply_to = msg.body.reply_to();
        }
        if options.preview.is_none() {
            options.preview = msg.body.user_text().map(preview_text);
        }

        let record = self.outbox.enqueue(conversation_id, msg, options).await?;
        let _ = self.events.send(ChatEvent::OutboxEnqueued(record.clone()));
        Ok(record)
    }

    pub async fn post_text(
        &self,
        conversation_id: ConversationId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<OutboxRecord, ChatError> {
        let body = MessageBody::Text(MessageText {
            body: text.to_string(),
            payments: Vec::new(),
            user_mentions: Vec::new(),
            team_mentions: Vec::new(),
            reply_to,
        });
        let msg = self.compose(conversation_id, body).await?;
        self.post_message(conversation_id, msg, EnqueueOptions::default())
            .await
    }

    /// Queues an edit of one of this user's messages.
    pub async fn edit_message(
        &self,
        conversation_id: ConversationId,
        target: MessageId,
        text: &str,
    ) -> Result<OutboxRecord, ChatError> {
        self.own_target(conversation_id, target, "edit").await?;
        let body = MessageBody::Edit(MessageEdit {
            message_id: target,
            body: text.to_string(),
            user_mentions: Vec::new(),
            team_mentions: Vec::new(),
        });
        let msg = self.compose(conversation_id, body).await?;
        self.post_message(conversation_id, msg, EnqueueOptions::default())
            .await
    }

    pub async fn delete_message(
        &self,
        conversation_id: ConversationId,
        targets: &[MessageId],
    ) -> Result<OutboxRecord, ChatError> {
        if targets.is_empty() {
            return Err(ChatError::Validation("nothing to delete".into()));
        }
        for target in targets {
            self.own_target(conversation_id, *target, "delete").await?;
        }
        let body = MessageBody::Delete(MessageDelete {
            message_ids: targets.to_vec(),
        });
        let msg = self.compose(conversation_id, body).await?;
        self.post_message(conversation_id, msg, EnqueueOptions::default())
            .await
    }

    /// Removes a queued send. Waits only for the attempt currently in flight
    /// on the same conversation, and reports `AlreadySent` if that attempt
    /// was this record and went through.
    pub async fn cancel_pending_send(&self, outbox_id: OutboxId) -> Result<OutboxRecord, ChatError> {
        let conversation_id = self.outbox.record(outbox_id).await?.conversation_id;
        let lock = self.conversation_lock(conversation_id).await;
        let cancelled = {
            let _guard = lock.lock().await;
            self.outbox.cancel(outbox_id).await
        };
        self.release_conversation_lock(conversation_id, lock).await;

        let record = cancelled?;
        self.forget_backoff(outbox_id).await;
        let _ = self.events.send(ChatEvent::OutboxCancelled {
            conversation_id,
            outbox_id,
        });
        Ok(record)
    }

    /// Puts a failed send back in the queue; the next sender pass picks it up.
    pub async fn retry_pending_send(&self, outbox_id: OutboxId) -> Result<OutboxRecord, ChatError> {
        let conversation_id = self.outbox.record(outbox_id).await?.conversation_id;
        let lock = self.conversation_lock(conversation_id).await;
        let retried = {
            let _guard = lock.lock().await;
            self.outbox.retry(outbox_id).await
        };
        self.release_conversation_lock(conversation_id, lock).await;

        let record = retried?;
        self.forget_backoff(outbox_id).await;
        Ok(record)
    }

    pub async fn pending_sends(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<OutboxRecord>, ChatError> {
        Ok(self.outbox.pending(conversation_id).await?)
    }

    /// One page of the thread, oldest first. The newest page also carries
    /// pending sends; ids missing from the cache come back as placeholders.
    pub async fn get_thread(
        &self,
        conversation_id: ConversationId,
        pagination: Pagination,
    ) -> Result<ThreadView, ChatError> {
        let num = if pagination.num == 0 {
            self.config.page_size
        } else {
            pagination.num
        };
        let upper = match pagination.before {
            Some(before) => MessageId(before.0.saturating_sub(1)),
            None => self
                .cache
                .latest_message_id(conversation_id)
                .await?
                .unwrap_or(MessageId::NONE),
        };
        let lower = MessageId(
            upper
                .0
                .saturating_sub(i64::from(num))
                .saturating_add(1)
                .max(1),
        );

        let mut messages = if upper.0 >= 1 {
            let cached = self
                .cache
                .list_messages(conversation_id, Some(upper.next()), num)
                .await?;
            thread::fill_gaps(cached, lower, upper)
        } else {
            Vec::new()
        };
        thread::apply_supersedes(&mut messages);

        if pagination.before.is_none() {
            let pending = self.outbox.pending(conversation_id).await?;
            messages = thread::assemble(&messages, &pending);
        }
        let next = (lower.0 > 1).then_some(Pagination {
            num,
            before: Some(lower),
        });
        Ok(ThreadView { messages, next })
    }

    /// Unboxes one inbound envelope, caches it, and settles any local
    /// outbox record it confirms.
    pub async fn receive_message(
        &self,
        sealed: &SealedEnvelope,
        server_header: &ServerHeader,
    ) -> Result<MessageUnboxed, ChatError> {
        let message = self.unboxer.unbox(sealed, server_header).await;
        self.accept_unboxed(sealed.conversation_id, message).await
    }

    /// Pulls messages newer than the cache from the transport and receives
    /// them, opening up to `unbox_concurrency` envelopes at once.
    pub async fn sync_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageUnboxed>, ChatError> {
        let latest = self.cache.latest_message_id(conversation_id).await?;
        let inbound: Vec<InboundMessage> = self
            .transport
            .fetch_messages(conversation_id, None, self.config.page_size)
            .await?
            .into_iter()
            .filter(|m| latest.map_or(true, |latest| m.server_header.message_id > latest))
            .collect();

        let unboxed = self
            .unboxer
            .unbox_many(&inbound, self.config.unbox_concurrency)
            .await;
        let mut received = Vec::with_capacity(unboxed.len());
        for message in unboxed {
            received.push(self.accept_unboxed(conversation_id, message).await?);
        }
        debug!(
            conversation_id = conversation_id.0,
            count = received.len(),
            "sync: received history"
        );
        Ok(received)
    }

    /// Runs the sender loop until the returned handle is aborted.
    pub fn start_deliverer(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.config.deliverer_interval);
            loop {
                ticker.tick().await;
                if let Err(err) = client.deliver_pending_once().await {
                    error!("deliverer: pass failed: {err}");
                    let _ = client.events.send(ChatEvent::Error(err.to_string()));
                }
            }
        })
    }

    async fn accept_unboxed(
        &self,
        conversation_id: ConversationId,
        mut message: MessageUnboxed,
    ) -> Result<MessageUnboxed, ChatError> {
        // Only this device's own sends can have a local outbox record.
        let own = message.as_valid().filter(|valid| {
            valid.client_header.sender == self.identity.user_id
                && valid.client_header.sender_device == self.identity.device_id
        });
        if let Some(valid) = own {
            if let Some(outbox_id) = valid.outbox_id() {
                let message_id = valid.server_header.message_id;
                if self.outbox.mark_sent(outbox_id, message_id).await?.is_some() {
                    self.forget_backoff(outbox_id).await;
                    let _ = self.events.send(ChatEvent::OutboxSent {
                        conversation_id,
                        outbox_id,
                        message_id,
                    });
                }
            }
        }

        let head = message.as_valid().map(chain_head::head_of);
        // A delete for this slot may have arrived first.
        if let Some(existing) = self.existing_slot(conversation_id, &message).await? {
            message = existing;
        }
        self.store_confirmed(conversation_id, &message).await?;
        if let Some(head) = head {
            self.advance_chain_head(conversation_id, head).await?;
        }
        let _ = self.events.send(ChatEvent::MessageReceived(message.clone()));
        Ok(message)
    }

    /// Keeps a hidden placeholder already cached for this id instead of
    /// resurrecting a deleted message.
    async fn existing_slot(
        &self,
        conversation_id: ConversationId,
        message: &MessageUnboxed,
    ) -> AnyResult<Option<MessageUnboxed>> {
        let Some(message_id) = message.message_id() else {
            return Ok(None);
        };
        Ok(self
            .cache
            .load_message(conversation_id, message_id)
            .await?
            .filter(|existing| matches!(existing, MessageUnboxed::Placeholder(p) if p.hidden)))
    }

    /// Caches a confirmed slot and folds it into the messages it modifies.
    async fn store_confirmed(
        &self,
        conversation_id: ConversationId,
        message: &MessageUnboxed,
    ) -> AnyResult<()> {
        self.cache.put_message(conversation_id, message).await?;
        match message.as_valid() {
            Some(valid) => self.supersede_cached(conversation_id, valid).await,
            None => Ok(()),
        }
    }

    async fn supersede_cached(
        &self,
        conversation_id: ConversationId,
        modifier: &MessageUnboxedValid,
    ) -> AnyResult<()> {
        for target_id in modifier.body.target_message_ids() {
            let Some(mut target) = self.cache.load_message(conversation_id, target_id).await?
            else {
                debug!(
                    conversation_id = conversation_id.0,
                    message_id = target_id.0,
                    "supersede: target not cached"
                );
                continue;
            };
            if let Some((reacted_id, reaction_id)) = thread::deleted_reaction(&target, modifier) {
                if let Some(mut reacted) = self.cache.load_message(conversation_id, reacted_id).await?
                {
                    if thread::unreact(&mut reacted, reaction_id) {
                        self.cache.put_message(conversation_id, &reacted).await?;
                    }
                }
            }
            if thread::apply_modifier(&mut target, modifier) {
                self.cache.put_message(conversation_id, &target).await?;
            }
        }
        Ok(())
    }

    async fn compose(
        &self,
        conversation_id: ConversationId,
        body: MessageBody,
    ) -> Result<MessagePlaintext, ChatError> {
        let info = self
            .inner
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(ChatError::UnknownConversation(conversation_id))?;
        Ok(MessagePlaintext {
            conv: info.triple,
            tlf_name: info.tlf_name,
            sender: self.identity.user_id,
            sender_device: self.identity.device_id,
            body,
            ephemeral_metadata: None,
        })
    }

    async fn own_target(
        &self,
        conversation_id: ConversationId,
        target: MessageId,
        action: &str,
    ) -> Result<(), ChatError> {
        let not_found = || ChatError::MessageNotFound {
            conversation_id,
            message_id: target,
        };
        let cached = self
            .cache
            .load_message(conversation_id, target)
            .await?
            .ok_or_else(not_found)?;
        match cached {
            MessageUnboxed::Valid(valid) if valid.client_header.sender == self.identity.user_id => {
                Ok(())
            }
            MessageUnboxed::Valid(_) => Err(ChatError::Validation(format!(
                "cannot {action} message {target}: it was sent by someone else"
            ))),
            MessageUnboxed::Placeholder(p) if p.hidden => Err(ChatError::Validation(format!(
                "cannot {action} message {target}: it was deleted"
            ))),
            _ => Err(ChatError::Validation(format!(
                "cannot {action} message {target}: it is not available"
            ))),
        }
    }

    async fn conversation_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.conversation_locks
                .lock()
                .await
                .entry(conversation_id)
                .or_default(),
        )
    }

    /// Drops the conversation's lock entry when the map and `lock` are its
    /// only holders. Checked under the map lock, so no new clone can appear.
    async fn release_conversation_lock(
        &self,
        conversation_id: ConversationId,
        lock: Arc<Mutex<()>>,
    ) {
        let mut locks = self.conversation_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&conversation_id);
        }
    }

    async fn forget_backoff(&self, outbox_id: OutboxId) {
        let mut state = self.inner.lock().await;
        state.retry_after.remove(&outbox_id);
        state.offline_failures.remove(&outbox_id);
    }

    fn emit_failed(&self, record: &OutboxRecord, kind: OutboxErrorKind) {
        let _ = self.events.send(ChatEvent::OutboxFailed {
            conversation_id: record.conversation_id,
            outbox_id: record.outbox_id,
            kind,
        });
    }

    /// Drops outbox records older than the configured expiry.
    async fn expire_stale(&self) -> Result<(), ChatError> {
        let expired = self
            .outbox
            .expire_stale(Utc::now(), self.config.outbox_expiry_chrono())
            .await?;
        for record in &expired {
            warn!(
                conversation_id = record.conversation_id.0,
                outbox_id = %record.outbox_id,
                "deliverer: send expired"
            );
            self.forget_backoff(record.outbox_id).await;
            self.emit_failed(record, OutboxErrorKind::Expired);
        }
        Ok(())
    }
}

fn preview_text(text: &str) -> String {
    const PREVIEW_CHARS: usize = 80;
    text.chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
