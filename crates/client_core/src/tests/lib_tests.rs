use std::time::Duration;

use async_trait::async_trait;
use outbox::OutboxError;
use sealing::{DeviceIdentity, GroupKeySealer};
use shared::{
    domain::{TlfId, TopicId, TopicType},
    message::{MessageUnboxedPlaceholder, OutboxState},
};
use storage::Storage;
use tokio::sync::Notify;

use super::*;
use crate::boxer::prepare_envelope;

const CONV: ConversationId = ConversationId(7);

fn test_config() -> ClientConfig {
    ClientConfig {
        backoff_base: Duration::ZERO,
        remote_lookup_timeout: Some(Duration::from_secs(1)),
        ..ClientConfig::default()
    }
}

fn conversation_info() -> ConversationInfo {
    ConversationInfo {
        triple: ConversationTriple {
            tlf_id: TlfId(1),
            topic_type: TopicType::Chat,
            topic_id: TopicId(1),
        },
        tlf_name: "alice,bob".into(),
    }
}

fn identity_of(sealer: &GroupKeySealer) -> ClientIdentity {
    let identity = sealer.identity();
    ClientIdentity {
        user_id: identity.user_id,
        device_id: identity.device_id,
        username: identity.username.clone(),
        device_name: identity.device_name.clone(),
    }
}

struct Peer {
    client: Arc<ChatClient>,
    sealer: Arc<GroupKeySealer>,
}

/// Two members sharing a conversation key, each with a client on `transport`.
async fn pair(config: ClientConfig, transport: Arc<dyn Transport>) -> (Peer, Peer) {
    let alice = Arc::new(GroupKeySealer::new(DeviceIdentity::generate(
        UserId(1),
        DeviceId(10),
        "alice",
        "laptop",
    )));
    let bob = Arc::new(GroupKeySealer::new(DeviceIdentity::generate(
        UserId(2),
        DeviceId(20),
        "bob",
        "phone",
    )));
    alice.register_device(bob.identity().public_record()).await;
    bob.register_device(alice.identity().public_record()).await;
    let (generation, root) = alice.rotate_conversation_key(CONV).await;
    bob.install_conversation_key(CONV, generation, *root).await;

    let alice = peer(config.clone(), alice, Arc::clone(&transport)).await;
    let bob = peer(config, bob, transport).await;
    (alice, bob)
}

async fn peer(
    config: ClientConfig,
    sealer: Arc<GroupKeySealer>,
    transport: Arc<dyn Transport>,
) -> Peer {
    let client = ChatClient::new_with_dependencies(
        config,
        identity_of(&sealer),
        Arc::new(MemoryOutboxStore::new()),
        Arc::new(MemoryMessageCache::new()),
        Arc::clone(&sealer) as Arc<dyn SealingService>,
        transport,
        Arc::new(MissingMentionResolver),
    );
    client.register_conversation(CONV, conversation_info()).await;
    Peer { client, sealer }
}

fn texts(messages: &[MessageUnboxed]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| match message {
            MessageUnboxed::Valid(valid) => valid.body.user_text().map(str::to_string),
            MessageUnboxed::Outbox(record) => record.msg.body.user_text().map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Holds each delivery until released so a cancel can race it.
struct GatedTransport {
    inner: LoopbackTransport,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn deliver(
        &self,
        conversation_id: ConversationId,
        sealed: &SealedEnvelope,
    ) -> Result<MessageId, TransportError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.deliver(conversation_id, sealed).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.inner
            .fetch_messages(conversation_id, before, limit)
            .await
    }

    async fn fetch_latest(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<InboundMessage>, TransportError> {
        self.inner.fetch_latest(conversation_id).await
    }
}

#[tokio::test]
async fn offline_posts_get_consecutive_ordinals_and_block_behind_the_head() {
    let client = ChatClient::new(test_config(), ClientIdentity {
        user_id: UserId(1),
        device_id: DeviceId(10),
        username: "alice".into(),
        device_name: "laptop".into(),
    });
    client.register_conversation(CONV, conversation_info()).await;

    for text in ["a", "b", "c"] {
        client.post_text(CONV, text, None).await.expect("post");
    }
    let pending = client.pending_sends(CONV).await.expect("pending");
    let ordinals: Vec<u64> = pending.iter().map(|record| record.ordinal).collect();
    assert_eq!(ordinals, vec![1, 2, 3]);

    let sent = client.deliver_pending_once().await.expect("deliver");
    assert_eq!(sent, 0);

    let pending = client.pending_sends(CONV).await.expect("pending");
    assert_eq!(
        pending[0].state.error_kind(),
        Some(OutboxErrorKind::Offline)
    );
    assert_eq!(pending[1].state, OutboxState::Sending { attempts: 0 });
    assert_eq!(pending[2].state, OutboxState::Sending { attempts: 0 });
}

#[tokio::test]
async fn post_to_unregistered_conversation_is_rejected() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, _bob) = pair(test_config(), transport).await;

    let err = alice
        .client
        .post_text(ConversationId(99), "hello", None)
        .await
        .expect_err("unknown conversation");
    assert!(matches!(err, ChatError::UnknownConversation(ConversationId(99))));
}

#[tokio::test]
async fn delivered_messages_chain_to_the_previous_header() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;
    let mut events = alice.client.subscribe_events();

    let first = alice.client.post_text(CONV, "first", None).await.expect("post");
    alice.client.post_text(CONV, "second", None).await.expect("post");
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 2);
    assert!(alice.client.pending_sends(CONV).await.expect("pending").is_empty());

    let received = bob.client.sync_conversation(CONV).await.expect("sync");
    assert_eq!(texts(&received), vec!["first", "second"]);
    let a = received[0].as_valid().expect("first valid");
    let b = received[1].as_valid().expect("second valid");
    assert!(a.client_header.prev.is_empty());
    assert_eq!(b.client_header.prev.len(), 1);
    assert_eq!(b.client_header.prev[0].id, MessageId(1));
    assert_eq!(b.client_header.prev[0].hash, a.header_hash);
    assert_eq!(a.outbox_id(), Some(first.outbox_id));
    assert_eq!(a.sender_username, "alice");

    assert!(matches!(
        events.try_recv().expect("enqueued"),
        ChatEvent::OutboxEnqueued(record) if record.outbox_id == first.outbox_id
    ));
    assert!(matches!(events.try_recv().expect("enqueued"), ChatEvent::OutboxEnqueued(_)));
    assert!(matches!(
        events.try_recv().expect("sent"),
        ChatEvent::OutboxSent { outbox_id, message_id: MessageId(1), .. }
            if outbox_id == first.outbox_id
    ));
}

#[tokio::test]
async fn rejected_head_blocks_the_queue_until_retried() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    let a = alice.client.post_text(CONV, "a", None).await.expect("post");
    alice.client.post_text(CONV, "b", None).await.expect("post");
    alice.client.post_text(CONV, "c", None).await.expect("post");

    transport
        .fail_next(TransportError::Rejected {
            reason: "server said no".into(),
        })
        .await;
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 0);
    assert_eq!(transport.delivered_count().await, 0);

    let pending = alice.client.pending_sends(CONV).await.expect("pending");
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0].outbox_id, a.outbox_id);
    assert_eq!(pending[0].state.error_kind(), Some(OutboxErrorKind::Misc));

    // A second pass does not skip past the failed head.
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 0);
    assert_eq!(transport.delivered_count().await, 0);

    alice
        .client
        .retry_pending_send(a.outbox_id)
        .await
        .expect("retry");
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 3);

    let received = bob.client.sync_conversation(CONV).await.expect("sync");
    assert_eq!(texts(&received), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn offline_send_retries_on_its_own_once_back_online() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, _bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;
    let mut events = alice.client.subscribe_events();

    transport.set_online(false).await;
    let record = alice.client.post_text(CONV, "hello", None).await.expect("post");
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 0);
    let pending = alice.client.pending_sends(CONV).await.expect("pending");
    assert_eq!(pending[0].state.error_kind(), Some(OutboxErrorKind::Offline));

    transport.set_online(true).await;
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 1);
    assert!(alice.client.pending_sends(CONV).await.expect("pending").is_empty());

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ChatEvent::OutboxFailed { outbox_id, kind, .. } => {
                assert_eq!(outbox_id, record.outbox_id);
                kinds.push(kind);
            }
            ChatEvent::OutboxSent { outbox_id, .. } => assert_eq!(outbox_id, record.outbox_id),
            _ => {}
        }
    }
    assert_eq!(kinds, vec![OutboxErrorKind::Offline]);
}

#[tokio::test]
async fn text_over_the_limit_fails_without_reaching_the_transport() {
    let transport = Arc::new(LoopbackTransport::new());
    let config = ClientConfig {
        max_text_length: 5,
        ..test_config()
    };
    let (alice, _bob) = pair(config, Arc::clone(&transport) as Arc<dyn Transport>).await;

    alice
        .client
        .post_text(CONV, "far too long", None)
        .await
        .expect("post");
    alice.client.deliver_pending_once().await.expect("deliver");

    let pending = alice.client.pending_sends(CONV).await.expect("pending");
    assert_eq!(pending[0].state.error_kind(), Some(OutboxErrorKind::TooLong));
    assert_eq!(transport.delivered_count().await, 0);

    let retried = alice
        .client
        .retry_pending_send(pending[0].outbox_id)
        .await
        .expect("too long is retryable");
    assert!(retried.state.is_sending());
}

#[tokio::test]
async fn rate_limited_send_stops_after_max_attempts() {
    let transport = Arc::new(LoopbackTransport::new());
    let config = ClientConfig {
        max_attempts: 1,
        ..test_config()
    };
    let (alice, _bob) = pair(config, Arc::clone(&transport) as Arc<dyn Transport>).await;

    alice.client.post_text(CONV, "hi", None).await.expect("post");
    transport
        .fail_next(TransportError::RateLimited {
            retry_after: Duration::ZERO,
        })
        .await;
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 0);
    let pending = alice.client.pending_sends(CONV).await.expect("pending");
    assert_eq!(pending[0].state, OutboxState::Sending { attempts: 1 });

    alice.client.deliver_pending_once().await.expect("deliver");
    let pending = alice.client.pending_sends(CONV).await.expect("pending");
    assert_eq!(
        pending[0].state.error_kind(),
        Some(OutboxErrorKind::TooManyAttempts)
    );
    assert_eq!(transport.delivered_count().await, 0);
}

#[tokio::test]
async fn inbound_echo_confirms_the_pending_record() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, _bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    let record = alice.client.post_text(CONV, "echo", None).await.expect("post");
    let thread = alice
        .client
        .get_thread(CONV, Pagination::newest(10))
        .await
        .expect("thread");
    assert!(matches!(&thread.messages[..], [MessageUnboxed::Outbox(r)] if r.outbox_id == record.outbox_id));

    let prepared = prepare_envelope(&record, None).expect("prepare");
    let sealed = alice
        .sealer
        .seal(CONV, &prepared.encoded, None)
        .await
        .expect("seal");
    let server_header = ServerHeader {
        message_id: MessageId(1),
        ctime: Utc::now(),
        superseded_by: None,
    };
    let received = alice
        .client
        .receive_message(&sealed, &server_header)
        .await
        .expect("receive");
    assert_eq!(received.outbox_id(), Some(record.outbox_id));

    assert!(alice.client.pending_sends(CONV).await.expect("pending").is_empty());
    let thread = alice
        .client
        .get_thread(CONV, Pagination::newest(10))
        .await
        .expect("thread");
    assert_eq!(thread.messages.len(), 1);
    assert!(matches!(thread.messages[0], MessageUnboxed::Valid(_)));

    let err = alice
        .client
        .cancel_pending_send(record.outbox_id)
        .await
        .expect_err("already confirmed");
    assert!(matches!(
        err,
        ChatError::Outbox(OutboxError::AlreadySent { message_id: MessageId(1), .. })
    ));
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 0);
    assert_eq!(transport.delivered_count().await, 0);
}

#[tokio::test]
async fn cancel_waits_for_an_in_flight_send() {
    let transport = Arc::new(GatedTransport {
        inner: LoopbackTransport::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let (alice, _bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;
    let record = alice.client.post_text(CONV, "racing", None).await.expect("post");

    let deliverer = {
        let client = Arc::clone(&alice.client);
        tokio::spawn(async move { client.deliver_pending_once().await })
    };
    transport.entered.notified().await;

    let cancel = {
        let client = Arc::clone(&alice.client);
        let outbox_id = record.outbox_id;
        tokio::spawn(async move { client.cancel_pending_send(outbox_id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cancel.is_finished());

    transport.release.notify_one();
    let sent = deliverer.await.expect("join").expect("deliver");
    assert_eq!(sent, 1);

    let err = cancel.await.expect("join").expect_err("send went through");
    assert!(matches!(err, ChatError::Outbox(OutboxError::AlreadySent { .. })));
    assert_eq!(transport.inner.delivered_count().await, 1);
}

#[tokio::test]
async fn cancel_skips_a_queued_send_while_an_earlier_one_is_in_flight() {
    let transport = Arc::new(GatedTransport {
        inner: LoopbackTransport::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let (alice, _bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;
    alice.client.post_text(CONV, "first", None).await.expect("post");
    let queued = alice.client.post_text(CONV, "second", None).await.expect("post");

    let deliverer = {
        let client = Arc::clone(&alice.client);
        tokio::spawn(async move { client.deliver_pending_once().await })
    };
    transport.entered.notified().await;

    let cancel = {
        let client = Arc::clone(&alice.client);
        let outbox_id = queued.outbox_id;
        tokio::spawn(async move { client.cancel_pending_send(outbox_id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.release.notify_one();

    let sent = deliverer.await.expect("join").expect("deliver");
    assert_eq!(sent, 1);
    let cancelled = cancel.await.expect("join").expect("queued send cancels");
    assert_eq!(cancelled.outbox_id, queued.outbox_id);

    let delivered = transport.inner.messages(CONV).await;
    assert_eq!(delivered.len(), 1);
    assert!(alice.client.pending_sends(CONV).await.expect("pending").is_empty());
    assert!(alice.client.conversation_locks.lock().await.is_empty());
}

#[tokio::test]
async fn drained_conversations_release_their_lock_entry() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, _bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    let kept = alice.client.post_text(CONV, "a", None).await.expect("post");
    alice.client.post_text(CONV, "b", None).await.expect("post");
    alice.client.cancel_pending_send(kept.outbox_id).await.expect("cancel");
    assert!(alice.client.conversation_locks.lock().await.is_empty());

    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 1);
    assert!(alice.client.conversation_locks.lock().await.is_empty());

    // A fresh entry still serializes the next pass.
    alice.client.post_text(CONV, "c", None).await.expect("post");
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 1);
    assert_eq!(transport.delivered_count().await, 2);
}

#[tokio::test]
async fn peer_messages_leave_no_confirmation_in_the_receiver_outbox() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    let record = alice.client.post_text(CONV, "hi", None).await.expect("post");
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 1);
    let received = bob.client.sync_conversation(CONV).await.expect("sync");
    assert_eq!(texts(&received), vec!["hi"]);
    assert_eq!(received[0].outbox_id(), Some(record.outbox_id));

    let confirmation = bob
        .client
        .outbox
        .confirmation(record.outbox_id)
        .await
        .expect("confirmation");
    assert_eq!(confirmation, None);
    let confirmation = alice
        .client
        .outbox
        .confirmation(record.outbox_id)
        .await
        .expect("confirmation");
    assert_eq!(confirmation, Some(MessageId(1)));
}

#[tokio::test]
async fn offline_backoff_grows_across_automatic_retries() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, _bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    transport.set_online(false).await;
    let record = alice.client.post_text(CONV, "later", None).await.expect("post");
    for expected in 1..=3u32 {
        assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 0);
        let failures = alice
            .client
            .inner
            .lock()
            .await
            .offline_failures
            .get(&record.outbox_id)
            .copied();
        assert_eq!(failures, Some(expected));
    }

    transport.set_online(true).await;
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 1);
    let state = alice.client.inner.lock().await;
    assert!(state.offline_failures.is_empty());
    assert!(state.retry_after.is_empty());
}

#[tokio::test]
async fn thread_before_the_smallest_id_is_empty() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, _bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;
    alice.client.post_text(CONV, "queued", None).await.expect("post");

    for before in [i64::MIN, 0, 1] {
        let view = alice
            .client
            .get_thread(
                CONV,
                Pagination {
                    num: 50,
                    before: Some(MessageId(before)),
                },
            )
            .await
            .expect("thread");
        assert!(view.messages.is_empty());
        assert!(view.next.is_none());
    }
}

#[tokio::test]
async fn cancel_removes_a_queued_send() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, _bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    let a = alice.client.post_text(CONV, "a", None).await.expect("post");
    alice.client.post_text(CONV, "b", None).await.expect("post");
    alice.client.cancel_pending_send(a.outbox_id).await.expect("cancel");

    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 1);
    let messages = transport.messages(CONV).await;
    assert_eq!(messages.len(), 1);

    let err = alice
        .client
        .cancel_pending_send(a.outbox_id)
        .await
        .expect_err("gone");
    assert!(matches!(err, ChatError::Outbox(OutboxError::NotFound(_))));
}

#[tokio::test]
async fn thread_pages_pad_missing_ids_with_placeholders() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    for text in ["one", "two", "three", "four", "five"] {
        alice.client.post_text(CONV, text, None).await.expect("post");
    }
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 5);

    // Bob only ever sees 3 and 5.
    let inbound = transport.messages(CONV).await;
    for inbound in [&inbound[2], &inbound[4]] {
        bob.client
            .receive_message(&inbound.sealed, &inbound.server_header)
            .await
            .expect("receive");
    }

    let page = bob
        .client
        .get_thread(CONV, Pagination::newest(3))
        .await
        .expect("thread");
    let ids: Vec<Option<MessageId>> = page.messages.iter().map(MessageUnboxed::message_id).collect();
    assert_eq!(ids, vec![Some(MessageId(3)), Some(MessageId(4)), Some(MessageId(5))]);
    assert!(matches!(
        page.messages[1],
        MessageUnboxed::Placeholder(MessageUnboxedPlaceholder { hidden: false, .. })
    ));
    assert_eq!(
        page.next,
        Some(Pagination {
            num: 3,
            before: Some(MessageId(3))
        })
    );

    let older = bob
        .client
        .get_thread(CONV, page.next.expect("next page"))
        .await
        .expect("older");
    let ids: Vec<Option<MessageId>> = older.messages.iter().map(MessageUnboxed::message_id).collect();
    assert_eq!(ids, vec![Some(MessageId(1)), Some(MessageId(2))]);
    assert!(older.next.is_none());
}

#[tokio::test]
async fn pending_sends_follow_the_message_they_were_composed_after() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    alice.client.post_text(CONV, "hi bob", None).await.expect("post");
    alice.client.deliver_pending_once().await.expect("deliver");
    bob.client.sync_conversation(CONV).await.expect("sync");

    transport.set_online(false).await;
    bob.client.post_text(CONV, "hi alice", None).await.expect("post");

    let thread = bob
        .client
        .get_thread(CONV, Pagination::newest(10))
        .await
        .expect("thread");
    assert_eq!(texts(&thread.messages), vec!["hi bob", "hi alice"]);
    assert!(matches!(thread.messages[1], MessageUnboxed::Outbox(_)));
}

#[tokio::test]
async fn edits_and_deletes_apply_to_own_messages_only() {
    let transport = Arc::new(LoopbackTransport::new());
    let (alice, bob) = pair(test_config(), Arc::clone(&transport) as Arc<dyn Transport>).await;

    alice.client.post_text(CONV, "tpyo", None).await.expect("post");
    alice.client.post_text(CONV, "doomed", None).await.expect("post");
    alice.client.deliver_pending_once().await.expect("deliver");
    bob.client.sync_conversation(CONV).await.expect("sync");

    let err = bob
        .client
        .edit_message(CONV, MessageId(1), "hijack")
        .await
        .expect_err("not bob's message");
    assert!(matches!(err, ChatError::Validation(_)));
    let err = alice
        .client
        .edit_message(CONV, MessageId(42), "nothing")
        .await
        .expect_err("unknown message");
    assert!(matches!(err, ChatError::MessageNotFound { .. }));
    let err = alice
        .client
        .delete_message(CONV, &[])
        .await
        .expect_err("empty delete");
    assert!(matches!(err, ChatError::Validation(_)));

    alice
        .client
        .edit_message(CONV, MessageId(1), "typo")
        .await
        .expect("edit");
    alice
        .client
        .delete_message(CONV, &[MessageId(2)])
        .await
        .expect("delete");
    assert_eq!(alice.client.deliver_pending_once().await.expect("deliver"), 2);

    let thread = alice
        .client
        .get_thread(CONV, Pagination::newest(10))
        .await
        .expect("thread");
    let edited = thread.messages[0].as_valid().expect("edited");
    assert_eq!(edited.body.user_text(), Some("typo"));
    assert_eq!(edited.server_header.superseded_by, Some(MessageId(3)));
    assert!(matches!(
        thread.messages[1],
        MessageUnboxed::Placeholder(MessageUnboxedPlaceholder { hidden: true, .. })
    ));

    let err = alice
        .client
        .edit_message(CONV, MessageId(2), "too late")
        .await
        .expect_err("deleted");
    assert!(matches!(err, ChatError::Validation(_)));

    // Bob applies the same modifiers when they arrive.
    bob.client.sync_conversation(CONV).await.expect("sync");
    let thread = bob
        .client
        .get_thread(CONV, Pagination::newest(10))
        .await
        .expect("thread");
    assert_eq!(thread.messages[0].as_valid().expect("edited").body.user_text(), Some("typo"));
    assert!(!thread.messages[1].is_visible());
}

#[tokio::test]
async fn sqlite_backed_client_delivers_and_caches() {
    let transport = Arc::new(LoopbackTransport::new());
    let sealer = Arc::new(GroupKeySealer::new(DeviceIdentity::generate(
        UserId(1),
        DeviceId(10),
        "alice",
        "laptop",
    )));
    sealer.rotate_conversation_key(CONV).await;
    let storage = Arc::new(Storage::new("sqlite::memory:").await.expect("storage"));

    let client = ChatClient::new_with_dependencies(
        test_config(),
        identity_of(&sealer),
        Arc::clone(&storage) as Arc<dyn OutboxStore>,
        Arc::clone(&storage) as Arc<dyn MessageCache>,
        sealer,
        transport,
        Arc::new(MissingMentionResolver),
    );
    client.register_conversation(CONV, conversation_info()).await;

    client.post_text(CONV, "persisted", None).await.expect("post");
    assert_eq!(client.deliver_pending_once().await.expect("deliver"), 1);

    let cached = storage
        .load_cached_message(CONV, MessageId(1))
        .await
        .expect("load")
        .expect("cached");
    assert_eq!(texts(&[cached]), vec!["persisted"]);
    let head = storage
        .load_chain_head(CONV)
        .await
        .expect("head")
        .expect("some head");
    assert_eq!(head.message_id, MessageId(1));
}
