use super::*;
use shared::{
    body::MessageBody,
    domain::{ConversationTriple, DeviceId, TlfId, TopicId, TopicType, UserId},
    message::{MessagePlaintext, MessageUnboxedPlaceholder, OutboxErrorKind},
};

fn plaintext(text: &str) -> MessagePlaintext {
    MessagePlaintext {
        conv: ConversationTriple {
            tlf_id: TlfId(3),
            topic_type: TopicType::Chat,
            topic_id: TopicId(30),
        },
        tlf_name: "alice,bob".into(),
        sender: UserId(1),
        sender_device: DeviceId(1),
        body: MessageBody::text(text),
        ephemeral_metadata: None,
    }
}

fn entry(conversation_id: ConversationId, text: &str) -> NewOutboxEntry {
    NewOutboxEntry {
        outbox_id: OutboxId::generate(),
        conversation_id,
        msg: plaintext(text),
        client_prev: MessageId(4),
        reply_to: None,
        preview: Some(text.to_string()),
        ctime: Utc::now(),
    }
}

async fn append(storage: &Storage, entry: NewOutboxEntry) -> OutboxRecord {
    match storage.append_record(entry).await.expect("append") {
        AppendOutcome::Appended(record) => record,
        AppendOutcome::DuplicateId => panic!("unexpected duplicate"),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[test]
fn sqlite_path_skips_memory_and_non_sqlite_urls() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(sqlite_path("postgres://db"), None);
    assert_eq!(
        sqlite_path("sqlite://data/chat.db?mode=rwc"),
        Some(PathBuf::from("data/chat.db"))
    );
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db_path = temp.path().join("nested").join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn append_assigns_ordinals_per_conversation() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = append(&storage, entry(ConversationId(1), "a")).await;
    let second = append(&storage, entry(ConversationId(1), "b")).await;
    let other = append(&storage, entry(ConversationId(2), "x")).await;

    assert_eq!((first.ordinal, second.ordinal, other.ordinal), (1, 2, 1));

    let listed = storage.list_records(ConversationId(1)).await.expect("list");
    assert_eq!(listed, vec![first.clone(), second]);
    assert_eq!(
        storage.load_record(first.outbox_id).await.expect("load"),
        Some(first)
    );
    assert_eq!(
        storage.list_conversations().await.expect("conversations"),
        vec![ConversationId(1), ConversationId(2)]
    );
}

#[tokio::test]
async fn append_rejects_reused_outbox_id() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = entry(ConversationId(1), "a");
    let mut again = entry(ConversationId(1), "b");
    again.outbox_id = first.outbox_id;

    append(&storage, first).await;
    assert_eq!(
        storage.append_record(again).await.expect("append"),
        AppendOutcome::DuplicateId
    );
}

#[tokio::test]
async fn swap_state_compares_before_writing() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = append(&storage, entry(ConversationId(1), "a")).await;
    let failed = OutboxState::Error {
        kind: OutboxErrorKind::Misc,
        message: "server said no".into(),
    };

    assert_eq!(
        storage
            .swap_state(record.outbox_id, &OutboxState::fresh(), &failed)
            .await
            .expect("swap"),
        CasOutcome::Applied
    );
    assert_eq!(
        storage
            .swap_state(record.outbox_id, &OutboxState::fresh(), &OutboxState::fresh())
            .await
            .expect("stale swap"),
        CasOutcome::Conflict(failed.clone())
    );
    assert_eq!(
        storage
            .remove_record(record.outbox_id, &failed)
            .await
            .expect("remove"),
        CasOutcome::Applied
    );
    assert_eq!(
        storage
            .swap_state(record.outbox_id, &failed, &OutboxState::fresh())
            .await
            .expect("swap missing"),
        CasOutcome::Missing
    );
}

#[tokio::test]
async fn confirm_removes_record_and_keeps_confirmation() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = append(&storage, entry(ConversationId(1), "a")).await;

    let removed = storage
        .confirm_record(record.outbox_id, MessageId(9))
        .await
        .expect("confirm");
    assert_eq!(removed, Some(record.clone()));
    assert!(storage
        .load_record(record.outbox_id)
        .await
        .expect("load")
        .is_none());
    assert_eq!(
        storage
            .load_confirmation(record.outbox_id)
            .await
            .expect("confirmation"),
        Some(MessageId(9))
    );

    let mut reuse = entry(ConversationId(1), "b");
    reuse.outbox_id = record.outbox_id;
    assert_eq!(
        storage.append_record(reuse).await.expect("append"),
        AppendOutcome::DuplicateId
    );
}

#[tokio::test]
async fn message_cache_lists_pages_in_ascending_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conv = ConversationId(5);
    for id in 1..=6 {
        let message = MessageUnboxed::Placeholder(MessageUnboxedPlaceholder {
            message_id: MessageId(id),
            hidden: id % 2 == 0,
        });
        storage
            .put_cached_message(conv, &message)
            .await
            .expect("cache");
    }

    let page = storage
        .list_cached_messages(conv, Some(MessageId(5)), 3)
        .await
        .expect("page");
    let ids: Vec<i64> = page.iter().filter_map(|m| m.message_id()).map(|id| id.0).collect();
    assert_eq!(ids, vec![2, 3, 4]);

    assert_eq!(
        storage.latest_cached_message_id(conv).await.expect("latest"),
        Some(MessageId(6))
    );
    assert_eq!(
        storage
            .latest_cached_message_id(ConversationId(99))
            .await
            .expect("latest empty"),
        None
    );
    assert!(matches!(
        storage
            .load_cached_message(conv, MessageId(2))
            .await
            .expect("load"),
        Some(MessageUnboxed::Placeholder(MessageUnboxedPlaceholder { hidden: true, .. }))
    ));
}

#[tokio::test]
async fn outbox_entries_are_not_cached() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = append(&storage, entry(ConversationId(1), "a")).await;
    storage
        .put_cached_message(ConversationId(1), &MessageUnboxed::Outbox(record))
        .await
        .expect_err("outbox entries have no slot");
}

#[tokio::test]
async fn chain_head_only_moves_forward() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conv = ConversationId(8);
    let newer = ChainHead {
        message_id: MessageId(10),
        header_hash: EnvelopeHash::of(b"ten"),
    };
    let older = ChainHead {
        message_id: MessageId(7),
        header_hash: EnvelopeHash::of(b"seven"),
    };

    assert_eq!(storage.load_chain_head(conv).await.expect("empty"), None);
    storage.save_chain_head(conv, &newer).await.expect("save");
    storage.save_chain_head(conv, &older).await.expect("save older");
    assert_eq!(
        storage.load_chain_head(conv).await.expect("load"),
        Some(newer)
    );
}
