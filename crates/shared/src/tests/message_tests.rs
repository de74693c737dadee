use super::*;
use crate::domain::{TlfId, TopicId, TopicType};

fn plaintext(body: MessageBody) -> MessagePlaintext {
    MessagePlaintext {
        conv: ConversationTriple {
            tlf_id: TlfId(1),
            topic_type: TopicType::Chat,
            topic_id: TopicId(1),
        },
        tlf_name: "alice".into(),
        sender: UserId(1),
        sender_device: DeviceId(1),
        body,
        ephemeral_metadata: None,
    }
}

#[test]
fn only_duplicate_and_already_deleted_are_terminal() {
    let terminal = [OutboxErrorKind::Duplicate, OutboxErrorKind::AlreadyDeleted];
    for kind in [
        OutboxErrorKind::Misc,
        OutboxErrorKind::Offline,
        OutboxErrorKind::Identify,
        OutboxErrorKind::TooLong,
        OutboxErrorKind::Duplicate,
        OutboxErrorKind::Expired,
        OutboxErrorKind::TooManyAttempts,
        OutboxErrorKind::AlreadyDeleted,
        OutboxErrorKind::UploadFailed,
        OutboxErrorKind::RestrictedBot,
    ] {
        assert_eq!(kind.is_retryable(), !terminal.contains(&kind), "{kind:?}");
    }
    assert_eq!(OutboxErrorKind::RestrictedBot.id(), 9);
}

#[test]
fn outbox_state_serializes_with_state_tag() {
    let state = OutboxState::Error {
        kind: OutboxErrorKind::Offline,
        message: "no route".into(),
    };
    let json = serde_json::to_value(&state).expect("serialize");
    assert_eq!(json["state"], "error");
    assert_eq!(json["kind"], "offline");
    let back: OutboxState = serde_json::from_value(json).expect("deserialize");
    assert_eq!(back, state);
}

#[test]
fn outbox_entries_have_no_message_id_but_keep_outbox_id() {
    let record = OutboxRecord {
        outbox_id: OutboxId::generate(),
        conversation_id: ConversationId(3),
        ordinal: 1,
        state: OutboxState::fresh(),
        ctime: Utc::now(),
        msg: plaintext(MessageBody::text("hi")),
        client_prev: MessageId::NONE,
        reply_to: None,
        preview: None,
    };
    let entry = MessageUnboxed::Outbox(record.clone());

    assert_eq!(entry.state(), MessageUnboxedState::Outbox);
    assert_eq!(entry.message_id(), None);
    assert_eq!(entry.outbox_id(), Some(record.outbox_id));
    assert!(entry.is_visible());
}

#[test]
fn non_critical_version_errors_are_hidden_but_positioned() {
    let error = MessageUnboxed::Error(MessageUnboxedError {
        kind: MessageUnboxedErrorKind::BadVersion,
        message: "unsupported body version 4".into(),
        internal_message: String::new(),
        version_kind: Some(EnvelopeKind::Body),
        version_number: Some(4),
        is_critical: false,
        sender_username: None,
        sender_device_name: None,
        message_id: MessageId(12),
        message_type: None,
        ctime: Utc::now(),
        is_ephemeral: false,
        is_ephemeral_expired: false,
        etime: None,
    });

    assert_eq!(error.message_id(), Some(MessageId(12)));
    assert!(!error.is_visible());
}

#[test]
fn reaction_map_drops_empty_emoji_buckets() {
    let mut reactions = ReactionMap::default();
    reactions.insert(":+1:", "alice", MessageId(8));
    reactions.insert(":+1:", "bob", MessageId(9));
    assert!(reactions.remove_by_id(MessageId(8)));
    assert!(!reactions.is_empty());
    assert!(reactions.remove_by_id(MessageId(9)));
    assert!(reactions.is_empty());
    assert!(!reactions.remove_by_id(MessageId(9)));
}
