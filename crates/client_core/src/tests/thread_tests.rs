use chrono::Utc;
use shared::{
    body::{
        MessageDelete, MessageEdit, MessageReaction, MessageType, MessageUnfurl, UnfurlSummary,
    },
    domain::{
        ConversationId, ConversationTriple, DeviceId, EnvelopeHash, TlfId, TopicId, TopicType,
        UserId,
    },
    message::{MessagePlaintext, OutboxState, ReactionMap, ServerHeader},
    protocol::{HeaderPlaintextV1, OutboxInfo},
};

use super::*;

const CONV: ConversationId = ConversationId(1);

fn triple() -> ConversationTriple {
    ConversationTriple {
        tlf_id: TlfId(1),
        topic_type: TopicType::Chat,
        topic_id: TopicId(1),
    }
}

fn valid_from(
    id: i64,
    sender: UserId,
    body: MessageBody,
    outbox: Option<&OutboxRecord>,
) -> MessageUnboxed {
    MessageUnboxed::Valid(MessageUnboxedValid {
        conversation_id: CONV,
        server_header: ServerHeader {
            message_id: MessageId(id),
            ctime: Utc::now(),
            superseded_by: None,
        },
        client_header: HeaderPlaintextV1 {
            conv: triple(),
            tlf_name: "alice,bob".into(),
            message_type: body.message_type(),
            prev: Vec::new(),
            sender,
            sender_device: DeviceId(sender.0 * 10),
            body_hash: EnvelopeHash::of(b"body"),
            outbox_info: outbox.map(|record| OutboxInfo {
                outbox_id: record.outbox_id,
                ordinal: record.ordinal,
                client_prev: record.client_prev,
                compose_time: record.ctime,
            }),
            header_signature: None,
            ephemeral_metadata: None,
        },
        body,
        header_hash: EnvelopeHash::of(id.to_string().as_bytes()),
        sender_username: if sender == UserId(1) { "alice" } else { "bob" }.into(),
        sender_device_name: "device".into(),
        at_mention_usernames: Vec::new(),
        at_mentions: Vec::new(),
        channel_mention: Default::default(),
        team_mentions: Vec::new(),
        reactions: ReactionMap::default(),
        unfurls: Default::default(),
        reply_to: None,
    })
}

fn valid(id: i64, text: &str) -> MessageUnboxed {
    valid_from(id, UserId(1), MessageBody::text(text), None)
}

fn pending(ordinal: u64, client_prev: i64) -> OutboxRecord {
    OutboxRecord {
        outbox_id: OutboxId::generate(),
        conversation_id: CONV,
        ordinal,
        state: OutboxState::fresh(),
        ctime: Utc::now(),
        msg: MessagePlaintext {
            conv: triple(),
            tlf_name: "alice,bob".into(),
            sender: UserId(1),
            sender_device: DeviceId(10),
            body: MessageBody::text(format!("pending {ordinal}")),
            ephemeral_metadata: None,
        },
        client_prev: MessageId(client_prev),
        reply_to: None,
        preview: None,
    }
}

fn shape(messages: &[MessageUnboxed]) -> Vec<String> {
    messages
        .iter()
        .map(|message| match message {
            MessageUnboxed::Outbox(record) => format!("o{}", record.ordinal),
            MessageUnboxed::Placeholder(p) if p.hidden => format!("h{}", p.message_id),
            MessageUnboxed::Placeholder(p) => format!("p{}", p.message_id),
            other => other
                .message_id()
                .map(|id| id.to_string())
                .unwrap_or_default(),
        })
        .collect()
}

#[test]
fn confirmation_supersedes_pending_record_in_place() {
    let record = pending(1, 5);
    let before = assemble(&[valid(5, "five")], std::slice::from_ref(&record));
    assert_eq!(shape(&before), vec!["5", "o1"]);

    let confirmed = valid_from(6, UserId(1), MessageBody::text("pending 1"), Some(&record));
    let mut input = before.clone();
    input.push(confirmed);
    let after = assemble(&input, &[record.clone()]);
    assert_eq!(shape(&after), vec!["5", "6"]);
    assert!(after.iter().all(|message| message.as_outbox().is_none()));
}

#[test]
fn pending_records_anchor_on_client_prev_in_ordinal_order() {
    let confirmed = vec![valid(1, "a"), valid(2, "b"), valid(3, "c")];
    let second = pending(2, 2);
    let first = pending(1, 1);
    let tail = pending(3, 3);

    let thread = assemble(&confirmed, &[tail, second, first]);
    assert_eq!(shape(&thread), vec!["1", "o1", "2", "o2", "3", "o3"]);
}

#[test]
fn assemble_is_idempotent() {
    let confirmed = vec![valid(4, "x"), valid(2, "y"), valid(4, "x")];
    let records = vec![pending(1, 2), pending(2, 2)];

    let once = assemble(&confirmed, &records);
    let twice = assemble(&once, &[]);
    let again = assemble(&once, &records);
    assert_eq!(once, twice);
    assert_eq!(once, again);
    assert_eq!(shape(&once), vec!["2", "o1", "o2", "4"]);
}

#[test]
fn supersedes_fold_into_targets_without_moving_slots() {
    let mut thread = vec![
        valid(1, "hello"),
        valid_from(
            2,
            UserId(2),
            MessageBody::Reaction(MessageReaction {
                message_id: MessageId(1),
                body: ":+1:".into(),
            }),
            None,
        ),
        valid_from(
            3,
            UserId(1),
            MessageBody::Edit(MessageEdit {
                message_id: MessageId(1),
                body: "hello there".into(),
                user_mentions: Vec::new(),
                team_mentions: Vec::new(),
            }),
            None,
        ),
        valid_from(
            4,
            UserId(2),
            MessageBody::Unfurl(MessageUnfurl {
                message_id: MessageId(1),
                unfurl: UnfurlSummary {
                    url: "https://example.com".into(),
                    title: "Example".into(),
                    description: None,
                    site_name: None,
                },
            }),
            None,
        ),
        valid(5, "bye"),
        valid_from(
            6,
            UserId(1),
            MessageBody::Delete(MessageDelete {
                message_ids: vec![MessageId(5)],
            }),
            None,
        ),
    ];

    apply_supersedes(&mut thread);
    let once = thread.clone();
    apply_supersedes(&mut thread);
    assert_eq!(thread, once);

    assert_eq!(shape(&thread), vec!["1", "2", "3", "4", "h5", "6"]);
    let target = thread[0].as_valid().expect("valid");
    assert_eq!(target.body.user_text(), Some("hello there"));
    assert_eq!(target.server_header.superseded_by, Some(MessageId(3)));
    assert_eq!(target.reactions.reactions[":+1:"]["bob"], MessageId(2));
    assert_eq!(target.unfurls[&MessageId(4)].title, "Example");
    let visible: Vec<Option<MessageType>> = thread
        .iter()
        .filter(|m| m.is_visible())
        .map(MessageUnboxed::message_type)
        .collect();
    assert_eq!(visible, vec![Some(MessageType::Text)]);
}

#[test]
fn edits_from_other_senders_are_ignored_and_reaction_deletes_unreact() {
    let mut thread = vec![
        valid(1, "mine"),
        valid_from(
            2,
            UserId(2),
            MessageBody::Edit(MessageEdit {
                message_id: MessageId(1),
                body: "hijacked".into(),
                user_mentions: Vec::new(),
                team_mentions: Vec::new(),
            }),
            None,
        ),
        valid_from(
            3,
            UserId(2),
            MessageBody::Reaction(MessageReaction {
                message_id: MessageId(1),
                body: ":tada:".into(),
            }),
            None,
        ),
        valid_from(
            4,
            UserId(2),
            MessageBody::Delete(MessageDelete {
                message_ids: vec![MessageId(3)],
            }),
            None,
        ),
    ];

    apply_supersedes(&mut thread);
    let target = thread[0].as_valid().expect("valid");
    assert_eq!(target.body.user_text(), Some("mine"));
    assert!(target.reactions.is_empty());
    assert_eq!(shape(&thread), vec!["1", "2", "h3", "4"]);
}

#[test]
fn gaps_become_visible_placeholders() {
    let filled = fill_gaps(
        vec![valid(2, "b"), valid(5, "e"), valid(9, "out of range")],
        MessageId(1),
        MessageId(6),
    );
    assert_eq!(shape(&filled), vec!["p1", "2", "p3", "p4", "5", "p6"]);
}
