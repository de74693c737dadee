use chrono::Duration as ChronoDuration;
use sealing::{DeviceIdentity, GroupKeySealer};
use shared::{
    body::MessageBody,
    domain::{ConversationTriple, DeviceId, MessageId, TlfId, TopicId, TopicType, UserId},
    protocol::{
        encode_body, encode_header, BodyPlaintextV1, EncodedEnvelope, EphemeralMetadata,
        HeaderPlaintextV1, UnsupportedMeta,
    },
};

use super::*;
use crate::mentions::DirectoryMentionResolver;

const CONV: ConversationId = ConversationId(9);

struct Fixture {
    alice: GroupKeySealer,
    unboxer: Unboxer,
}

async fn fixture() -> Fixture {
    let alice = GroupKeySealer::new(DeviceIdentity::generate(
        UserId(1),
        DeviceId(10),
        "alice",
        "laptop",
    ));
    let bob = GroupKeySealer::new(DeviceIdentity::generate(
        UserId(2),
        DeviceId(20),
        "bob",
        "phone",
    ));
    bob.register_device(alice.identity().public_record()).await;
    let (generation, root) = alice.rotate_conversation_key(CONV).await;
    bob.install_conversation_key(CONV, generation, *root).await;

    let mentions = DirectoryMentionResolver::new().with_user("bob", UserId(2));
    Fixture {
        alice,
        unboxer: Unboxer::new(Arc::new(bob), Arc::new(mentions)),
    }
}

fn header_for(body_bytes: &[u8], message_type: MessageType) -> HeaderPlaintextV1 {
    HeaderPlaintextV1 {
        conv: ConversationTriple {
            tlf_id: TlfId(1),
            topic_type: TopicType::Chat,
            topic_id: TopicId(1),
        },
        tlf_name: "alice,bob".into(),
        message_type,
        prev: Vec::new(),
        sender: UserId(1),
        sender_device: DeviceId(10),
        body_hash: EnvelopeHash::of(body_bytes),
        outbox_info: None,
        header_signature: None,
        ephemeral_metadata: None,
    }
}

fn text_envelope(text: &str) -> (EncodedEnvelope, HeaderPlaintextV1) {
    let body = encode_body(&BodyPlaintext::V1(BodyPlaintextV1 {
        message_body: MessageBody::text(text),
    }))
    .expect("body");
    let header = header_for(&body, MessageType::Text);
    let encoded = EncodedEnvelope {
        header: encode_header(&HeaderPlaintext::V1(header.clone())).expect("header"),
        body,
    };
    (encoded, header)
}

fn server_header(id: i64) -> ServerHeader {
    ServerHeader {
        message_id: MessageId(id),
        ctime: Utc::now(),
        superseded_by: None,
    }
}

#[tokio::test]
async fn valid_envelope_resolves_sender_and_mentions() {
    let fx = fixture().await;
    let (encoded, header) = text_envelope("hi @bob");
    let sealed = fx.alice.seal(CONV, &encoded, None).await.expect("seal");

    let unboxed = fx.unboxer.unbox(&sealed, &server_header(3)).await;
    let valid = unboxed.as_valid().expect("valid");
    assert_eq!(valid.client_header, header);
    assert_eq!(valid.body.user_text(), Some("hi @bob"));
    assert_eq!(valid.sender_username, "alice");
    assert_eq!(valid.sender_device_name, "laptop");
    assert_eq!(valid.at_mentions, vec![UserId(2)]);
    assert_eq!(valid.header_hash, encoded.header_hash());
    assert_eq!(unboxed.message_id(), Some(MessageId(3)));
}

#[tokio::test]
async fn body_hash_mismatch_is_misc_error_in_place() {
    let fx = fixture().await;
    let (mut encoded, _) = text_envelope("original");
    encoded.body = encode_body(&BodyPlaintext::V1(BodyPlaintextV1 {
        message_body: MessageBody::text("swapped"),
    }))
    .expect("body");
    let sealed = fx.alice.seal(CONV, &encoded, None).await.expect("seal");

    let unboxed = fx.unboxer.unbox(&sealed, &server_header(5)).await;
    let error = unboxed.as_error().expect("error");
    assert_eq!(error.kind, MessageUnboxedErrorKind::Misc);
    assert!(error.internal_message.contains("body hash mismatch"));
    assert_eq!(error.message_id, MessageId(5));
    assert_eq!(error.message_type, Some(MessageType::Text));
    assert_eq!(error.sender_username.as_deref(), Some("alice"));
    assert_eq!(unboxed.message_id(), Some(MessageId(5)));
    assert!(unboxed.is_visible());
}

#[tokio::test]
async fn non_critical_unknown_version_is_hidden() {
    let fx = fixture().await;
    let encoded = EncodedEnvelope {
        header: encode_header(&HeaderPlaintext::Unsupported {
            version: 2,
            meta: UnsupportedMeta { critical: false },
        })
        .expect("header"),
        body: b"\x00\x07\x00{}".to_vec(),
    };
    let sealed = fx.alice.seal(CONV, &encoded, None).await.expect("seal");

    let unboxed = fx.unboxer.unbox(&sealed, &server_header(6)).await;
    let error = unboxed.as_error().expect("error");
    assert_eq!(error.kind, MessageUnboxedErrorKind::BadVersion);
    assert_eq!(error.version_kind, Some(EnvelopeKind::Header));
    assert_eq!(error.version_number, Some(2));
    assert!(!error.is_critical);
    assert!(!unboxed.is_visible());
}

#[tokio::test]
async fn critical_unknown_body_version_is_visible_error() {
    let fx = fixture().await;
    let (mut encoded, _) = text_envelope("unused");
    encoded.body = b"\x00\x05\x01{\"future\":1}".to_vec();
    let header = header_for(&encoded.body, MessageType::Text);
    encoded.header = encode_header(&HeaderPlaintext::V1(header)).expect("header");
    let sealed = fx.alice.seal(CONV, &encoded, None).await.expect("seal");

    let unboxed = fx.unboxer.unbox(&sealed, &server_header(7)).await;
    let error = unboxed.as_error().expect("error");
    assert_eq!(error.kind, MessageUnboxedErrorKind::BadVersionCritical);
    assert_eq!(error.version_kind, Some(EnvelopeKind::Body));
    assert_eq!(error.version_number, Some(5));
    assert!(error.is_critical);
    assert_eq!(error.message_type, Some(MessageType::Text));
    assert!(unboxed.is_visible());
}

#[tokio::test]
async fn missing_keys_classify_without_failing() {
    let fx = fixture().await;
    let (encoded, _) = text_envelope("later");
    let mut sealed = fx.alice.seal(CONV, &encoded, None).await.expect("seal");
    sealed.conversation_id = ConversationId(404);

    let unboxed = fx.unboxer.unbox(&sealed, &server_header(8)).await;
    let error = unboxed.as_error().expect("error");
    // The signature covers the conversation id, so retargeting breaks it first.
    assert_eq!(error.kind, MessageUnboxedErrorKind::Misc);

    fx.alice
        .install_ephemeral_key(CONV, 4, [3u8; 32], Utc::now() + ChronoDuration::hours(1))
        .await;
    let meta = EphemeralMetadata {
        lifetime_secs: 30,
        generation: 4,
    };
    let sealed = fx.alice.seal(CONV, &encoded, Some(meta)).await.expect("seal");
    let unboxed = fx.unboxer.unbox(&sealed, &server_header(9)).await;
    let error = unboxed.as_error().expect("error");
    assert_eq!(error.kind, MessageUnboxedErrorKind::Ephemeral);
    assert!(error.is_ephemeral);
    assert!(error.etime.is_some());
}

#[tokio::test]
async fn unbox_many_keeps_input_order() {
    let fx = fixture().await;
    let mut inbound = Vec::new();
    for id in 1..=5 {
        let (encoded, _) = text_envelope(&format!("message {id}"));
        inbound.push(InboundMessage {
            server_header: server_header(id),
            sealed: fx.alice.seal(CONV, &encoded, None).await.expect("seal"),
        });
    }

    let unboxed = fx.unboxer.unbox_many(&inbound, 2).await;
    let ids: Vec<i64> = unboxed
        .iter()
        .filter_map(|m| m.message_id())
        .map(|id| id.0)
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(unboxed.iter().all(|m| m.as_valid().is_some()));
}
