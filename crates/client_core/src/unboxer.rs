use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use sealing::{OpenedEnvelope, SealError, SealedEnvelope, SealingService, SenderVerification};
use shared::{
    body::{MessageBody, MessageType},
    domain::{ConversationId, EnvelopeHash},
    message::{
        MessageUnboxed, MessageUnboxedError, MessageUnboxedErrorKind, MessageUnboxedValid,
        ReactionMap, ServerHeader,
    },
    protocol::{
        decode_body, decode_header, BodyPlaintext, CodecError, EnvelopeKind, HeaderPlaintext,
    },
};
use tracing::{debug, warn};

use crate::{
    mentions::{MentionResolver, ResolvedMentions},
    transport::InboundMessage,
};

/// Turns sealed envelopes into one of the terminal message states. Never fails:
/// every problem becomes a `MessageUnboxed::Error` that keeps its slot.
pub struct Unboxer {
    sealing: Arc<dyn SealingService>,
    mentions: Arc<dyn MentionResolver>,
}

/// Partial error record; the caller fills in slot metadata.
struct Failure {
    kind: MessageUnboxedErrorKind,
    message: String,
    internal_message: String,
    version: Option<(EnvelopeKind, u16, bool)>,
    message_type: Option<MessageType>,
}

impl Failure {
    fn new(
        kind: MessageUnboxedErrorKind,
        message: impl Into<String>,
        internal: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            internal_message: internal.into(),
            version: None,
            message_type: None,
        }
    }

    fn codec(err: CodecError, message_type: Option<MessageType>) -> Self {
        let mut failure = match &err {
            CodecError::UnsupportedCriticalVersion { kind, version } => {
                let mut failure = Failure::new(
                    MessageUnboxedErrorKind::BadVersionCritical,
                    "this message needs a newer client to display",
                    err.to_string(),
                );
                failure.version = Some((*kind, *version, true));
                failure
            }
            _ => Failure::new(
                MessageUnboxedErrorKind::Misc,
                "this message could not be decoded",
                err.to_string(),
            ),
        };
        failure.message_type = message_type;
        failure
    }

    fn seal(err: &SealError) -> Self {
        let kind = match err {
            SealError::Identify { .. } => MessageUnboxedErrorKind::Identify,
            SealError::PairwiseMissing { .. } => MessageUnboxedErrorKind::PairwiseMissing,
            SealError::EphemeralExpired { .. } | SealError::EphemeralKeyMissing { .. } => {
                MessageUnboxedErrorKind::Ephemeral
            }
            SealError::BadSignature { .. } | SealError::Decrypt { .. } | SealError::Misc(_) => {
                MessageUnboxedErrorKind::Misc
            }
        };
        let message = match kind {
            MessageUnboxedErrorKind::Identify => "unable to verify the sender",
            MessageUnboxedErrorKind::PairwiseMissing => "the key for this message is missing",
            MessageUnboxedErrorKind::Ephemeral => "this exploding message is not available",
            _ => "unable to decrypt this message",
        };
        Failure::new(kind, message, err.to_string())
    }

    fn unsupported(kind: EnvelopeKind, version: u16, message_type: Option<MessageType>) -> Self {
        let mut failure = Failure::new(
            MessageUnboxedErrorKind::BadVersion,
            "this message is not supported by this client",
            format!("unsupported {kind} version {version}"),
        );
        failure.version = Some((kind, version, false));
        failure.message_type = message_type;
        failure
    }
}

impl Unboxer {
    pub fn new(sealing: Arc<dyn SealingService>, mentions: Arc<dyn MentionResolver>) -> Self {
        Self { sealing, mentions }
    }

    pub async fn unbox(
        &self,
        sealed: &SealedEnvelope,
        server_header: &ServerHeader,
    ) -> MessageUnboxed {
        match self.sealing.verify_and_open(sealed).await {
            Ok(opened) => self.unbox_opened(sealed, &opened, server_header).await,
            Err(err) => {
                let failure = Failure::seal(&err);
                let expired = matches!(err, SealError::EphemeralExpired { .. });
                let mut error = error_record(sealed, server_header, None, failure);
                error.is_ephemeral_expired |= expired;
                warn!(
                    conversation_id = sealed.conversation_id.0,
                    message_id = server_header.message_id.0,
                    kind = ?error.kind,
                    "unbox: failed to open envelope: {err}"
                );
                MessageUnboxed::Error(error)
            }
        }
    }

    /// Classifies an envelope the sealing service already verified and decrypted.
    pub async fn unbox_opened(
        &self,
        sealed: &SealedEnvelope,
        opened: &OpenedEnvelope,
        server_header: &ServerHeader,
    ) -> MessageUnboxed {
        let verification = Some(&opened.verification);
        match self.classify(sealed.conversation_id, opened, server_header).await {
            Ok(valid) => {
                debug!(
                    conversation_id = sealed.conversation_id.0,
                    message_id = server_header.message_id.0,
                    message_type = %valid.body.message_type(),
                    "unbox: valid"
                );
                MessageUnboxed::Valid(valid)
            }
            Err(failure) => {
                let error = error_record(sealed, server_header, verification, failure);
                if error.kind == MessageUnboxedErrorKind::BadVersion {
                    debug!(
                        conversation_id = sealed.conversation_id.0,
                        message_id = server_header.message_id.0,
                        "unbox: skipping non-critical unsupported version"
                    );
                } else {
                    warn!(
                        conversation_id = sealed.conversation_id.0,
                        message_id = server_header.message_id.0,
                        kind = ?error.kind,
                        "unbox: {}",
                        error.internal_message
                    );
                }
                MessageUnboxed::Error(error)
            }
        }
    }

    /// Mentions in `body`; a resolver failure degrades to no mentions.
    pub async fn resolve_mentions(&self, body: &MessageBody) -> ResolvedMentions {
        match self.mentions.resolve_mentions(body).await {
            Ok(mentions) => mentions,
            Err(err) => {
                warn!("unbox: mention resolution failed: {err:#}");
                ResolvedMentions::default()
            }
        }
    }

    /// Unboxes a page of history, running at most `concurrency` opens at once.
    /// Output order matches input order.
    pub async fn unbox_many(
        &self,
        messages: &[InboundMessage],
        concurrency: usize,
    ) -> Vec<MessageUnboxed> {
        stream::iter(messages)
            .map(|inbound| self.unbox(&inbound.sealed, &inbound.server_header))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    async fn classify(
        &self,
        conversation_id: ConversationId,
        opened: &OpenedEnvelope,
        server_header: &ServerHeader,
    ) -> Result<MessageUnboxedValid, Failure> {
        let encoded = &opened.encoded;
        let header = match decode_header(&encoded.header) {
            Ok(HeaderPlaintext::V1(header)) => header,
            Ok(HeaderPlaintext::Unsupported { version, .. }) => {
                return Err(Failure::unsupported(
                    EnvelopeKind::Header,
                    version,
                    None,
                ))
            }
            Err(err) => return Err(Failure::codec(err, None)),
        };
        let message_type = Some(header.message_type);

        let body = match decode_body(&encoded.body) {
            Ok(BodyPlaintext::Unsupported { version, .. }) => {
                return Err(Failure::unsupported(
                    EnvelopeKind::Body,
                    version,
                    message_type,
                ))
            }
            Ok(body) => body,
            Err(err) => return Err(Failure::codec(err, message_type)),
        };

        let mismatch = |internal: String| {
            let mut failure = Failure::new(
                MessageUnboxedErrorKind::Misc,
                "this message failed validation",
                internal,
            );
            failure.message_type = message_type;
            failure
        };

        let actual_hash = EnvelopeHash::of(&encoded.body);
        if actual_hash != header.body_hash {
            return Err(mismatch(format!(
                "body hash mismatch: header declares {:?}, body hashes to {:?}",
                header.body_hash, actual_hash
            )));
        }
        let SenderVerification {
            sender,
            sender_device,
            ..
        } = &opened.verification;
        if header.sender != *sender || header.sender_device != *sender_device {
            return Err(mismatch(format!(
                "header claims sender {} device {} but envelope was signed by {} device {}",
                header.sender, header.sender_device, sender, sender_device
            )));
        }

        let Some(body) = body.into_message_body() else {
            return Err(mismatch("body carries no message".into()));
        };
        if body.message_type() != header.message_type {
            return Err(mismatch(format!(
                "header type {} does not match body type {}",
                header.message_type,
                body.message_type()
            )));
        }

        let mentions = self.resolve_mentions(&body).await;

        Ok(MessageUnboxedValid {
            conversation_id,
            server_header: server_header.clone(),
            header_hash: encoded.header_hash(),
            sender_username: opened.verification.sender_username.clone(),
            sender_device_name: opened.verification.sender_device_name.clone(),
            at_mention_usernames: mentions.at_mention_usernames,
            at_mentions: mentions.at_mentions,
            channel_mention: mentions.channel_mention,
            team_mentions: mentions.team_mentions,
            reactions: ReactionMap::default(),
            unfurls: Default::default(),
            reply_to: body.reply_to(),
            client_header: header,
            body,
        })
    }
}

fn error_record(
    sealed: &SealedEnvelope,
    server_header: &ServerHeader,
    verification: Option<&SenderVerification>,
    failure: Failure,
) -> MessageUnboxedError {
    let (version_kind, version_number, is_critical) = match failure.version {
        Some((kind, number, critical)) => (Some(kind), Some(number), critical),
        None => (None, None, false),
    };
    let etime: Option<DateTime<Utc>> = sealed.ephemeral.map(|seal| seal.expires_at);
    MessageUnboxedError {
        kind: failure.kind,
        message: failure.message,
        internal_message: failure.internal_message,
        version_kind,
        version_number,
        is_critical,
        sender_username: verification.map(|v| v.sender_username.clone()),
        sender_device_name: verification.map(|v| v.sender_device_name.clone()),
        message_id: server_header.message_id,
        message_type: failure.message_type,
        ctime: server_header.ctime,
        is_ephemeral: sealed.ephemeral.is_some(),
        is_ephemeral_expired: etime.is_some_and(|etime| etime <= Utc::now()),
        etime,
    }
}

#[cfg(test)]
#[path = "tests/unboxer_tests.rs"]
mod tests;
