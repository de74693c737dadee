use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    body::{KnownTeamMention, MessageBody, MessageType, UnfurlSummary},
    domain::{
        ConversationId, ConversationTriple, DeviceId, EnvelopeHash, MessageId, OutboxId, UserId,
    },
    protocol::{EnvelopeKind, EphemeralMetadata, HeaderPlaintextV1},
};

/// What a user composed, before the send pipeline adds chain pointers and outbox info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePlaintext {
    pub conv: ConversationTriple,
    pub tlf_name: String,
    pub sender: UserId,
    pub sender_device: DeviceId,
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_metadata: Option<EphemeralMetadata>,
}

impl MessagePlaintext {
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxErrorKind {
    Misc,
    Offline,
    Identify,
    TooLong,
    Duplicate,
    Expired,
    TooManyAttempts,
    AlreadyDeleted,
    UploadFailed,
    RestrictedBot,
}

impl OutboxErrorKind {
    pub fn id(self) -> u8 {
        match self {
            OutboxErrorKind::Misc => 0,
            OutboxErrorKind::Offline => 1,
            OutboxErrorKind::Identify => 2,
            OutboxErrorKind::TooLong => 3,
            OutboxErrorKind::Duplicate => 4,
            OutboxErrorKind::Expired => 5,
            OutboxErrorKind::TooManyAttempts => 6,
            OutboxErrorKind::AlreadyDeleted => 7,
            OutboxErrorKind::UploadFailed => 8,
            OutboxErrorKind::RestrictedBot => 9,
        }
    }

    /// `Duplicate` and `AlreadyDeleted` can never succeed on resend.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            OutboxErrorKind::Duplicate | OutboxErrorKind::AlreadyDeleted
        )
    }

    /// Errors the sender loop clears by itself once conditions change.
    pub fn is_auto_retryable(self) -> bool {
        matches!(self, OutboxErrorKind::Offline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OutboxState {
    Sending { attempts: u32 },
    Error { kind: OutboxErrorKind, message: String },
}

impl OutboxState {
    pub fn fresh() -> Self {
        OutboxState::Sending { attempts: 0 }
    }

    pub fn is_sending(&self) -> bool {
        matches!(self, OutboxState::Sending { .. })
    }

    pub fn error_kind(&self) -> Option<OutboxErrorKind> {
        match self {
            OutboxState::Error { kind, .. } => Some(*kind),
            OutboxState::Sending { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub outbox_id: OutboxId,
    pub conversation_id: ConversationId,
    pub ordinal: u64,
    pub state: OutboxState,
    pub ctime: DateTime<Utc>,
    pub msg: MessagePlaintext,
    pub client_prev: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Latest confirmed envelope of a conversation. New sends point back at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub message_id: MessageId,
    pub header_hash: EnvelopeHash,
}

/// Fields the server stamps on a message when it accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHeader {
    pub message_id: MessageId,
    pub ctime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMention {
    #[default]
    None,
    Here,
    All,
}

/// emoji -> reacting username -> id of the reaction message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReactionMap {
    pub reactions: BTreeMap<String, BTreeMap<String, MessageId>>,
}

impl ReactionMap {
    pub fn insert(&mut self, emoji: &str, username: &str, reaction_id: MessageId) {
        self.reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(username.to_string(), reaction_id);
    }

    /// Drops a reaction by its message id, used when a reaction is deleted.
    pub fn remove_by_id(&mut self, reaction_id: MessageId) -> bool {
        let mut removed = false;
        for users in self.reactions.values_mut() {
            let before = users.len();
            users.retain(|_, id| *id != reaction_id);
            removed |= users.len() != before;
        }
        self.reactions.retain(|_, users| !users.is_empty());
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnboxedValid {
    pub conversation_id: ConversationId,
    pub server_header: ServerHeader,
    pub client_header: HeaderPlaintextV1,
    pub body: MessageBody,
    pub header_hash: EnvelopeHash,
    pub sender_username: String,
    pub sender_device_name: String,
    #[serde(default)]
    pub at_mention_usernames: Vec<String>,
    #[serde(default)]
    pub at_mentions: Vec<UserId>,
    #[serde(default)]
    pub channel_mention: ChannelMention,
    #[serde(default)]
    pub team_mentions: Vec<KnownTeamMention>,
    #[serde(default)]
    pub reactions: ReactionMap,
    #[serde(default)]
    pub unfurls: BTreeMap<MessageId, UnfurlSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

impl MessageUnboxedValid {
    pub fn outbox_id(&self) -> Option<OutboxId> {
        self.client_header
            .outbox_info
            .as_ref()
            .map(|info| info.outbox_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageUnboxedErrorKind {
    Misc,
    BadVersionCritical,
    BadVersion,
    Identify,
    Ephemeral,
    PairwiseMissing,
}

/// A message that exists at `message_id` but could not be unboxed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnboxedError {
    pub kind: MessageUnboxedErrorKind,
    pub message: String,
    pub internal_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_kind: Option<EnvelopeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<u16>,
    pub is_critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device_name: Option<String>,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    pub ctime: DateTime<Utc>,
    pub is_ephemeral: bool,
    pub is_ephemeral_expired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnboxedPlaceholder {
    pub message_id: MessageId,
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageUnboxedState {
    Valid,
    Error,
    Outbox,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum MessageUnboxed {
    Valid(MessageUnboxedValid),
    Error(MessageUnboxedError),
    Outbox(OutboxRecord),
    Placeholder(MessageUnboxedPlaceholder),
}

impl MessageUnboxed {
    pub fn state(&self) -> MessageUnboxedState {
        match self {
            MessageUnboxed::Valid(_) => MessageUnboxedState::Valid,
            MessageUnboxed::Error(_) => MessageUnboxedState::Error,
            MessageUnboxed::Outbox(_) => MessageUnboxedState::Outbox,
            MessageUnboxed::Placeholder(_) => MessageUnboxedState::Placeholder,
        }
    }

    /// Server id of the slot. Outbox entries have none yet.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            MessageUnboxed::Valid(valid) => Some(valid.server_header.message_id),
            MessageUnboxed::Error(error) => Some(error.message_id),
            MessageUnboxed::Placeholder(placeholder) => Some(placeholder.message_id),
            MessageUnboxed::Outbox(_) => None,
        }
    }

    /// The outbox id this entry came from, either still pending or confirmed.
    pub fn outbox_id(&self) -> Option<OutboxId> {
        match self {
            MessageUnboxed::Valid(valid) => valid.outbox_id(),
            MessageUnboxed::Outbox(record) => Some(record.outbox_id),
            MessageUnboxed::Error(_) | MessageUnboxed::Placeholder(_) => None,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            MessageUnboxed::Valid(valid) => Some(valid.body.message_type()),
            MessageUnboxed::Error(error) => error.message_type,
            MessageUnboxed::Outbox(record) => Some(record.msg.message_type()),
            MessageUnboxed::Placeholder(_) => None,
        }
    }

    /// Whether the slot should be drawn. Non-critical version errors and hidden
    /// placeholders keep their position but render nothing.
    pub fn is_visible(&self) -> bool {
        match self {
            MessageUnboxed::Valid(valid) => valid.body.message_type().is_visible(),
            MessageUnboxed::Error(error) => error.kind != MessageUnboxedErrorKind::BadVersion,
            MessageUnboxed::Outbox(record) => record.msg.message_type().is_visible(),
            MessageUnboxed::Placeholder(placeholder) => !placeholder.hidden,
        }
    }

    pub fn as_valid(&self) -> Option<&MessageUnboxedValid> {
        match self {
            MessageUnboxed::Valid(valid) => Some(valid),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&MessageUnboxedError> {
        match self {
            MessageUnboxed::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn as_outbox(&self) -> Option<&OutboxRecord> {
        match self {
            MessageUnboxed::Outbox(record) => Some(record),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "tests/message_tests.rs"]
mod tests;
