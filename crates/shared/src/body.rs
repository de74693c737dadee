use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, MessageId, UserId};

/// Wire tag for every body variant. The numeric ids are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Attachment,
    Edit,
    Delete,
    Metadata,
    Headline,
    AttachmentUploaded,
    Join,
    Leave,
    System,
    DeleteHistory,
    Reaction,
    SendPayment,
    RequestPayment,
    Unfurl,
    Flip,
    Pin,
}

impl MessageType {
    pub fn id(self) -> u8 {
        match self {
            MessageType::Text => 1,
            MessageType::Attachment => 2,
            MessageType::Edit => 3,
            MessageType::Delete => 4,
            MessageType::Metadata => 5,
            MessageType::Headline => 7,
            MessageType::AttachmentUploaded => 8,
            MessageType::Join => 9,
            MessageType::Leave => 10,
            MessageType::System => 11,
            MessageType::DeleteHistory => 12,
            MessageType::Reaction => 13,
            MessageType::SendPayment => 14,
            MessageType::RequestPayment => 15,
            MessageType::Unfurl => 16,
            MessageType::Flip => 17,
            MessageType::Pin => 18,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            1 => MessageType::Text,
            2 => MessageType::Attachment,
            3 => MessageType::Edit,
            4 => MessageType::Delete,
            5 => MessageType::Metadata,
            7 => MessageType::Headline,
            8 => MessageType::AttachmentUploaded,
            9 => MessageType::Join,
            10 => MessageType::Leave,
            11 => MessageType::System,
            12 => MessageType::DeleteHistory,
            13 => MessageType::Reaction,
            14 => MessageType::SendPayment,
            15 => MessageType::RequestPayment,
            16 => MessageType::Unfurl,
            17 => MessageType::Flip,
            18 => MessageType::Pin,
            _ => return None,
        })
    }

    /// Types that render as their own slot in a thread. The rest modify other slots.
    pub fn is_visible(self) -> bool {
        !matches!(
            self,
            MessageType::Edit
                | MessageType::Delete
                | MessageType::Reaction
                | MessageType::Unfurl
                | MessageType::AttachmentUploaded
                | MessageType::DeleteHistory
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Text => "text",
            MessageType::Attachment => "attachment",
            MessageType::Edit => "edit",
            MessageType::Delete => "delete",
            MessageType::Metadata => "metadata",
            MessageType::Headline => "headline",
            MessageType::AttachmentUploaded => "attachment_uploaded",
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::System => "system",
            MessageType::DeleteHistory => "delete_history",
            MessageType::Reaction => "reaction",
            MessageType::SendPayment => "send_payment",
            MessageType::RequestPayment => "request_payment",
            MessageType::Unfurl => "unfurl",
            MessageType::Flip => "flip",
            MessageType::Pin => "pin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownUserMention {
    pub text: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownTeamMention {
    pub name: String,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayment {
    pub username: String,
    pub payment_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageText {
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payments: Vec<TextPayment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_mentions: Vec<KnownUserMention>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub team_mentions: Vec<KnownTeamMention>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub filename: String,
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub object: Asset,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previews: Vec<Asset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "crate::serde_b64")]
    pub metadata: Vec<u8>,
    pub uploaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub message_id: MessageId,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_mentions: Vec<KnownUserMention>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub team_mentions: Vec<KnownTeamMention>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelete {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageConversationMetadata {
    pub conversation_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeadline {
    pub headline: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttachmentUploaded {
    pub message_id: MessageId,
    pub object: Asset,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previews: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageJoin {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joiners: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leavers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageLeave {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeleteHistory {
    pub upto: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReaction {
    pub message_id: MessageId,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSendPayment {
    pub payment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequestPayment {
    pub request_id: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfurlSummary {
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnfurl {
    pub message_id: MessageId,
    pub unfurl: UnfurlSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlip {
    pub text: String,
    pub game_id: String,
    pub flip_conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePin {
    pub message_id: MessageId,
}

/// System notices generated on behalf of a team or conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageSystem {
    AddedToTeam {
        team: String,
        adder: String,
        addee: String,
    },
    InviteAddedToTeam {
        team: String,
        inviter: String,
        invitee: String,
    },
    ComplexTeam {
        team: String,
    },
    CreateTeam {
        team: String,
        creator: String,
    },
    GitPush {
        team: String,
        pusher: String,
        repo_name: String,
    },
    ChangeAvatar {
        team: String,
        user: String,
    },
    ChangeRetention {
        is_team: bool,
        is_inherit: bool,
        user: String,
        policy: String,
    },
    BulkAddToConv {
        usernames: Vec<String>,
    },
    SbsResolve {
        assertion_service: String,
        assertion_username: String,
        prover: String,
    },
}

/// Closed registry of message bodies. Each variant owns exactly its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    Text(MessageText),
    Attachment(MessageAttachment),
    Edit(MessageEdit),
    Delete(MessageDelete),
    Metadata(MessageConversationMetadata),
    Headline(MessageHeadline),
    AttachmentUploaded(MessageAttachmentUploaded),
    Join(MessageJoin),
    Leave(MessageLeave),
    System(MessageSystem),
    DeleteHistory(MessageDeleteHistory),
    Reaction(MessageReaction),
    SendPayment(MessageSendPayment),
    RequestPayment(MessageRequestPayment),
    Unfurl(MessageUnfurl),
    Flip(MessageFlip),
    Pin(MessagePin),
}

impl MessageBody {
    pub fn text(body: impl Into<String>) -> Self {
        MessageBody::Text(MessageText {
            body: body.into(),
            payments: Vec::new(),
            user_mentions: Vec::new(),
            team_mentions: Vec::new(),
            reply_to: None,
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Text(_) => MessageType::Text,
            MessageBody::Attachment(_) => MessageType::Attachment,
            MessageBody::Edit(_) => MessageType::Edit,
            MessageBody::Delete(_) => MessageType::Delete,
            MessageBody::Metadata(_) => MessageType::Metadata,
            MessageBody::Headline(_) => MessageType::Headline,
            MessageBody::AttachmentUploaded(_) => MessageType::AttachmentUploaded,
            MessageBody::Join(_) => MessageType::Join,
            MessageBody::Leave(_) => MessageType::Leave,
            MessageBody::System(_) => MessageType::System,
            MessageBody::DeleteHistory(_) => MessageType::DeleteHistory,
            MessageBody::Reaction(_) => MessageType::Reaction,
            MessageBody::SendPayment(_) => MessageType::SendPayment,
            MessageBody::RequestPayment(_) => MessageType::RequestPayment,
            MessageBody::Unfurl(_) => MessageType::Unfurl,
            MessageBody::Flip(_) => MessageType::Flip,
            MessageBody::Pin(_) => MessageType::Pin,
        }
    }

    pub fn as_text(&self) -> Option<&MessageText> {
        match self {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_edit(&self) -> Option<&MessageEdit> {
        match self {
            MessageBody::Edit(edit) => Some(edit),
            _ => None,
        }
    }

    pub fn as_delete(&self) -> Option<&MessageDelete> {
        match self {
            MessageBody::Delete(delete) => Some(delete),
            _ => None,
        }
    }

    pub fn as_reaction(&self) -> Option<&MessageReaction> {
        match self {
            MessageBody::Reaction(reaction) => Some(reaction),
            _ => None,
        }
    }

    pub fn as_attachment(&self) -> Option<&MessageAttachment> {
        match self {
            MessageBody::Attachment(attachment) => Some(attachment),
            _ => None,
        }
    }

    pub fn as_system(&self) -> Option<&MessageSystem> {
        match self {
            MessageBody::System(system) => Some(system),
            _ => None,
        }
    }

    /// Messages this body modifies in place rather than adding a new slot.
    pub fn target_message_ids(&self) -> Vec<MessageId> {
        match self {
            MessageBody::Edit(edit) => vec![edit.message_id],
            MessageBody::Delete(delete) => delete.message_ids.clone(),
            MessageBody::Reaction(reaction) => vec![reaction.message_id],
            MessageBody::Unfurl(unfurl) => vec![unfurl.message_id],
            MessageBody::Pin(pin) => vec![pin.message_id],
            MessageBody::AttachmentUploaded(uploaded) => vec![uploaded.message_id],
            _ => Vec::new(),
        }
    }

    /// Free-form text a user typed, used for length limits and mention parsing.
    pub fn user_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(&text.body),
            MessageBody::Edit(edit) => Some(&edit.body),
            MessageBody::Headline(headline) => Some(&headline.headline),
            MessageBody::Flip(flip) => Some(&flip.text),
            _ => None,
        }
    }

    pub fn reply_to(&self) -> Option<MessageId> {
        self.as_text().and_then(|text| text.reply_to)
    }
}

#[cfg(test)]
#[path = "tests/body_tests.rs"]
mod tests;
