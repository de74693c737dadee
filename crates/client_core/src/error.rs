use outbox::OutboxError;
use sealing::SealError;
use shared::{
    domain::{ConversationId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::CodecError,
};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("conversation {0} is not registered with this client")]
    UnknownConversation(ConversationId),
    #[error("message {message_id} not found in conversation {conversation_id}")]
    MessageNotFound {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::Outbox(err) => match err {
                OutboxError::NotFound(_) => ErrorCode::NotFound,
                OutboxError::NotRetryable { .. } => ErrorCode::NotRetryable,
                OutboxError::AlreadySent { .. } => ErrorCode::AlreadySent,
                OutboxError::NotSending { .. } | OutboxError::DuplicateOutboxId(_) => {
                    ErrorCode::Validation
                }
                OutboxError::Conflict { .. } => ErrorCode::Conflict,
                OutboxError::Store(_) => ErrorCode::Internal,
            },
            ChatError::Codec(CodecError::UnsupportedCriticalVersion { .. }) => {
                ErrorCode::UnsupportedCriticalVersion
            }
            ChatError::Codec(_) | ChatError::Seal(_) | ChatError::Internal(_) => {
                ErrorCode::Internal
            }
            ChatError::Transport(err) => match err {
                TransportError::Offline => ErrorCode::Offline,
                TransportError::RateLimited { .. } => ErrorCode::RateLimited,
                TransportError::Rejected { .. } => ErrorCode::Rejected,
            },
            ChatError::UnknownConversation(_) | ChatError::MessageNotFound { .. } => {
                ErrorCode::NotFound
            }
            ChatError::Validation(_) => ErrorCode::Validation,
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError::new(self.code(), self.to_string())
    }
}

impl From<ChatError> for ApiError {
    fn from(value: ChatError) -> Self {
        value.to_api_error()
    }
}
