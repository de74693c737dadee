use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, DeviceId, UserId},
    protocol::{EncodedEnvelope, EnvelopeKind, EphemeralMetadata},
};
use thiserror::Error;

mod group_key;
pub use group_key::{DeviceIdentity, DeviceRecord, GroupKeySealer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralSeal {
    pub generation: u32,
    pub expires_at: DateTime<Utc>,
}

/// Ciphertext form of an envelope as it travels through the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub sender_device: DeviceId,
    pub key_generation: u32,
    #[serde(with = "shared::serde_b64")]
    pub header_ciphertext: Vec<u8>,
    #[serde(with = "shared::serde_b64")]
    pub body_ciphertext: Vec<u8>,
    #[serde(with = "shared::serde_b64")]
    pub signature: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralSeal>,
}

/// Who the sealing service proved sent an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderVerification {
    pub sender: UserId,
    pub sender_device: DeviceId,
    pub sender_username: String,
    pub sender_device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedEnvelope {
    pub encoded: EncodedEnvelope,
    pub verification: SenderVerification,
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error("could not identify sender {sender} device {device}: {reason}")]
    Identify {
        sender: UserId,
        device: DeviceId,
        reason: String,
    },
    #[error("no key for conversation {conversation_id} generation {generation}")]
    PairwiseMissing {
        conversation_id: ConversationId,
        generation: u32,
    },
    #[error("ephemeral key generation {generation} expired at {expired_at}")]
    EphemeralExpired {
        generation: u32,
        expired_at: DateTime<Utc>,
    },
    #[error("ephemeral key generation {generation} is not available on this device")]
    EphemeralKeyMissing { generation: u32 },
    #[error("signature from sender {sender} device {device} did not verify")]
    BadSignature { sender: UserId, device: DeviceId },
    #[error("failed to decrypt envelope {part}")]
    Decrypt { part: EnvelopeKind },
    #[error(transparent)]
    Misc(#[from] anyhow::Error),
}

impl SealError {
    /// Whether the failure comes from an ephemeral lifetime rather than tampering.
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            SealError::EphemeralExpired { .. } | SealError::EphemeralKeyMissing { .. }
        )
    }
}

#[async_trait]
pub trait SealingService: Send + Sync {
    async fn seal(
        &self,
        conversation_id: ConversationId,
        envelope: &EncodedEnvelope,
        ephemeral: Option<EphemeralMetadata>,
    ) -> Result<SealedEnvelope, SealError>;
    async fn verify_and_open(&self, sealed: &SealedEnvelope) -> Result<OpenedEnvelope, SealError>;
}

pub struct MissingSealingService;

#[async_trait]
impl SealingService for MissingSealingService {
    async fn seal(
        &self,
        conversation_id: ConversationId,
        _envelope: &EncodedEnvelope,
        _ephemeral: Option<EphemeralMetadata>,
    ) -> Result<SealedEnvelope, SealError> {
        Err(SealError::Misc(anyhow!(
            "sealing backend unavailable for conversation {}",
            conversation_id.0
        )))
    }

    async fn verify_and_open(&self, sealed: &SealedEnvelope) -> Result<OpenedEnvelope, SealError> {
        Err(SealError::Misc(anyhow!(
            "sealing backend unavailable for conversation {}",
            sealed.conversation_id.0
        )))
    }
}
