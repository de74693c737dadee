//! Reference sealer built on a shared per-conversation root key.
//!
//! Each key generation derives a 32-byte content key with HKDF-SHA256. Header
//! and body are encrypted separately with ChaCha20-Poly1305 under that key:
//!
//! ```text
//! part ciphertext = nonce (12 bytes) | ciphertext + tag
//! ```
//!
//! The sending device signs a SHA-256 digest that binds the conversation,
//! sender, device, generation and both ciphertexts with its Ed25519 key.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use shared::{
    domain::{ConversationId, DeviceId, UserId},
    protocol::{EncodedEnvelope, EnvelopeKind, EphemeralMetadata},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{
    EphemeralSeal, OpenedEnvelope, SealError, SealedEnvelope, SealingService, SenderVerification,
};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const ENVELOPE_SALT: &[u8] = b"chat-transport/envelope-salt";
const CONTENT_KEY_INFO: &[u8] = b"chat-transport/content-key/v1";
const EPHEMERAL_KEY_INFO: &[u8] = b"chat-transport/ephemeral-key/v1";
const SIGNATURE_CONTEXT: &[u8] = b"chat-transport/envelope-signature/v1";

/// The local device's signing identity.
pub struct DeviceIdentity {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub username: String,
    pub device_name: String,
    signing_key: SigningKey,
}

impl DeviceIdentity {
    pub fn generate(
        user_id: UserId,
        device_id: DeviceId,
        username: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            username: username.into(),
            device_name: device_name.into(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_record(&self) -> DeviceRecord {
        DeviceRecord {
            user_id: self.user_id,
            device_id: self.device_id,
            username: self.username.clone(),
            device_name: self.device_name.clone(),
            verifying_key: self.signing_key.verifying_key(),
            revoked: false,
        }
    }
}

/// What the directory knows about a remote device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub username: String,
    pub device_name: String,
    pub verifying_key: VerifyingKey,
    pub revoked: bool,
}

struct EphemeralSecret {
    root: Zeroizing<[u8; KEY_LEN]>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct SealerState {
    devices: HashMap<(UserId, DeviceId), DeviceRecord>,
    conversation_roots: HashMap<(ConversationId, u32), Zeroizing<[u8; KEY_LEN]>>,
    current_generation: HashMap<ConversationId, u32>,
    ephemeral_roots: HashMap<(ConversationId, u32), EphemeralSecret>,
}

pub struct GroupKeySealer {
    identity: DeviceIdentity,
    inner: RwLock<SealerState>,
}

impl GroupKeySealer {
    pub fn new(identity: DeviceIdentity) -> Self {
        let mut state = SealerState::default();
        let own = identity.public_record();
        state.devices.insert((own.user_id, own.device_id), own);
        Self {
            identity,
            inner: RwLock::new(state),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub async fn register_device(&self, record: DeviceRecord) {
        let mut guard = self.inner.write().await;
        guard
            .devices
            .insert((record.user_id, record.device_id), record);
    }

    pub async fn revoke_device(&self, user_id: UserId, device_id: DeviceId) -> bool {
        let mut guard = self.inner.write().await;
        match guard.devices.get_mut(&(user_id, device_id)) {
            Some(record) => {
                record.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Installs a conversation root for `generation` and makes it current.
    pub async fn install_conversation_key(
        &self,
        conversation_id: ConversationId,
        generation: u32,
        root: [u8; KEY_LEN],
    ) {
        let mut guard = self.inner.write().await;
        guard
            .conversation_roots
            .insert((conversation_id, generation), Zeroizing::new(root));
        let current = guard
            .current_generation
            .entry(conversation_id)
            .or_insert(generation);
        if generation > *current {
            *current = generation;
        }
    }

    /// Creates a fresh random root at the next generation and returns it so it
    /// can be shared with the other members.
    pub async fn rotate_conversation_key(
        &self,
        conversation_id: ConversationId,
    ) -> (u32, Zeroizing<[u8; KEY_LEN]>) {
        let mut root = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut root[..]);
        let generation = {
            let guard = self.inner.read().await;
            guard
                .current_generation
                .get(&conversation_id)
                .map(|g| g + 1)
                .unwrap_or(1)
        };
        self.install_conversation_key(conversation_id, generation, *root)
            .await;
        (generation, root)
    }

    pub async fn install_ephemeral_key(
        &self,
        conversation_id: ConversationId,
        generation: u32,
        root: [u8; KEY_LEN],
        expires_at: DateTime<Utc>,
    ) {
        let mut guard = self.inner.write().await;
        guard.ephemeral_roots.insert(
            (conversation_id, generation),
            EphemeralSecret {
                root: Zeroizing::new(root),
                expires_at,
            },
        );
    }

    pub async fn forget_ephemeral_key(&self, conversation_id: ConversationId, generation: u32) {
        let mut guard = self.inner.write().await;
        guard.ephemeral_roots.remove(&(conversation_id, generation));
    }

    fn signature_digest(
        conversation_id: ConversationId,
        sender: UserId,
        device: DeviceId,
        generation: u32,
        ephemeral: Option<&EphemeralSeal>,
        header_ciphertext: &[u8],
        body_ciphertext: &[u8],
    ) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(SIGNATURE_CONTEXT);
        hasher.update(conversation_id.0.to_be_bytes());
        hasher.update(sender.0.to_be_bytes());
        hasher.update(device.0.to_be_bytes());
        hasher.update(generation.to_be_bytes());
        if let Some(ephemeral) = ephemeral {
            hasher.update(ephemeral.generation.to_be_bytes());
            hasher.update(ephemeral.expires_at.timestamp().to_be_bytes());
        }
        hasher.update((header_ciphertext.len() as u64).to_be_bytes());
        hasher.update(header_ciphertext);
        hasher.update(body_ciphertext);
        hasher.finalize().into()
    }

    fn content_key(
        &self,
        state: &SealerState,
        sealed: &SealedEnvelope,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, SealError> {
        if let Some(ephemeral) = sealed.ephemeral {
            if ephemeral.expires_at <= Utc::now() {
                return Err(SealError::EphemeralExpired {
                    generation: ephemeral.generation,
                    expired_at: ephemeral.expires_at,
                });
            }
            let secret = state
                .ephemeral_roots
                .get(&(sealed.conversation_id, ephemeral.generation))
                .ok_or(SealError::EphemeralKeyMissing {
                    generation: ephemeral.generation,
                })?;
            if secret.expires_at <= Utc::now() {
                return Err(SealError::EphemeralExpired {
                    generation: ephemeral.generation,
                    expired_at: secret.expires_at,
                });
            }
            return derive_key(
                &secret.root,
                EPHEMERAL_KEY_INFO,
                sealed.conversation_id,
                ephemeral.generation,
            );
        }

        let root = state
            .conversation_roots
            .get(&(sealed.conversation_id, sealed.key_generation))
            .ok_or(SealError::PairwiseMissing {
                conversation_id: sealed.conversation_id,
                generation: sealed.key_generation,
            })?;
        derive_key(
            root,
            CONTENT_KEY_INFO,
            sealed.conversation_id,
            sealed.key_generation,
        )
    }
}

#[async_trait]
impl SealingService for GroupKeySealer {
    async fn seal(
        &self,
        conversation_id: ConversationId,
        envelope: &EncodedEnvelope,
        ephemeral: Option<EphemeralMetadata>,
    ) -> Result<SealedEnvelope, SealError> {
        let guard = self.inner.read().await;
        let generation = guard
            .current_generation
            .get(&conversation_id)
            .copied()
            .ok_or(SealError::PairwiseMissing {
                conversation_id,
                generation: 0,
            })?;

        let (key, ephemeral_seal) = match ephemeral {
            Some(meta) => {
                let secret = guard
                    .ephemeral_roots
                    .get(&(conversation_id, meta.generation))
                    .ok_or(SealError::EphemeralKeyMissing {
                        generation: meta.generation,
                    })?;
                let expires_at = i64::try_from(meta.lifetime_secs)
                    .ok()
                    .and_then(ChronoDuration::try_seconds)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .map_or(secret.expires_at, |at| at.min(secret.expires_at));
                let key = derive_key(
                    &secret.root,
                    EPHEMERAL_KEY_INFO,
                    conversation_id,
                    meta.generation,
                )?;
                (
                    key,
                    Some(EphemeralSeal {
                        generation: meta.generation,
                        expires_at,
                    }),
                )
            }
            None => {
                let root = guard
                    .conversation_roots
                    .get(&(conversation_id, generation))
                    .ok_or(SealError::PairwiseMissing {
                        conversation_id,
                        generation,
                    })?;
                (
                    derive_key(root, CONTENT_KEY_INFO, conversation_id, generation)?,
                    None,
                )
            }
        };
        drop(guard);

        let header_ciphertext = encrypt_part(
            &key,
            conversation_id,
            EnvelopeKind::Header,
            &envelope.header,
        )?;
        let body_ciphertext =
            encrypt_part(&key, conversation_id, EnvelopeKind::Body, &envelope.body)?;
        let digest = Self::signature_digest(
            conversation_id,
            self.identity.user_id,
            self.identity.device_id,
            generation,
            ephemeral_seal.as_ref(),
            &header_ciphertext,
            &body_ciphertext,
        );
        let signature = self.identity.signing_key.sign(&digest);

        debug!(
            conversation_id = conversation_id.0,
            generation,
            ephemeral = ephemeral_seal.is_some(),
            "sealing: envelope sealed"
        );
        Ok(SealedEnvelope {
            conversation_id,
            sender: self.identity.user_id,
            sender_device: self.identity.device_id,
            key_generation: generation,
            header_ciphertext,
            body_ciphertext,
            signature: signature.to_bytes().to_vec(),
            ephemeral: ephemeral_seal,
        })
    }

    async fn verify_and_open(&self, sealed: &SealedEnvelope) -> Result<OpenedEnvelope, SealError> {
        let guard = self.inner.read().await;
        let device = guard
            .devices
            .get(&(sealed.sender, sealed.sender_device))
            .ok_or_else(|| SealError::Identify {
                sender: sealed.sender,
                device: sealed.sender_device,
                reason: "device is not in the directory".into(),
            })?;
        if device.revoked {
            warn!(
                conversation_id = sealed.conversation_id.0,
                sender = sealed.sender.0,
                device = sealed.sender_device.0,
                "sealing: envelope from revoked device"
            );
            return Err(SealError::Identify {
                sender: sealed.sender,
                device: sealed.sender_device,
                reason: "device has been revoked".into(),
            });
        }

        let signature =
            Signature::from_slice(&sealed.signature).map_err(|_| SealError::BadSignature {
                sender: sealed.sender,
                device: sealed.sender_device,
            })?;
        let digest = Self::signature_digest(
            sealed.conversation_id,
            sealed.sender,
            sealed.sender_device,
            sealed.key_generation,
            sealed.ephemeral.as_ref(),
            &sealed.header_ciphertext,
            &sealed.body_ciphertext,
        );
        device
            .verifying_key
            .verify_strict(&digest, &signature)
            .map_err(|_| SealError::BadSignature {
                sender: sealed.sender,
                device: sealed.sender_device,
            })?;

        let key = self.content_key(&guard, sealed)?;
        let verification = SenderVerification {
            sender: device.user_id,
            sender_device: device.device_id,
            sender_username: device.username.clone(),
            sender_device_name: device.device_name.clone(),
        };
        drop(guard);

        let header = decrypt_part(
            &key,
            sealed.conversation_id,
            EnvelopeKind::Header,
            &sealed.header_ciphertext,
        )?;
        let body = decrypt_part(
            &key,
            sealed.conversation_id,
            EnvelopeKind::Body,
            &sealed.body_ciphertext,
        )?;
        Ok(OpenedEnvelope {
            encoded: EncodedEnvelope { header, body },
            verification,
        })
    }
}

fn derive_key(
    root: &[u8; KEY_LEN],
    label: &[u8],
    conversation_id: ConversationId,
    generation: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, SealError> {
    let mut info = Zeroizing::new(Vec::with_capacity(label.len() + 12));
    info.extend_from_slice(label);
    info.extend_from_slice(&conversation_id.0.to_be_bytes());
    info.extend_from_slice(&generation.to_be_bytes());

    let hk = hkdf::Hkdf::<Sha256>::new(Some(ENVELOPE_SALT), root);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, &mut okm[..])
        .map_err(|_| SealError::Misc(anyhow!("hkdf expansion failed")))?;
    Ok(okm)
}

fn associated_data(conversation_id: ConversationId, part: EnvelopeKind) -> Vec<u8> {
    let mut aad = conversation_id.0.to_be_bytes().to_vec();
    aad.push(match part {
        EnvelopeKind::Header => b'h',
        EnvelopeKind::Body => b'b',
    });
    aad
}

fn encrypt_part(
    key: &[u8; KEY_LEN],
    conversation_id: ConversationId,
    part: EnvelopeKind,
    plaintext: &[u8],
) -> Result<Vec<u8>, SealError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| SealError::Misc(anyhow!("invalid content key length")))?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let aad = associated_data(conversation_id, part);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| SealError::Misc(anyhow!("failed to encrypt envelope {part}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_part(
    key: &[u8; KEY_LEN],
    conversation_id: ConversationId,
    part: EnvelopeKind,
    data: &[u8],
) -> Result<Vec<u8>, SealError> {
    if data.len() < NONCE_LEN {
        return Err(SealError::Decrypt { part });
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::Decrypt { part })?;
    let aad = associated_data(conversation_id, part);
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| SealError::Decrypt { part })
}

#[cfg(test)]
#[path = "tests/group_key_tests.rs"]
mod tests;
