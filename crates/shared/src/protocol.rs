//! Versioned header and body envelopes and their byte codec.
//!
//! Every encoded part starts with a fixed prefix that any client can parse:
//!
//! ```text
//! [ version: u16 big-endian | flags: u8 (bit 0 = critical) | payload ]
//! ```
//!
//! Known versions carry a JSON payload. Unknown versions are decoded only as
//! far as the prefix: a non-critical one becomes `Unsupported`, a critical one
//! is refused with [`CodecError::UnsupportedCriticalVersion`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    body::{MessageBody, MessageType},
    domain::{ConversationTriple, DeviceId, EnvelopeHash, MessageId, OutboxId, UserId},
};

pub const HEADER_VERSION_V1: u16 = 1;
pub const BODY_VERSION_V1: u16 = 1;
pub const BODY_VERSION_V2: u16 = 2;

const PREFIX_LEN: usize = 3;
const FLAG_CRITICAL: u8 = 0b0000_0001;
const FRAME_LEN_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Header,
    Body,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeKind::Header => f.write_str("header"),
            EnvelopeKind::Body => f.write_str("body"),
        }
    }
}

/// The only thing a client knows about a version it cannot parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsupportedMeta {
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreviousPointer {
    pub id: MessageId,
    pub hash: EnvelopeHash,
}

/// Present only while a message is travelling out of a local outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxInfo {
    pub outbox_id: OutboxId,
    pub ordinal: u64,
    pub client_prev: MessageId,
    pub compose_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub version: u32,
    #[serde(with = "crate::serde_b64")]
    pub signature: Vec<u8>,
    #[serde(with = "crate::serde_b64")]
    pub key_id: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralMetadata {
    pub lifetime_secs: u64,
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPlaintextV1 {
    pub conv: ConversationTriple,
    pub tlf_name: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub prev: Vec<MessagePreviousPointer>,
    pub sender: UserId,
    pub sender_device: DeviceId,
    pub body_hash: EnvelopeHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_info: Option<OutboxInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_signature: Option<SignatureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_metadata: Option<EphemeralMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderPlaintext {
    V1(HeaderPlaintextV1),
    Unsupported { version: u16, meta: UnsupportedMeta },
}

impl HeaderPlaintext {
    pub fn version(&self) -> u16 {
        match self {
            HeaderPlaintext::V1(_) => HEADER_VERSION_V1,
            HeaderPlaintext::Unsupported { version, .. } => *version,
        }
    }

    pub fn as_v1(&self) -> Option<&HeaderPlaintextV1> {
        match self {
            HeaderPlaintext::V1(header) => Some(header),
            HeaderPlaintext::Unsupported { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPlaintextV1 {
    pub message_body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPlaintextV2 {
    pub message_body: MessageBody,
    pub meta: UnsupportedMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyPlaintext {
    V1(BodyPlaintextV1),
    V2(BodyPlaintextV2),
    Unsupported { version: u16, meta: UnsupportedMeta },
}

impl BodyPlaintext {
    pub fn version(&self) -> u16 {
        match self {
            BodyPlaintext::V1(_) => BODY_VERSION_V1,
            BodyPlaintext::V2(_) => BODY_VERSION_V2,
            BodyPlaintext::Unsupported { version, .. } => *version,
        }
    }

    pub fn message_body(&self) -> Option<&MessageBody> {
        match self {
            BodyPlaintext::V1(body) => Some(&body.message_body),
            BodyPlaintext::V2(body) => Some(&body.message_body),
            BodyPlaintext::Unsupported { .. } => None,
        }
    }

    pub fn into_message_body(self) -> Option<MessageBody> {
        match self {
            BodyPlaintext::V1(body) => Some(body.message_body),
            BodyPlaintext::V2(body) => Some(body.message_body),
            BodyPlaintext::Unsupported { .. } => None,
        }
    }

    fn critical(&self) -> bool {
        match self {
            BodyPlaintext::V1(_) => false,
            BodyPlaintext::V2(body) => body.meta.critical,
            BodyPlaintext::Unsupported { meta, .. } => meta.critical,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{kind} truncated: needed {expected} bytes, got {actual}")]
    Truncated {
        kind: EnvelopeKind,
        expected: usize,
        actual: usize,
    },
    #[error("{kind} version 0 is not a valid version")]
    ZeroVersion { kind: EnvelopeKind },
    #[error("malformed {kind} v{version} payload: {source}")]
    Malformed {
        kind: EnvelopeKind,
        version: u16,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported critical {kind} version {version}")]
    UnsupportedCriticalVersion { kind: EnvelopeKind, version: u16 },
    #[error("{kind} payload too large to frame: {len} bytes")]
    TooLarge { kind: EnvelopeKind, len: usize },
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: EnvelopeKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Header and body bytes as they are handed to the sealing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEnvelope {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl EncodedEnvelope {
    pub fn body_hash(&self) -> EnvelopeHash {
        EnvelopeHash::of(&self.body)
    }

    pub fn header_hash(&self) -> EnvelopeHash {
        EnvelopeHash::of(&self.header)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let header_len = u32::try_from(self.header.len()).map_err(|_| CodecError::TooLarge {
            kind: EnvelopeKind::Header,
            len: self.header.len(),
        })?;
        let mut out = Vec::with_capacity(FRAME_LEN_BYTES + self.header.len() + self.body.len());
        out.extend_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < FRAME_LEN_BYTES {
            return Err(CodecError::Truncated {
                kind: EnvelopeKind::Header,
                expected: FRAME_LEN_BYTES,
                actual: bytes.len(),
            });
        }
        let (len_bytes, rest) = bytes.split_at(FRAME_LEN_BYTES);
        let header_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if rest.len() < header_len {
            return Err(CodecError::Truncated {
                kind: EnvelopeKind::Header,
                expected: header_len,
                actual: rest.len(),
            });
        }
        let (header, body) = rest.split_at(header_len);
        Ok(Self {
            header: header.to_vec(),
            body: body.to_vec(),
        })
    }
}

pub fn encode_header(header: &HeaderPlaintext) -> Result<Vec<u8>, CodecError> {
    match header {
        HeaderPlaintext::V1(v1) => encode_part(EnvelopeKind::Header, HEADER_VERSION_V1, false, v1),
        HeaderPlaintext::Unsupported { version, meta } => {
            Ok(prefix(*version, meta.critical).to_vec())
        }
    }
}

pub fn decode_header(bytes: &[u8]) -> Result<HeaderPlaintext, CodecError> {
    let (version, critical, payload) = split_prefix(EnvelopeKind::Header, bytes)?;
    match version {
        HEADER_VERSION_V1 => Ok(HeaderPlaintext::V1(parse_payload(
            EnvelopeKind::Header,
            version,
            payload,
        )?)),
        _ => unsupported(EnvelopeKind::Header, version, critical)
            .map(|meta| HeaderPlaintext::Unsupported { version, meta }),
    }
}

pub fn encode_body(body: &BodyPlaintext) -> Result<Vec<u8>, CodecError> {
    let critical = body.critical();
    match body {
        BodyPlaintext::V1(v1) => encode_part(EnvelopeKind::Body, BODY_VERSION_V1, critical, v1),
        BodyPlaintext::V2(v2) => encode_part(EnvelopeKind::Body, BODY_VERSION_V2, critical, v2),
        BodyPlaintext::Unsupported { version, meta } => {
            Ok(prefix(*version, meta.critical).to_vec())
        }
    }
}

pub fn decode_body(bytes: &[u8]) -> Result<BodyPlaintext, CodecError> {
    let (version, critical, payload) = split_prefix(EnvelopeKind::Body, bytes)?;
    match version {
        BODY_VERSION_V1 => Ok(BodyPlaintext::V1(parse_payload(
            EnvelopeKind::Body,
            version,
            payload,
        )?)),
        BODY_VERSION_V2 => Ok(BodyPlaintext::V2(parse_payload(
            EnvelopeKind::Body,
            version,
            payload,
        )?)),
        _ => unsupported(EnvelopeKind::Body, version, critical)
            .map(|meta| BodyPlaintext::Unsupported { version, meta }),
    }
}

pub fn encode_envelope(
    header: &HeaderPlaintext,
    body: &BodyPlaintext,
) -> Result<EncodedEnvelope, CodecError> {
    Ok(EncodedEnvelope {
        header: encode_header(header)?,
        body: encode_body(body)?,
    })
}

pub fn decode_envelope(
    envelope: &EncodedEnvelope,
) -> Result<(HeaderPlaintext, BodyPlaintext), CodecError> {
    Ok((decode_header(&envelope.header)?, decode_body(&envelope.body)?))
}

/// Reads only the always-parseable prefix: `(version, critical)`.
pub fn peek_version(kind: EnvelopeKind, bytes: &[u8]) -> Result<(u16, bool), CodecError> {
    split_prefix(kind, bytes).map(|(version, critical, _)| (version, critical))
}

fn prefix(version: u16, critical: bool) -> [u8; PREFIX_LEN] {
    let [hi, lo] = version.to_be_bytes();
    let flags = if critical { FLAG_CRITICAL } else { 0 };
    [hi, lo, flags]
}

fn encode_part<T: Serialize>(
    kind: EnvelopeKind,
    version: u16,
    critical: bool,
    payload: &T,
) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(payload).map_err(|source| CodecError::Encode { kind, source })?;
    let mut out = Vec::with_capacity(PREFIX_LEN + json.len());
    out.extend_from_slice(&prefix(version, critical));
    out.extend_from_slice(&json);
    Ok(out)
}

fn split_prefix(kind: EnvelopeKind, bytes: &[u8]) -> Result<(u16, bool, &[u8]), CodecError> {
    if bytes.len() < PREFIX_LEN {
        return Err(CodecError::Truncated {
            kind,
            expected: PREFIX_LEN,
            actual: bytes.len(),
        });
    }
    let version = u16::from_be_bytes([bytes[0], bytes[1]]);
    if version == 0 {
        return Err(CodecError::ZeroVersion { kind });
    }
    let critical = bytes[2] & FLAG_CRITICAL != 0;
    Ok((version, critical, &bytes[PREFIX_LEN..]))
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    kind: EnvelopeKind,
    version: u16,
    payload: &[u8],
) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(|source| CodecError::Malformed {
        kind,
        version,
        source,
    })
}

fn unsupported(
    kind: EnvelopeKind,
    version: u16,
    critical: bool,
) -> Result<UnsupportedMeta, CodecError> {
    if critical {
        return Err(CodecError::UnsupportedCriticalVersion { kind, version });
    }
    Ok(UnsupportedMeta { critical })
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
