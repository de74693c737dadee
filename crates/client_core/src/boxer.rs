use shared::{
    body::MessageBody,
    domain::EnvelopeHash,
    message::{ChainHead, OutboxRecord},
    protocol::{
        encode_body, encode_header, BodyPlaintext, BodyPlaintextV1, CodecError, EncodedEnvelope,
        HeaderPlaintext, HeaderPlaintextV1, MessagePreviousPointer, OutboxInfo,
    },
};

/// Plaintext envelope of one outbox record, ready for the sealing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEnvelope {
    pub header: HeaderPlaintextV1,
    pub encoded: EncodedEnvelope,
}

/// Builds the current-version envelope for `record`, chaining it to `head`.
///
/// The body is encoded first so the header can commit to its hash.
pub fn prepare_envelope(
    record: &OutboxRecord,
    head: Option<&ChainHead>,
) -> Result<PreparedEnvelope, CodecError> {
    let body = encode_body(&BodyPlaintext::V1(BodyPlaintextV1 {
        message_body: record.msg.body.clone(),
    }))?;

    let header = HeaderPlaintextV1 {
        conv: record.msg.conv.clone(),
        tlf_name: record.msg.tlf_name.clone(),
        message_type: record.msg.message_type(),
        prev: head
            .map(|head| {
                vec![MessagePreviousPointer {
                    id: head.message_id,
                    hash: head.header_hash,
                }]
            })
            .unwrap_or_default(),
        sender: record.msg.sender,
        sender_device: record.msg.sender_device,
        body_hash: EnvelopeHash::of(&body),
        outbox_info: Some(OutboxInfo {
            outbox_id: record.outbox_id,
            ordinal: record.ordinal,
            client_prev: record.client_prev,
            compose_time: record.ctime,
        }),
        header_signature: None,
        ephemeral_metadata: record.msg.ephemeral_metadata,
    };
    let encoded_header = encode_header(&HeaderPlaintext::V1(header.clone()))?;

    Ok(PreparedEnvelope {
        header,
        encoded: EncodedEnvelope {
            header: encoded_header,
            body,
        },
    })
}

/// Length of the user-typed text in `body`, when it exceeds `max_chars`.
pub fn oversized_text(body: &MessageBody, max_chars: usize) -> Option<usize> {
    let len = body.user_text()?.chars().count();
    (len > max_chars).then_some(len)
}

#[cfg(test)]
#[path = "tests/boxer_tests.rs"]
mod tests;
