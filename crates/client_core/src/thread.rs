use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use shared::{
    body::MessageBody,
    domain::{MessageId, OutboxId},
    message::{MessageUnboxed, MessageUnboxedPlaceholder, MessageUnboxedValid, OutboxRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub num: u32,
    /// Exclusive upper bound. `None` asks for the newest page.
    pub before: Option<MessageId>,
}

impl Pagination {
    pub fn newest(num: u32) -> Self {
        Self { num, before: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub messages: Vec<MessageUnboxed>,
    /// Where the next older page starts, if there is one.
    pub next: Option<Pagination>,
}

/// Merges confirmed slots with pending outbox records into one ordered thread.
///
/// Confirmed entries are ordered by message id. Each pending record sits after
/// every confirmed entry with an id at or below its `client_prev`, pending
/// records keep their ordinal order, and a record whose outbox id already shows
/// up on a confirmed message is dropped. Outbox entries found in `confirmed`
/// are treated as pending, so the output can be fed back in unchanged.
pub fn assemble(confirmed: &[MessageUnboxed], pending: &[OutboxRecord]) -> Vec<MessageUnboxed> {
    let mut slots: BTreeMap<MessageId, MessageUnboxed> = BTreeMap::new();
    let mut queued: HashMap<OutboxId, OutboxRecord> = HashMap::new();
    for message in confirmed {
        match message {
            MessageUnboxed::Outbox(record) => {
                queued.entry(record.outbox_id).or_insert_with(|| record.clone());
            }
            other => {
                if let Some(id) = other.message_id() {
                    slots.insert(id, other.clone());
                }
            }
        }
    }
    for record in pending {
        queued.insert(record.outbox_id, record.clone());
    }

    let delivered: HashSet<OutboxId> = slots
        .values()
        .filter_map(MessageUnboxed::as_valid)
        .filter_map(MessageUnboxedValid::outbox_id)
        .collect();
    let mut queued: Vec<OutboxRecord> = queued
        .into_values()
        .filter(|record| !delivered.contains(&record.outbox_id))
        .collect();
    queued.sort_by_key(|record| (record.ordinal, record.ctime, record.outbox_id));

    let mut out = Vec::with_capacity(slots.len() + queued.len());
    let mut queued = queued.into_iter().peekable();
    for (id, message) in slots {
        while let Some(record) = queued.next_if(|record| record.client_prev < id) {
            out.push(MessageUnboxed::Outbox(record));
        }
        out.push(message);
    }
    out.extend(queued.map(MessageUnboxed::Outbox));
    out
}

/// Folds edits, deletes, reactions and unfurls in `messages` into their
/// targets. No slot moves; deleted targets become hidden placeholders.
pub fn apply_supersedes(messages: &mut [MessageUnboxed]) {
    let index: HashMap<MessageId, usize> = messages
        .iter()
        .enumerate()
        .filter_map(|(pos, message)| message.message_id().map(|id| (id, pos)))
        .collect();

    let modifiers: Vec<MessageUnboxedValid> = messages
        .iter()
        .filter_map(MessageUnboxed::as_valid)
        .filter(|valid| !valid.body.target_message_ids().is_empty())
        .cloned()
        .collect();

    for modifier in &modifiers {
        for target_id in modifier.body.target_message_ids() {
            let Some(&pos) = index.get(&target_id) else {
                continue;
            };
            if let Some((reacted_id, reaction_id)) = deleted_reaction(&messages[pos], modifier) {
                if let Some(&reacted) = index.get(&reacted_id) {
                    unreact(&mut messages[reacted], reaction_id);
                }
            }
            apply_modifier(&mut messages[pos], modifier);
        }
    }
}

/// Applies one modifier to one target. Returns whether the target changed.
pub fn apply_modifier(target: &mut MessageUnboxed, modifier: &MessageUnboxedValid) -> bool {
    let modifier_id = modifier.server_header.message_id;
    if let MessageBody::Delete(_) = &modifier.body {
        let Some(target_id) = target.message_id() else {
            return false;
        };
        if matches!(target, MessageUnboxed::Placeholder(p) if p.hidden) {
            return false;
        }
        *target = MessageUnboxed::Placeholder(MessageUnboxedPlaceholder {
            message_id: target_id,
            hidden: true,
        });
        return true;
    }

    let MessageUnboxed::Valid(valid) = target else {
        return false;
    };
    match &modifier.body {
        MessageBody::Reaction(reaction) => {
            let known = valid
                .reactions
                .reactions
                .get(&reaction.body)
                .and_then(|users| users.get(&modifier.sender_username))
                == Some(&modifier_id);
            valid
                .reactions
                .insert(&reaction.body, &modifier.sender_username, modifier_id);
            !known
        }
        MessageBody::Edit(edit) => {
            if modifier.client_header.sender != valid.client_header.sender {
                return false;
            }
            if valid
                .server_header
                .superseded_by
                .is_some_and(|current| current >= modifier_id)
            {
                return false;
            }
            let edited = match &mut valid.body {
                MessageBody::Text(text) => {
                    text.body = edit.body.clone();
                    text.user_mentions = edit.user_mentions.clone();
                    text.team_mentions = edit.team_mentions.clone();
                    true
                }
                MessageBody::Headline(headline) => {
                    headline.headline = edit.body.clone();
                    true
                }
                _ => false,
            };
            if edited {
                valid.server_header.superseded_by = Some(modifier_id);
            }
            edited
        }
        MessageBody::Unfurl(unfurl) => valid
            .unfurls
            .insert(modifier_id, unfurl.unfurl.clone())
            .is_none(),
        MessageBody::AttachmentUploaded(uploaded) => match &mut valid.body {
            MessageBody::Attachment(attachment) if !attachment.uploaded => {
                attachment.object = uploaded.object.clone();
                attachment.previews = uploaded.previews.clone();
                attachment.uploaded = true;
                true
            }
            _ => false,
        },
        _ => false,
    }
}

/// When `modifier` deletes a reaction, the message that reaction points at.
pub fn deleted_reaction(
    target: &MessageUnboxed,
    modifier: &MessageUnboxedValid,
) -> Option<(MessageId, MessageId)> {
    if !matches!(modifier.body, MessageBody::Delete(_)) {
        return None;
    }
    let valid = target.as_valid()?;
    let reaction = valid.body.as_reaction()?;
    Some((reaction.message_id, valid.server_header.message_id))
}

pub fn unreact(target: &mut MessageUnboxed, reaction_id: MessageId) -> bool {
    match target {
        MessageUnboxed::Valid(valid) => valid.reactions.remove_by_id(reaction_id),
        _ => false,
    }
}

/// Pads the ascending slots in `[lower, upper]` so every id has an entry.
pub fn fill_gaps(
    messages: Vec<MessageUnboxed>,
    lower: MessageId,
    upper: MessageId,
) -> Vec<MessageUnboxed> {
    let mut by_id: BTreeMap<MessageId, MessageUnboxed> = messages
        .into_iter()
        .filter_map(|message| message.message_id().map(|id| (id, message)))
        .filter(|(id, _)| *id >= lower && *id <= upper)
        .collect();
    let mut id = lower;
    while id <= upper {
        by_id.entry(id).or_insert(MessageUnboxed::Placeholder(
            MessageUnboxedPlaceholder {
                message_id: id,
                hidden: false,
            },
        ));
        id = id.next();
    }
    by_id.into_values().collect()
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;
