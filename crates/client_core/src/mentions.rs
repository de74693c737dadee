use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    body::{KnownTeamMention, MessageBody},
    domain::UserId,
    message::ChannelMention,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedMentions {
    pub at_mention_usernames: Vec<String>,
    pub at_mentions: Vec<UserId>,
    pub channel_mention: ChannelMention,
    pub team_mentions: Vec<KnownTeamMention>,
}

#[async_trait]
pub trait MentionResolver: Send + Sync {
    async fn resolve_mentions(&self, body: &MessageBody) -> Result<ResolvedMentions>;
}

/// Resolves nothing beyond the mentions a sender already attached to the body.
pub struct MissingMentionResolver;

#[async_trait]
impl MentionResolver for MissingMentionResolver {
    async fn resolve_mentions(&self, body: &MessageBody) -> Result<ResolvedMentions> {
        let mut resolved = ResolvedMentions::default();
        attach_known(body, &mut resolved);
        Ok(resolved)
    }
}

/// Static username and team directory.
#[derive(Debug, Clone, Default)]
pub struct DirectoryMentionResolver {
    users: HashMap<String, UserId>,
    teams: HashSet<String>,
}

impl DirectoryMentionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: &str, user_id: UserId) -> Self {
        self.users.insert(username.to_ascii_lowercase(), user_id);
        self
    }

    pub fn with_team(mut self, team: &str) -> Self {
        self.teams.insert(team.to_ascii_lowercase());
        self
    }
}

#[async_trait]
impl MentionResolver for DirectoryMentionResolver {
    async fn resolve_mentions(&self, body: &MessageBody) -> Result<ResolvedMentions> {
        let mut resolved = ResolvedMentions::default();
        attach_known(body, &mut resolved);

        let Some(text) = body.user_text() else {
            return Ok(resolved);
        };
        for token in text.split_whitespace() {
            let Some(name) = token.strip_prefix('@') else {
                continue;
            };
            let name = name.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_');
            if name.is_empty() {
                continue;
            }

            match name.to_ascii_lowercase().as_str() {
                "here" => resolved.channel_mention = ChannelMention::Here,
                "channel" | "everyone" => resolved.channel_mention = ChannelMention::All,
                lowered => {
                    if let Some((team, channel)) = lowered.split_once('#') {
                        if self.teams.contains(team) && !channel.is_empty() {
                            push_team(&mut resolved, team, channel);
                        }
                    } else if let Some(user_id) = self.users.get(lowered) {
                        push_user(&mut resolved, lowered, *user_id);
                    }
                }
            }
        }
        Ok(resolved)
    }
}

fn attach_known(body: &MessageBody, resolved: &mut ResolvedMentions) {
    let (users, teams) = match body {
        MessageBody::Text(text) => (&text.user_mentions, &text.team_mentions),
        MessageBody::Edit(edit) => (&edit.user_mentions, &edit.team_mentions),
        _ => return,
    };
    for mention in users {
        push_user(resolved, &mention.text, mention.user_id);
    }
    for mention in teams {
        push_team(resolved, &mention.name, &mention.channel);
    }
}

fn push_user(resolved: &mut ResolvedMentions, username: &str, user_id: UserId) {
    if !resolved.at_mentions.contains(&user_id) {
        resolved.at_mentions.push(user_id);
        resolved.at_mention_usernames.push(username.to_string());
    }
}

fn push_team(resolved: &mut ResolvedMentions, name: &str, channel: &str) {
    let mention = KnownTeamMention {
        name: name.to_string(),
        channel: channel.to_string(),
    };
    if !resolved.team_mentions.contains(&mention) {
        resolved.team_mentions.push(mention);
    }
}

#[cfg(test)]
#[path = "tests/mentions_tests.rs"]
mod tests;
