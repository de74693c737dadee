use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{
    ChatClient, ChatError, ClientIdentity, ConversationInfo, DirectoryMentionResolver, LoopbackTransport,
    MemoryMessageCache, MessageCache, MissingMentionResolver, MissingTransport, Pagination,
    Transport,
};
use outbox::{MemoryOutboxStore, OutboxStore};
use sealing::{DeviceIdentity, GroupKeySealer, MissingSealingService, SealingService};
use shared::{
    domain::{
        ConversationId, ConversationTriple, DeviceId, MessageId, OutboxId, TlfId, TopicId,
        TopicType, UserId,
    },
    error::ApiError,
    message::{MessageUnboxed, OutboxRecord, OutboxState},
};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, Settings};

#[derive(Parser, Debug)]
#[command(about = "Local outbox and thread tool for the chat transport")]
struct Cli {
    /// Defaults to ./chat.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a text message.
    Post {
        conversation: i64,
        text: String,
        #[arg(long)]
        reply_to: Option<i64>,
    },
    Edit {
        conversation: i64,
        message_id: i64,
        text: String,
    },
    Delete {
        conversation: i64,
        #[arg(required = true)]
        message_ids: Vec<i64>,
    },
    /// List queued sends in ordinal order.
    Outbox { conversation: i64 },
    Cancel { outbox_id: String },
    Retry { outbox_id: String },
    /// Print one page of the cached thread.
    Thread {
        conversation: i64,
        #[arg(long, default_value_t = 50)]
        num: u32,
        #[arg(long)]
        before: Option<i64>,
    },
    /// Send messages between two in-process members and print what the
    /// receiver sees.
    Demo {
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    let filter =
        EnvFilter::try_new(&settings.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match execute(&settings, cli.command).await {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", render_error(err));
            std::process::exit(1);
        }
    }
}

/// Client failures print with their caller-facing code; anything else as the
/// plain error chain.
fn render_error(err: anyhow::Error) -> String {
    match err.downcast::<ChatError>() {
        Ok(err) => {
            let api = ApiError::from(err);
            if api.code.is_transient() {
                format!("error: {api} (try again later)")
            } else {
                format!("error: {api}")
            }
        }
        Err(err) => format!("error: {err:#}"),
    }
}

async fn execute(settings: &Settings, command: Command) -> Result<Vec<String>> {
    if let Command::Demo { messages } = command {
        return run_demo(settings, &messages).await;
    }

    let client = open_client(settings).await?;
    let lines = match command {
        Command::Post {
            conversation,
            text,
            reply_to,
        } => {
            let conversation_id = register(&client, conversation, settings).await;
            let record = client
                .post_text(conversation_id, &text, reply_to.map(MessageId))
                .await?;
            vec![render_record(&record)]
        }
        Command::Edit {
            conversation,
            message_id,
            text,
        } => {
            let conversation_id = register(&client, conversation, settings).await;
            let record = client
                .edit_message(conversation_id, MessageId(message_id), &text)
                .await?;
            vec![render_record(&record)]
        }
        Command::Delete {
            conversation,
            message_ids,
        } => {
            let conversation_id = register(&client, conversation, settings).await;
            let targets: Vec<MessageId> = message_ids.into_iter().map(MessageId).collect();
            let record = client.delete_message(conversation_id, &targets).await?;
            vec![render_record(&record)]
        }
        Command::Outbox { conversation } => client
            .pending_sends(ConversationId(conversation))
            .await?
            .iter()
            .map(render_record)
            .collect(),
        Command::Cancel { outbox_id } => {
            let record = client.cancel_pending_send(OutboxId::parse(&outbox_id)?).await?;
            vec![format!("cancelled {}", record.outbox_id)]
        }
        Command::Retry { outbox_id } => {
            let record = client.retry_pending_send(OutboxId::parse(&outbox_id)?).await?;
            vec![render_record(&record)]
        }
        Command::Thread {
            conversation,
            num,
            before,
        } => {
            let view = client
                .get_thread(
                    ConversationId(conversation),
                    Pagination {
                        num,
                        before: before.map(MessageId),
                    },
                )
                .await?;
            let mut lines: Vec<String> = view
                .messages
                .iter()
                .filter(|message| message.is_visible())
                .map(render_message)
                .collect();
            if let Some(next) = view.next.and_then(|next| next.before) {
                lines.push(format!("-- older messages before #{next} --"));
            }
            lines
        }
        Command::Demo { .. } => Vec::new(),
    };
    Ok(lines)
}

/// A client over the local database. Sends stay queued until a network
/// transport is configured.
async fn open_client(settings: &Settings) -> Result<Arc<ChatClient>> {
    let storage = Arc::new(Storage::new(&settings.database_url).await?);
    info!(database_url = %settings.database_url, "cli: storage ready");
    Ok(ChatClient::new_with_dependencies(
        settings.client_config(),
        settings.identity(),
        Arc::clone(&storage) as Arc<dyn OutboxStore>,
        storage as Arc<dyn MessageCache>,
        Arc::new(MissingSealingService),
        Arc::new(MissingTransport),
        Arc::new(MissingMentionResolver),
    ))
}

async fn register(client: &ChatClient, conversation: i64, settings: &Settings) -> ConversationId {
    let conversation_id = ConversationId(conversation);
    client
        .register_conversation(
            conversation_id,
            conversation_info(conversation, &settings.username),
        )
        .await;
    conversation_id
}

fn conversation_info(conversation: i64, tlf_name: &str) -> ConversationInfo {
    ConversationInfo {
        triple: ConversationTriple {
            tlf_id: TlfId(conversation),
            topic_type: TopicType::Chat,
            topic_id: TopicId(conversation),
        },
        tlf_name: tlf_name.to_string(),
    }
}

async fn run_demo(settings: &Settings, messages: &[String]) -> Result<Vec<String>> {
    let conversation_id = ConversationId(1);
    let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());

    let alice = Arc::new(GroupKeySealer::new(DeviceIdentity::generate(
        UserId(1),
        DeviceId(1),
        "alice",
        "laptop",
    )));
    let bob = Arc::new(GroupKeySealer::new(DeviceIdentity::generate(
        UserId(2),
        DeviceId(2),
        "bob",
        "phone",
    )));
    alice.register_device(bob.identity().public_record()).await;
    bob.register_device(alice.identity().public_record()).await;
    let (generation, root) = alice.rotate_conversation_key(conversation_id).await;
    bob.install_conversation_key(conversation_id, generation, *root)
        .await;

    let alice = demo_client(settings, alice, Arc::clone(&transport));
    let bob = demo_client(settings, bob, transport);
    for client in [&alice, &bob] {
        client
            .register_conversation(conversation_id, conversation_info(1, "alice,bob"))
            .await;
    }

    for text in messages {
        alice.post_text(conversation_id, text, None).await?;
    }
    let sent = alice.deliver_pending_once().await?;
    let received = bob.sync_conversation(conversation_id).await?;
    info!(sent, received = received.len(), "cli: demo exchanged messages");

    let view = bob
        .get_thread(conversation_id, Pagination::newest(0))
        .await?;
    Ok(view
        .messages
        .iter()
        .filter(|message| message.is_visible())
        .map(render_message)
        .collect())
}

fn demo_client(
    settings: &Settings,
    sealer: Arc<GroupKeySealer>,
    transport: Arc<dyn Transport>,
) -> Arc<ChatClient> {
    let identity = sealer.identity();
    let identity = ClientIdentity {
        user_id: identity.user_id,
        device_id: identity.device_id,
        username: identity.username.clone(),
        device_name: identity.device_name.clone(),
    };
    let mentions = DirectoryMentionResolver::new()
        .with_user("alice", UserId(1))
        .with_user("bob", UserId(2));
    ChatClient::new_with_dependencies(
        settings.client_config(),
        identity,
        Arc::new(MemoryOutboxStore::new()),
        Arc::new(MemoryMessageCache::new()),
        sealer as Arc<dyn SealingService>,
        transport,
        Arc::new(mentions),
    )
}

fn render_message(message: &MessageUnboxed) -> String {
    match message {
        MessageUnboxed::Valid(valid) => {
            let text = valid
                .body
                .user_text()
                .map(str::to_string)
                .unwrap_or_else(|| format!("<{}>", valid.body.message_type()));
            let edited = if valid.server_header.superseded_by.is_some() {
                " (edited)"
            } else {
                ""
            };
            format!(
                "#{} {}: {text}{edited}",
                valid.server_header.message_id, valid.sender_username
            )
        }
        MessageUnboxed::Error(error) => format!(
            "#{} <{:?}: {}>",
            error.message_id, error.kind, error.message
        ),
        MessageUnboxed::Outbox(record) => render_record(record),
        MessageUnboxed::Placeholder(placeholder) if placeholder.hidden => {
            format!("#{} <deleted>", placeholder.message_id)
        }
        MessageUnboxed::Placeholder(placeholder) => {
            format!("#{} <not loaded>", placeholder.message_id)
        }
    }
}

fn render_record(record: &OutboxRecord) -> String {
    let state = match &record.state {
        OutboxState::Sending { attempts: 0 } => "queued".to_string(),
        OutboxState::Sending { attempts } => format!("sending, {attempts} attempts"),
        OutboxState::Error { kind, message } => format!("failed {kind:?}: {message}"),
    };
    let text = record
        .msg
        .body
        .user_text()
        .map(str::to_string)
        .unwrap_or_else(|| format!("<{}>", record.msg.message_type()));
    format!(
        "[{}] {} ({state}): {text}",
        record.ordinal, record.outbox_id
    )
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
