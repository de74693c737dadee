use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox::{AppendOutcome, CasOutcome, NewOutboxEntry, OutboxStore};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::{
    domain::{ConversationId, EnvelopeHash, MessageId, OutboxId},
    message::{ChainHead, MessageUnboxed, OutboxRecord, OutboxState},
};

const MEMORY_URL: &str = "sqlite::memory:";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory url is a separate database.
        let max_connections = if database_url.starts_with(MEMORY_URL) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Caches an unboxed message under (ConversationID, MessageID). Later
    /// writes for the same slot replace earlier ones.
    pub async fn put_cached_message(
        &self,
        conversation_id: ConversationId,
        message: &MessageUnboxed,
    ) -> Result<()> {
        let message_id = message
            .message_id()
            .ok_or_else(|| anyhow!("outbox entries have no message id and are not cached"))?;
        let state = serde_json::to_value(message.state())?;
        let message_json = serde_json::to_string(message)?;
        sqlx::query(
            "INSERT INTO message_cache (conversation_id, message_id, state, message_json, updated_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(conversation_id, message_id) DO UPDATE SET
                state = excluded.state,
                message_json = excluded.message_json,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(conversation_id.0)
        .bind(message_id.0)
        .bind(state.as_str().unwrap_or_default().to_string())
        .bind(message_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_cached_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Option<MessageUnboxed>> {
        let row = sqlx::query(
            "SELECT message_json FROM message_cache WHERE conversation_id = ? AND message_id = ?",
        )
        .bind(conversation_id.0)
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode_cached(&r)).transpose()
    }

    /// Up to `limit` cached messages older than `before`, in ascending id order.
    pub async fn list_cached_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageUnboxed>> {
        let mut rows = sqlx::query(
            "SELECT message_json
             FROM message_cache
             WHERE conversation_id = ? AND message_id < ?
             ORDER BY message_id DESC
             LIMIT ?",
        )
        .bind(conversation_id.0)
        .bind(before.map(|id| id.0).unwrap_or(i64::MAX))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        rows.iter().map(decode_cached).collect()
    }

    pub async fn latest_cached_message_id(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<MessageId>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(message_id) FROM message_cache WHERE conversation_id = ?")
                .bind(conversation_id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.map(MessageId))
    }

    /// Stores `head` unless a newer head is already recorded.
    pub async fn save_chain_head(
        &self,
        conversation_id: ConversationId,
        head: &ChainHead,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chain_heads (conversation_id, message_id, header_hash, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(conversation_id) DO UPDATE SET
                message_id = excluded.message_id,
                header_hash = excluded.header_hash,
                updated_at = CURRENT_TIMESTAMP
             WHERE excluded.message_id > chain_heads.message_id",
        )
        .bind(conversation_id.0)
        .bind(head.message_id.0)
        .bind(head.header_hash.to_base64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_chain_head(&self, conversation_id: ConversationId) -> Result<Option<ChainHead>> {
        let row = sqlx::query(
            "SELECT message_id, header_hash FROM chain_heads WHERE conversation_id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let header_hash = EnvelopeHash::from_base64(&r.get::<String, _>(1))
                .map_err(|err| anyhow!("corrupt chain head hash: {err}"))?;
            Ok(ChainHead {
                message_id: MessageId(r.get::<i64, _>(0)),
                header_hash,
            })
        })
        .transpose()
    }
}

fn decode_cached(row: &SqliteRow) -> Result<MessageUnboxed> {
    let raw = row.get::<String, _>(0);
    serde_json::from_str(&raw).context("corrupt cached message")
}

fn state_json(state: &OutboxState) -> Result<String> {
    serde_json::to_string(state).context("failed to encode outbox state")
}

fn record_from_row(row: &SqliteRow) -> Result<OutboxRecord> {
    let outbox_id = OutboxId::parse(&row.get::<String, _>(0))
        .map_err(|err| anyhow!("corrupt outbox id: {err}"))?;
    let state: OutboxState = serde_json::from_str(&row.get::<String, _>(3))
        .with_context(|| format!("corrupt state for outbox record {outbox_id}"))?;
    let msg = serde_json::from_str(&row.get::<String, _>(4))
        .with_context(|| format!("corrupt plaintext for outbox record {outbox_id}"))?;
    Ok(OutboxRecord {
        outbox_id,
        conversation_id: ConversationId(row.get::<i64, _>(1)),
        ordinal: row.get::<i64, _>(2) as u64,
        state,
        msg,
        client_prev: MessageId(row.get::<i64, _>(5)),
        reply_to: row.get::<Option<i64>, _>(6).map(MessageId),
        preview: row.get::<Option<String>, _>(7),
        ctime: row.get::<DateTime<Utc>, _>(8),
    })
}

const RECORD_COLUMNS: &str =
    "outbox_id, conversation_id, ordinal, state_json, msg_json, client_prev, reply_to, preview, ctime";

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with(MEMORY_URL) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl OutboxStore for Storage {
    async fn append_record(&self, entry: NewOutboxEntry) -> Result<AppendOutcome> {
        let outbox_id = entry.outbox_id.to_string();
        let mut tx = self.pool.begin().await?;

        let taken: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM outbox_records WHERE outbox_id = ?)
                  + (SELECT COUNT(*) FROM outbox_confirmations WHERE outbox_id = ?)",
        )
        .bind(&outbox_id)
        .bind(&outbox_id)
        .fetch_one(&mut *tx)
        .await?;
        if taken > 0 {
            return Ok(AppendOutcome::DuplicateId);
        }

        let ordinal: i64 = sqlx::query_scalar(
            "INSERT INTO outbox_ordinals (conversation_id, last_ordinal) VALUES (?, 1)
             ON CONFLICT(conversation_id) DO UPDATE SET last_ordinal = last_ordinal + 1
             RETURNING last_ordinal",
        )
        .bind(entry.conversation_id.0)
        .fetch_one(&mut *tx)
        .await?;

        let state = OutboxState::fresh();
        sqlx::query(
            "INSERT INTO outbox_records (outbox_id, conversation_id, ordinal, state_json, msg_json, client_prev, reply_to, preview, ctime)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&outbox_id)
        .bind(entry.conversation_id.0)
        .bind(ordinal)
        .bind(state_json(&state)?)
        .bind(serde_json::to_string(&entry.msg)?)
        .bind(entry.client_prev.0)
        .bind(entry.reply_to.map(|id| id.0))
        .bind(entry.preview.as_deref())
        .bind(entry.ctime)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(AppendOutcome::Appended(OutboxRecord {
            outbox_id: entry.outbox_id,
            conversation_id: entry.conversation_id,
            ordinal: ordinal as u64,
            state,
            ctime: entry.ctime,
            msg: entry.msg,
            client_prev: entry.client_prev,
            reply_to: entry.reply_to,
            preview: entry.preview,
        }))
    }

    async fn load_record(&self, outbox_id: OutboxId) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_records WHERE outbox_id = ?"
        ))
        .bind(outbox_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_records(&self, conversation_id: ConversationId) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_records WHERE conversation_id = ? ORDER BY ordinal ASC"
        ))
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT conversation_id FROM outbox_records ORDER BY conversation_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ConversationId).collect())
    }

    async fn swap_state(
        &self,
        outbox_id: OutboxId,
        expected: &OutboxState,
        next: &OutboxState,
    ) -> Result<CasOutcome> {
        let id = outbox_id.to_string();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE outbox_records SET state_json = ?, updated_at = CURRENT_TIMESTAMP
             WHERE outbox_id = ? AND state_json = ?",
        )
        .bind(state_json(next)?)
        .bind(&id)
        .bind(state_json(expected)?)
        .execute(&mut *tx)
        .await?;
        let outcome = if result.rows_affected() > 0 {
            CasOutcome::Applied
        } else {
            current_state(&mut tx, &id).await?
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn remove_record(
        &self,
        outbox_id: OutboxId,
        expected: &OutboxState,
    ) -> Result<CasOutcome> {
        let id = outbox_id.to_string();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM outbox_records WHERE outbox_id = ? AND state_json = ?")
            .bind(&id)
            .bind(state_json(expected)?)
            .execute(&mut *tx)
            .await?;
        let outcome = if result.rows_affected() > 0 {
            CasOutcome::Applied
        } else {
            current_state(&mut tx, &id).await?
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn confirm_record(
        &self,
        outbox_id: OutboxId,
        message_id: MessageId,
    ) -> Result<Option<OutboxRecord>> {
        let id = outbox_id.to_string();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "DELETE FROM outbox_records WHERE outbox_id = ? RETURNING {RECORD_COLUMNS}"
        ))
        .bind(&id)
        .fetch_optional(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO outbox_confirmations (outbox_id, message_id) VALUES (?, ?)
             ON CONFLICT(outbox_id) DO UPDATE SET message_id = excluded.message_id",
        )
        .bind(&id)
        .bind(message_id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(
            outbox_id = %outbox_id,
            message_id = message_id.0,
            removed = row.is_some(),
            "storage: outbox confirmation written"
        );
        row.as_ref().map(record_from_row).transpose()
    }

    async fn load_confirmation(&self, outbox_id: OutboxId) -> Result<Option<MessageId>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT message_id FROM outbox_confirmations WHERE outbox_id = ?")
                .bind(outbox_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.map(MessageId))
    }
}

async fn current_state(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    outbox_id: &str,
) -> Result<CasOutcome> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT state_json FROM outbox_records WHERE outbox_id = ?")
            .bind(outbox_id)
            .fetch_optional(&mut **tx)
            .await?;
    match raw {
        Some(raw) => Ok(CasOutcome::Conflict(
            serde_json::from_str(&raw).context("corrupt outbox state")?,
        )),
        None => Ok(CasOutcome::Missing),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
