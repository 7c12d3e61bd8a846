use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{Channel, ChannelId, Message, MessageId, UserId};

/// Persistent cache of channels and their messages.
///
/// The cache is derived state: callers treat a failed read as "nothing
/// cached" and a failed write as a lost optimization, never as data loss.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Channels in the order they were first cached.
    async fn list_channels(&self) -> Result<Vec<Channel>>;
    async fn upsert_channels(&self, channels: &[Channel]) -> Result<()>;
    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<()>;
    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<Message>>;
    /// Inserts messages not yet cached; already cached ids are left untouched.
    async fn upsert_messages(&self, channel_id: &ChannelId, messages: &[Message]) -> Result<()>;
    async fn delete_channel_messages(&self, channel_id: &ChannelId) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .context("failed to open sqlite cache")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate sqlite cache")?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn channel(&self, channel_id: &ChannelId) -> Result<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, name, logo_ref, last_message, last_activity FROM channels WHERE id = ?",
        )
        .bind(channel_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| channel_from_row(&r)))
    }

    pub async fn message_count(&self, channel_id: &ChannelId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE channel_id = ?")
            .bind(channel_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn channel_from_row(r: &SqliteRow) -> Channel {
    Channel {
        id: ChannelId(r.get::<String, _>(0)),
        name: r.get::<String, _>(1),
        logo_ref: r.get::<Option<String>, _>(2),
        last_message: r.get::<Option<String>, _>(3),
        last_activity: r.get::<Option<DateTime<Utc>>, _>(4),
    }
}

fn message_from_row(r: &SqliteRow) -> Message {
    Message {
        id: MessageId(r.get::<String, _>(1)),
        channel_id: ChannelId(r.get::<String, _>(0)),
        text: r.get::<String, _>(2),
        author_id: UserId(r.get::<String, _>(3)),
        author_name: r.get::<String, _>(4),
        timestamp: r.get::<DateTime<Utc>, _>(5),
    }
}

#[async_trait]
impl LocalStore for Storage {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, name, logo_ref, last_message, last_activity
             FROM channels
             ORDER BY rowid ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list cached channels")?;
        Ok(rows.iter().map(channel_from_row).collect())
    }

    async fn upsert_channels(&self, channels: &[Channel]) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for channel in channels {
            sqlx::query(
                "INSERT INTO channels (id, name, logo_ref, last_message, last_activity, updated_at)
                 VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    logo_ref = excluded.logo_ref,
                    last_message = excluded.last_message,
                    last_activity = excluded.last_activity,
                    updated_at = CURRENT_TIMESTAMP",
            )
            .bind(channel.id.as_str())
            .bind(&channel.name)
            .bind(channel.logo_ref.as_deref())
            .bind(channel.last_message.as_deref())
            .bind(channel.last_activity)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert channel {}", channel.id))?;
        }
        tx.commit().await.context("failed to commit channel upsert")?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<()> {
        sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete channel {channel_id}"))?;
        Ok(())
    }

    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT channel_id, id, text, author_id, author_name, sent_at
             FROM messages
             WHERE channel_id = ?
             ORDER BY sent_at ASC, rowid ASC",
        )
        .bind(channel_id.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list cached messages for channel {channel_id}"))?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn upsert_messages(&self, channel_id: &ChannelId, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for message in messages {
            sqlx::query(
                "INSERT INTO messages (channel_id, id, text, author_id, author_name, sent_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(channel_id, id) DO NOTHING",
            )
            .bind(channel_id.as_str())
            .bind(message.id.as_str())
            .bind(&message.text)
            .bind(message.author_id.as_str())
            .bind(&message.author_name)
            .bind(message.timestamp)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert message {}", message.id))?;
        }
        tx.commit()
            .await
            .with_context(|| format!("failed to commit messages for channel {channel_id}"))?;
        Ok(())
    }

    async fn delete_channel_messages(&self, channel_id: &ChannelId) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE channel_id = ?")
            .bind(channel_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to purge messages for channel {channel_id}"))?;
        Ok(())
    }
}

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
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
