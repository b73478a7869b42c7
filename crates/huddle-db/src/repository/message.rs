//! # Message Repository
//!
//! Snapshot queries and writes for channel messages.
//!
//! ## Snapshot Query
//! ```text
//! SELECT … FROM messages
//!  WHERE channel_id = ?
//!    AND (top_level_only = 0 OR thread_id IS NULL)
//!    AND (include_deleted = 1 OR is_deleted = 0)
//!  ORDER BY created_at DESC, rowid DESC   ← newest N win
//!  LIMIT N
//! ```
//! The caller reorders into view order; the query only decides *which* rows.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use huddle_core::{ChangeKind, Message, MessageFilter, MessagePatch, NewMessage, SortOrder, Table};

use super::MESSAGE_COLUMNS;
use crate::error::{DbError, DbResult};
use crate::feed::ChangeFeed;

/// Repository for message database operations.
#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl MessageRepository {
    /// Creates a new MessageRepository.
    pub fn new(pool: SqlitePool, feed: ChangeFeed) -> Self {
        MessageRepository { pool, feed }
    }

    /// Fetches up to `limit` messages of a channel matching `filter`.
    ///
    /// With [`SortOrder::Descending`] this returns the newest rows first.
    pub async fn fetch_recent(
        &self,
        channel_id: &str,
        filter: &MessageFilter,
        limit: u32,
        order: SortOrder,
    ) -> DbResult<Vec<Message>> {
        debug!(channel_id = %channel_id, limit = limit, order = %order, "Fetching messages");

        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE channel_id = ?1
              AND (?2 = 0 OR thread_id IS NULL)
              AND (?3 = 1 OR is_deleted = 0)
            ORDER BY created_at {order}, rowid {order}
            LIMIT ?4
            "#
        );

        let messages = sqlx::query_as::<_, Message>(&sql)
            .bind(channel_id)
            .bind(filter.top_level_only)
            .bind(filter.include_deleted)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(messages)
    }

    /// Gets a message by id, including soft-deleted ones.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");

        let message = sqlx::query_as::<_, Message>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(message)
    }

    /// Inserts a message. The id and timestamps are assigned here.
    pub async fn insert(&self, new: &NewMessage) -> DbResult<Message> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            channel_id: new.channel_id.clone(),
            sender_id: new.sender_id.clone(),
            content: new.content.clone(),
            thread_id: new.thread_id.clone(),
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };

        debug!(id = %message.id, channel_id = %message.channel_id, "Inserting message");

        sqlx::query(
            r#"
            INSERT INTO messages (
                id, channel_id, sender_id, content, thread_id,
                is_edited, is_deleted, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&message.id)
        .bind(&message.channel_id)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(&message.thread_id)
        .bind(message.is_edited)
        .bind(message.is_deleted)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        self.feed.publish_row(
            Table::Messages,
            ChangeKind::Inserted,
            &message.channel_id,
            &message,
        );

        Ok(message)
    }

    /// Applies a partial update and returns the updated row.
    ///
    /// ## Returns
    /// * `Err(DbError::NotFound)` - No message with this id
    pub async fn update(&self, id: &str, patch: &MessagePatch) -> DbResult<Message> {
        debug!(id = %id, "Updating message");

        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let mut message = sqlx::query_as::<_, Message>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::not_found("Message", id))?;

        let now = Utc::now();
        patch.apply_to(&mut message, now);

        sqlx::query(
            r#"
            UPDATE messages SET
                content = ?2,
                is_edited = ?3,
                is_deleted = ?4,
                deleted_at = CASE WHEN ?4 = 1 THEN COALESCE(deleted_at, ?5) ELSE NULL END,
                updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&message.content)
        .bind(message.is_edited)
        .bind(message.is_deleted)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.feed.publish_row(
            Table::Messages,
            ChangeKind::Updated,
            &message.channel_id,
            &message,
        );

        Ok(message)
    }

    /// Soft-deletes a message. Subscribers see an update with `is_deleted`.
    pub async fn soft_delete(&self, id: &str) -> DbResult<Message> {
        self.update(id, &MessagePatch::soft_delete()).await
    }

    /// Hard-deletes a message and its reactions.
    pub async fn purge(&self, id: &str) -> DbResult<()> {
        debug!(id = %id, "Purging message");

        let message = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("Message", id))?;

        sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.feed.publish_row(
            Table::Messages,
            ChangeKind::Removed,
            &message.channel_id,
            &message,
        );

        Ok(())
    }

    /// Counts visible messages in a channel.
    pub async fn count(&self, channel_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?1 AND is_deleted = 0",
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
