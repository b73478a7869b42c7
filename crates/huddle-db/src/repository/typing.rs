//! # Typing Indicator Repository
//!
//! One row per `(channel_id, profile_id)` while that profile is typing.
//! Upserting refreshes `started_at`; clearing an absent row is a no-op.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use huddle_core::{ChangeKind, Table, TypingIndicator};

use crate::error::DbResult;
use crate::feed::ChangeFeed;

/// Repository for typing indicator rows.
#[derive(Debug, Clone)]
pub struct TypingRepository {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl TypingRepository {
    /// Creates a new TypingRepository.
    pub fn new(pool: SqlitePool, feed: ChangeFeed) -> Self {
        TypingRepository { pool, feed }
    }

    /// Finds the typing row of a profile in a channel.
    pub async fn find(&self, channel_id: &str, profile_id: &str) -> DbResult<Option<TypingIndicator>> {
        let row = sqlx::query_as::<_, TypingIndicator>(
            r#"
            SELECT id, channel_id, profile_id, started_at
            FROM typing_indicators
            WHERE channel_id = ?1 AND profile_id = ?2
            "#,
        )
        .bind(channel_id)
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Lists typing rows in a channel.
    pub async fn list(&self, channel_id: &str) -> DbResult<Vec<TypingIndicator>> {
        let rows = sqlx::query_as::<_, TypingIndicator>(
            r#"
            SELECT id, channel_id, profile_id, started_at
            FROM typing_indicators
            WHERE channel_id = ?1
            ORDER BY started_at ASC
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Inserts or refreshes a typing row.
    pub async fn upsert(&self, channel_id: &str, profile_id: &str) -> DbResult<TypingIndicator> {
        debug!(channel_id = %channel_id, profile_id = %profile_id, "Upserting typing indicator");

        let now = Utc::now();
        let existing = self.find(channel_id, profile_id).await?;
        let kind = if existing.is_some() {
            ChangeKind::Updated
        } else {
            ChangeKind::Inserted
        };

        let indicator = TypingIndicator {
            id: existing
                .map(|row| row.id)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            channel_id: channel_id.to_string(),
            profile_id: profile_id.to_string(),
            started_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO typing_indicators (id, channel_id, profile_id, started_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (channel_id, profile_id) DO UPDATE SET started_at = excluded.started_at
            "#,
        )
        .bind(&indicator.id)
        .bind(&indicator.channel_id)
        .bind(&indicator.profile_id)
        .bind(indicator.started_at)
        .execute(&self.pool)
        .await?;

        self.feed
            .publish_row(Table::TypingIndicators, kind, channel_id, &indicator);

        Ok(indicator)
    }

    /// Removes a profile's typing row. Returns false if there was none.
    pub async fn clear(&self, channel_id: &str, profile_id: &str) -> DbResult<bool> {
        let Some(existing) = self.find(channel_id, profile_id).await? else {
            return Ok(false);
        };

        debug!(channel_id = %channel_id, profile_id = %profile_id, "Clearing typing indicator");

        let result = sqlx::query("DELETE FROM typing_indicators WHERE id = ?1")
            .bind(&existing.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.feed
            .publish_row(Table::TypingIndicators, ChangeKind::Removed, channel_id, &existing);

        Ok(true)
    }
}
