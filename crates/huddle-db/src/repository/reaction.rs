//! # Reaction Repository
//!
//! Reaction rows are unique per `(message_id, profile_id, emoji)`. Change
//! notifications carry the parent message's channel so channel-scoped
//! subscribers can filter them.

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use huddle_core::{ChangeKind, NewReaction, Reaction, Table};

use crate::error::{DbError, DbResult};
use crate::feed::ChangeFeed;

/// Repository for reaction database operations.
#[derive(Debug, Clone)]
pub struct ReactionRepository {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl ReactionRepository {
    /// Creates a new ReactionRepository.
    pub fn new(pool: SqlitePool, feed: ChangeFeed) -> Self {
        ReactionRepository { pool, feed }
    }

    /// Lists reactions on the given messages, oldest first.
    pub async fn list_for_messages(&self, message_ids: &[String]) -> DbResult<Vec<Reaction>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = message_ids.len(), "Fetching reactions");

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, message_id, profile_id, emoji, created_at FROM reactions WHERE message_id IN (",
        );
        let mut ids = qb.separated(", ");
        for id in message_ids {
            ids.push_bind(id.clone());
        }
        ids.push_unseparated(") ORDER BY created_at ASC, rowid ASC");

        let rows = qb
            .build_query_as::<Reaction>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// Gets a reaction row by id.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Reaction>> {
        let row = sqlx::query_as::<_, Reaction>(
            "SELECT id, message_id, profile_id, emoji, created_at FROM reactions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Inserts a reaction.
    ///
    /// ## Returns
    /// * `Err(DbError::NotFound)` - The message does not exist
    /// * `Err(DbError::UniqueViolation)` - The triple already exists
    pub async fn insert(&self, new: &NewReaction) -> DbResult<Reaction> {
        let channel_id = self.channel_of(&new.message_id).await?;

        let reaction = Reaction {
            id: Uuid::new_v4().to_string(),
            message_id: new.message_id.clone(),
            profile_id: new.profile_id.clone(),
            emoji: new.emoji.clone(),
            created_at: Utc::now(),
        };

        debug!(
            message_id = %reaction.message_id,
            profile_id = %reaction.profile_id,
            emoji = %reaction.emoji,
            "Inserting reaction"
        );

        sqlx::query(
            r#"
            INSERT INTO reactions (id, message_id, profile_id, emoji, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&reaction.id)
        .bind(&reaction.message_id)
        .bind(&reaction.profile_id)
        .bind(&reaction.emoji)
        .bind(reaction.created_at)
        .execute(&self.pool)
        .await?;

        self.feed
            .publish_row(Table::Reactions, ChangeKind::Inserted, &channel_id, &reaction);

        Ok(reaction)
    }

    /// Deletes exactly one reaction row.
    ///
    /// ## Returns
    /// * `Err(DbError::NotFound)` - The row is already gone
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        debug!(id = %id, "Deleting reaction");

        let reaction = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("Reaction", id))?;
        let channel_id = self.channel_of(&reaction.message_id).await?;

        let result = sqlx::query("DELETE FROM reactions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Reaction", id));
        }

        self.feed
            .publish_row(Table::Reactions, ChangeKind::Removed, &channel_id, &reaction);

        Ok(())
    }

    async fn channel_of(&self, message_id: &str) -> DbResult<String> {
        sqlx::query_scalar::<_, String>("SELECT channel_id FROM messages WHERE id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("Message", message_id))
    }
}
