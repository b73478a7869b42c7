//! # SQLite Backend
//!
//! Adapts `huddle-db` to the backend traits.
//!
//! ```text
//!   repositories ──publish──► ChangeFeed (broadcast)
//!                                  │
//!                 ┌────────────────┼────────────────┐
//!                 ▼                ▼                ▼
//!            forwarder        forwarder        forwarder     one task per
//!          messages:general reactions:general  typing:…      subscription
//!                 │ filter by table + channel
//!                 ▼
//!          mpsc::Sender<StreamSignal> ──► Subscription
//! ```
//!
//! A forwarder that falls behind the broadcast buffer has lost events. It
//! reports `Disconnected` then `Reconnected` so the consumer resyncs.

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use huddle_core::{
    Message, MessageFilter, MessagePatch, NewMessage, NewReaction, Reaction, SortOrder,
    TypingIndicator,
};
use huddle_db::{Database, DbError, RowChange};

use super::{EventStream, SnapshotStore, StreamSignal, Subscription, SubscriptionHandle, Topic};
use crate::error::{SyncError, SyncResult};

const DEFAULT_BUFFER: usize = 256;

/// Backend over a local SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    db: Database,
    buffer: usize,
}

impl SqliteBackend {
    pub fn new(db: Database) -> Self {
        SqliteBackend {
            db,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Sets the per-subscription delivery buffer.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

/// Maps a repository failure on a write path.
fn write_error(operation: &'static str) -> impl Fn(DbError) -> SyncError {
    move |err| {
        if matches!(err, DbError::NotFound { .. }) || err.is_connectivity() {
            err.into()
        } else {
            SyncError::rejected(operation, err.to_string())
        }
    }
}

fn fetch_error(err: DbError) -> SyncError {
    SyncError::FetchFailed(err.to_string())
}

#[async_trait]
impl SnapshotStore for SqliteBackend {
    async fn fetch_messages(
        &self,
        channel_id: &str,
        filter: &MessageFilter,
        limit: u32,
        order: SortOrder,
    ) -> SyncResult<Vec<Message>> {
        self.db
            .messages()
            .fetch_recent(channel_id, filter, limit, order)
            .await
            .map_err(fetch_error)
    }

    async fn insert_message(&self, new: NewMessage) -> SyncResult<Message> {
        self.db
            .messages()
            .insert(&new)
            .await
            .map_err(write_error("insert_message"))
    }

    async fn update_message(&self, id: &str, patch: MessagePatch) -> SyncResult<()> {
        self.db
            .messages()
            .update(id, &patch)
            .await
            .map(|_| ())
            .map_err(write_error("update_message"))
    }

    async fn soft_delete_message(&self, id: &str) -> SyncResult<()> {
        self.db
            .messages()
            .soft_delete(id)
            .await
            .map(|_| ())
            .map_err(write_error("soft_delete_message"))
    }

    async fn fetch_reactions(&self, message_ids: &[String]) -> SyncResult<Vec<Reaction>> {
        self.db
            .reactions()
            .list_for_messages(message_ids)
            .await
            .map_err(fetch_error)
    }

    async fn insert_reaction(&self, new: NewReaction) -> SyncResult<Reaction> {
        self.db
            .reactions()
            .insert(&new)
            .await
            .map_err(write_error("insert_reaction"))
    }

    async fn delete_reaction(&self, id: &str) -> SyncResult<()> {
        self.db
            .reactions()
            .delete(id)
            .await
            .map_err(write_error("delete_reaction"))
    }

    async fn upsert_typing(
        &self,
        channel_id: &str,
        profile_id: &str,
    ) -> SyncResult<TypingIndicator> {
        self.db
            .typing()
            .upsert(channel_id, profile_id)
            .await
            .map_err(write_error("upsert_typing"))
    }

    async fn clear_typing(&self, channel_id: &str, profile_id: &str) -> SyncResult<()> {
        self.db
            .typing()
            .clear(channel_id, profile_id)
            .await
            .map(|_| ())
            .map_err(write_error("clear_typing"))
    }
}

#[async_trait]
impl EventStream for SqliteBackend {
    async fn subscribe(&self, topic: &Topic) -> SyncResult<Subscription> {
        let feed = self.db.feed().subscribe();
        let (tx, rx) = mpsc::channel(self.buffer);

        let task = tokio::spawn(forward(feed, tx, topic.clone()));
        let handle = SubscriptionHandle::new(move || task.abort());

        debug!(topic = %topic, "Subscribed to change feed");
        Ok(Subscription::new(topic.clone(), rx, handle))
    }
}

/// Relays matching feed entries until the subscriber goes away.
async fn forward(
    mut feed: broadcast::Receiver<RowChange>,
    tx: mpsc::Sender<StreamSignal>,
    topic: Topic,
) {
    loop {
        match feed.recv().await {
            Ok(change) => {
                if change.table != topic.table || change.channel_id != topic.channel_id {
                    continue;
                }
                if tx.send(StreamSignal::Change(change.into())).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(topic = %topic, skipped = skipped, "Change feed lagged");
                let reason = format!("missed {} changes", skipped);
                if tx.send(StreamSignal::Disconnected { reason }).await.is_err() {
                    break;
                }
                if tx.send(StreamSignal::Reconnected).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Closed) => {
                let _ = tx
                    .send(StreamSignal::Disconnected {
                        reason: "change feed closed".into(),
                    })
                    .await;
                break;
            }
        }
    }
    debug!(topic = %topic, "Change feed forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeEvent;
    use huddle_core::Table;
    use huddle_db::DbConfig;

    async fn backend() -> SqliteBackend {
        SqliteBackend::new(Database::new(DbConfig::in_memory()).await.unwrap())
    }

    #[tokio::test]
    async fn test_subscription_filters_by_topic() {
        let backend = backend().await;
        let mut sub = backend.subscribe(&Topic::messages("general")).await.unwrap();

        backend
            .insert_message(NewMessage::new("random", None, "elsewhere"))
            .await
            .unwrap();
        let msg = backend
            .insert_message(NewMessage::new("general", None, "here"))
            .await
            .unwrap();

        let Some(StreamSignal::Change(n)) = sub.recv().await else {
            panic!("expected change");
        };
        assert_eq!(n.table, Table::Messages);
        match n.decode::<Message>().unwrap() {
            ChangeEvent::Inserted(m) => assert_eq!(m.id, msg.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_rows_are_not_found() {
        let backend = backend().await;
        let err = backend
            .update_message("nope", MessagePatch::edit("x"))
            .await
            .unwrap_err();
        assert!(err.is_benign());

        let err = backend.delete_reaction("nope").await.unwrap_err();
        assert!(err.is_benign());
    }

    #[tokio::test]
    async fn test_duplicate_reaction_is_rejected() {
        let backend = backend().await;
        let msg = backend
            .insert_message(NewMessage::new("general", None, "hi"))
            .await
            .unwrap();

        let new = NewReaction::new(&msg.id, "alice", "👍");
        backend.insert_reaction(new.clone()).await.unwrap();
        let err = backend.insert_reaction(new).await.unwrap_err();
        assert!(matches!(err, SyncError::WriteRejected { .. }));
    }

    #[tokio::test]
    async fn test_lag_reports_disconnect_then_reconnect() {
        let db = Database::new(DbConfig::in_memory().feed_capacity(2))
            .await
            .unwrap();
        let backend = SqliteBackend::new(db).with_buffer(1);
        let mut sub = backend.subscribe(&Topic::typing("general")).await.unwrap();

        // The forwarder can buffer one signal; the rest overflow the feed.
        for profile in ["a", "b", "c", "d", "e", "f"] {
            backend.upsert_typing("general", profile).await.unwrap();
        }

        let mut saw_disconnect = false;
        let mut saw_reconnect = false;
        while let Ok(Some(signal)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), sub.recv()).await
        {
            match signal {
                StreamSignal::Disconnected { .. } => saw_disconnect = true,
                StreamSignal::Reconnected => {
                    assert!(saw_disconnect);
                    saw_reconnect = true;
                }
                StreamSignal::Change(_) => {}
            }
        }
        assert!(saw_disconnect && saw_reconnect);
    }

    #[tokio::test]
    async fn test_cancel_stops_forwarding() {
        let backend = backend().await;
        let mut sub = backend.subscribe(&Topic::messages("general")).await.unwrap();
        sub.handle().cancel();

        backend
            .insert_message(NewMessage::new("general", None, "late"))
            .await
            .unwrap();

        let next = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv()).await;
        assert!(matches!(next, Ok(None)));
    }
}
