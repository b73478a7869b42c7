//! Helpers shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use huddle_core::{
    Message, MessageFilter, MessagePatch, NewMessage, NewReaction, Reaction, SortOrder, Table,
    TypingIndicator,
};
use tokio::sync::mpsc;

use crate::backend::{
    EventStream, MemoryBackend, SnapshotStore, StreamSignal, Subscription, SubscriptionHandle,
    Topic,
};
use crate::change::ChangeNotification;
use crate::error::SyncResult;

/// Polls `check` until it holds, failing the test after about two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Gives spawned pumps a chance to drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn message(id: &str, channel_id: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        sender_id: Some("bob".to_string()),
        content: format!("message {id}"),
        thread_id: None,
        is_edited: false,
        is_deleted: false,
        created_at: at(secs),
        updated_at: at(secs),
    }
}

pub fn stores(backend: &MemoryBackend) -> (Arc<dyn SnapshotStore>, Arc<dyn EventStream>) {
    (Arc::new(backend.clone()), Arc::new(backend.clone()))
}

pub async fn push_message(backend: &MemoryBackend, kind: &str, message: &Message) {
    let notification = match kind {
        "insert" => ChangeNotification::inserted(Table::Messages, message),
        "update" => ChangeNotification::updated(Table::Messages, message),
        _ => ChangeNotification::removed(Table::Messages, message),
    }
    .unwrap();
    backend
        .inject(
            &Topic::messages(message.channel_id.clone()),
            StreamSignal::Change(notification),
        )
        .await;
}

/// A store where another client undoes every insert before the response
/// comes back: the row is created, then removed, and only then returned.
#[derive(Clone)]
pub struct UndoingStore {
    pub backend: MemoryBackend,
}

#[async_trait]
impl SnapshotStore for UndoingStore {
    async fn fetch_messages(
        &self,
        channel_id: &str,
        filter: &MessageFilter,
        limit: u32,
        order: SortOrder,
    ) -> SyncResult<Vec<Message>> {
        self.backend
            .fetch_messages(channel_id, filter, limit, order)
            .await
    }

    async fn insert_message(&self, new: NewMessage) -> SyncResult<Message> {
        let row = self.backend.insert_message(new).await?;
        self.backend.soft_delete_message(&row.id).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(row)
    }

    async fn update_message(&self, id: &str, patch: MessagePatch) -> SyncResult<()> {
        self.backend.update_message(id, patch).await
    }

    async fn soft_delete_message(&self, id: &str) -> SyncResult<()> {
        self.backend.soft_delete_message(id).await
    }

    async fn fetch_reactions(&self, message_ids: &[String]) -> SyncResult<Vec<Reaction>> {
        self.backend.fetch_reactions(message_ids).await
    }

    async fn insert_reaction(&self, new: NewReaction) -> SyncResult<Reaction> {
        let row = self.backend.insert_reaction(new).await?;
        self.backend.delete_reaction(&row.id).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(row)
    }

    async fn delete_reaction(&self, id: &str) -> SyncResult<()> {
        self.backend.delete_reaction(id).await
    }

    async fn upsert_typing(
        &self,
        channel_id: &str,
        profile_id: &str,
    ) -> SyncResult<TypingIndicator> {
        self.backend.upsert_typing(channel_id, profile_id).await
    }

    async fn clear_typing(&self, channel_id: &str, profile_id: &str) -> SyncResult<()> {
        self.backend.clear_typing(channel_id, profile_id).await
    }
}

/// An event stream that silently loses row changes while `dropping` is set.
/// Link signals always get through.
#[derive(Clone)]
pub struct LossyStream {
    pub backend: MemoryBackend,
    pub dropping: Arc<AtomicBool>,
}

impl LossyStream {
    pub fn new(backend: MemoryBackend) -> Self {
        LossyStream {
            backend,
            dropping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStream for LossyStream {
    async fn subscribe(&self, topic: &Topic) -> SyncResult<Subscription> {
        let (mut upstream, upstream_handle) = self.backend.subscribe(topic).await?.into_parts();
        let (tx, rx) = mpsc::channel(64);
        let dropping = self.dropping.clone();

        let forward = tokio::spawn(async move {
            while let Some(signal) = upstream.recv().await {
                if matches!(signal, StreamSignal::Change(_)) && dropping.load(Ordering::SeqCst) {
                    continue;
                }
                if tx.send(signal).await.is_err() {
                    return;
                }
            }
        });

        let handle = SubscriptionHandle::new(move || {
            upstream_handle.cancel();
            forward.abort();
        });
        Ok(Subscription::new(topic.clone(), rx, handle))
    }
}
