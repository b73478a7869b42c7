//! # In-Memory Backend
//!
//! A complete `SnapshotStore` + `EventStream` over in-process maps. Every
//! write publishes a notification to the matching topic's subscribers.
//!
//! Besides serving tests and offline demos it can misbehave on request:
//! reject writes, fail fetches or subscribes, drop and restore a channel's
//! links, and inject raw notifications (duplicates, stale updates, garbage).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use huddle_core::{
    Message, MessageFilter, MessagePatch, NewMessage, NewReaction, Reaction, SortOrder, Table,
    TypingIndicator,
};

use super::{EventStream, SnapshotStore, StreamSignal, Subscription, SubscriptionHandle, Topic};
use crate::change::ChangeNotification;
use crate::error::{SyncError, SyncResult};

const DEFAULT_BUFFER: usize = 256;

/// In-process backend. Clones share the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

struct Inner {
    tables: Mutex<Tables>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    buffer: usize,
    reject_writes: AtomicBool,
    fail_fetch: AtomicBool,
    fail_subscribe: AtomicBool,
}

struct Subscriber {
    topic: Topic,
    tx: mpsc::Sender<StreamSignal>,
}

#[derive(Default)]
struct Tables {
    messages: HashMap<String, Message>,
    reactions: HashMap<String, Reaction>,
    typing: HashMap<(String, String), TypingIndicator>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Wall clock, bumped so that successive writes never share a timestamp.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn channel_of(&self, message_id: &str) -> Option<String> {
        self.messages.get(message_id).map(|m| m.channel_id.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// Backend whose subscriptions buffer at most `buffer` signals.
    pub fn with_buffer(buffer: usize) -> Self {
        MemoryBackend {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                buffer: buffer.max(1),
                reject_writes: AtomicBool::new(false),
                fail_fetch: AtomicBool::new(false),
                fail_subscribe: AtomicBool::new(false),
            }),
        }
    }

    // =========================================================================
    // Fault controls
    // =========================================================================

    /// Makes every write fail with `WriteRejected`.
    pub fn set_reject_writes(&self, reject: bool) {
        self.inner.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Makes snapshot fetches fail with `FetchFailed`.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.inner.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Makes subscribes fail with `SubscribeFailed`.
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Signals `Disconnected` on every link of a channel.
    pub async fn disconnect(&self, channel_id: &str) {
        let signal = StreamSignal::Disconnected {
            reason: "connection dropped".into(),
        };
        self.signal_channel(channel_id, None, signal).await;
    }

    /// Signals `Reconnected` on every link of a channel.
    pub async fn reconnect(&self, channel_id: &str) {
        self.signal_channel(channel_id, None, StreamSignal::Reconnected)
            .await;
    }

    /// Delivers a raw signal to one topic without touching any data.
    pub async fn inject(&self, topic: &Topic, signal: StreamSignal) {
        self.signal_channel(&topic.channel_id, Some(topic.table), signal)
            .await;
    }

    /// Live subscriptions on a channel, across all tables.
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        lock(&self.inner.subscribers)
            .values()
            .filter(|s| s.topic.channel_id == channel_id)
            .count()
    }

    // =========================================================================
    // Direct data access
    // =========================================================================

    /// Stores a message as-is, without notifying anyone.
    pub fn seed_message(&self, message: Message) {
        lock(&self.inner.tables)
            .messages
            .insert(message.id.clone(), message);
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        lock(&self.inner.tables).messages.get(id).cloned()
    }

    pub fn typing_rows(&self, channel_id: &str) -> Vec<TypingIndicator> {
        lock(&self.inner.tables)
            .typing
            .values()
            .filter(|row| row.channel_id == channel_id)
            .cloned()
            .collect()
    }

    pub fn reaction_rows(&self, message_id: &str) -> Vec<Reaction> {
        lock(&self.inner.tables)
            .reactions
            .values()
            .filter(|row| row.message_id == message_id)
            .cloned()
            .collect()
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn check_writable(&self, operation: &str) -> SyncResult<()> {
        if self.inner.reject_writes.load(Ordering::SeqCst) {
            return Err(SyncError::rejected(operation, "backend refused the write"));
        }
        Ok(())
    }

    async fn publish(&self, channel_id: &str, notification: ChangeNotification) {
        let table = notification.table;
        self.signal_channel(channel_id, Some(table), StreamSignal::Change(notification))
            .await;
    }

    async fn signal_channel(&self, channel_id: &str, table: Option<Table>, signal: StreamSignal) {
        let targets: Vec<mpsc::Sender<StreamSignal>> = lock(&self.inner.subscribers)
            .values()
            .filter(|s| {
                s.topic.channel_id == channel_id && table.map_or(true, |t| s.topic.table == t)
            })
            .map(|s| s.tx.clone())
            .collect();

        for tx in targets {
            // A closed receiver means the subscriber went away mid-delivery.
            let _ = tx.send(signal.clone()).await;
        }
    }
}

#[async_trait]
impl SnapshotStore for MemoryBackend {
    async fn fetch_messages(
        &self,
        channel_id: &str,
        filter: &MessageFilter,
        limit: u32,
        order: SortOrder,
    ) -> SyncResult<Vec<Message>> {
        if self.inner.fail_fetch.load(Ordering::SeqCst) {
            return Err(SyncError::FetchFailed("backend unavailable".into()));
        }

        let mut rows: Vec<Message> = lock(&self.inner.tables)
            .messages
            .values()
            .filter(|m| m.channel_id == channel_id && filter.matches(m))
            .cloned()
            .collect();

        rows.sort_by_key(|m| std::cmp::Reverse(m.order_key()));
        rows.truncate(limit as usize);
        if order == SortOrder::Ascending {
            rows.reverse();
        }

        Ok(rows)
    }

    async fn insert_message(&self, new: NewMessage) -> SyncResult<Message> {
        self.check_writable("insert_message")?;
        if new.content.trim().is_empty() {
            return Err(SyncError::rejected("insert_message", "content is empty"));
        }

        let message = {
            let mut tables = lock(&self.inner.tables);
            let now = tables.next_timestamp();
            let message = Message {
                id: Uuid::new_v4().to_string(),
                channel_id: new.channel_id,
                sender_id: new.sender_id,
                content: new.content,
                thread_id: new.thread_id,
                is_edited: false,
                is_deleted: false,
                created_at: now,
                updated_at: now,
            };
            tables.messages.insert(message.id.clone(), message.clone());
            message
        };

        debug!(id = %message.id, channel_id = %message.channel_id, "Inserted message");
        let notification = ChangeNotification::inserted(Table::Messages, &message)?;
        self.publish(&message.channel_id, notification).await;

        Ok(message)
    }

    async fn update_message(&self, id: &str, patch: MessagePatch) -> SyncResult<()> {
        self.check_writable("update_message")?;

        let message = {
            let mut tables = lock(&self.inner.tables);
            let now = tables.next_timestamp();
            let message = tables
                .messages
                .get_mut(id)
                .ok_or_else(|| SyncError::not_found("Message", id))?;
            patch.apply_to(message, now);
            message.clone()
        };

        let notification = ChangeNotification::updated(Table::Messages, &message)?;
        self.publish(&message.channel_id, notification).await;

        Ok(())
    }

    async fn soft_delete_message(&self, id: &str) -> SyncResult<()> {
        self.update_message(id, MessagePatch::soft_delete()).await
    }

    async fn fetch_reactions(&self, message_ids: &[String]) -> SyncResult<Vec<Reaction>> {
        if self.inner.fail_fetch.load(Ordering::SeqCst) {
            return Err(SyncError::FetchFailed("backend unavailable".into()));
        }

        let wanted: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let mut rows: Vec<Reaction> = lock(&self.inner.tables)
            .reactions
            .values()
            .filter(|r| wanted.contains(r.message_id.as_str()))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        Ok(rows)
    }

    async fn insert_reaction(&self, new: NewReaction) -> SyncResult<Reaction> {
        self.check_writable("insert_reaction")?;

        let (channel_id, reaction) = {
            let mut tables = lock(&self.inner.tables);
            let channel_id = tables
                .channel_of(&new.message_id)
                .ok_or_else(|| SyncError::not_found("Message", &new.message_id))?;

            let duplicate = tables.reactions.values().any(|r| {
                r.message_id == new.message_id && r.is_same_pair(&new.profile_id, &new.emoji)
            });
            if duplicate {
                return Err(SyncError::rejected("insert_reaction", "reaction already exists"));
            }

            let reaction = Reaction {
                id: Uuid::new_v4().to_string(),
                message_id: new.message_id,
                profile_id: new.profile_id,
                emoji: new.emoji,
                created_at: tables.next_timestamp(),
            };
            tables
                .reactions
                .insert(reaction.id.clone(), reaction.clone());
            (channel_id, reaction)
        };

        let notification = ChangeNotification::inserted(Table::Reactions, &reaction)?;
        self.publish(&channel_id, notification).await;

        Ok(reaction)
    }

    async fn delete_reaction(&self, id: &str) -> SyncResult<()> {
        self.check_writable("delete_reaction")?;

        let (channel_id, reaction) = {
            let mut tables = lock(&self.inner.tables);
            let reaction = tables
                .reactions
                .remove(id)
                .ok_or_else(|| SyncError::not_found("Reaction", id))?;
            (tables.channel_of(&reaction.message_id), reaction)
        };

        if let Some(channel_id) = channel_id {
            let notification = ChangeNotification::removed(Table::Reactions, &reaction)?;
            self.publish(&channel_id, notification).await;
        }

        Ok(())
    }

    async fn upsert_typing(
        &self,
        channel_id: &str,
        profile_id: &str,
    ) -> SyncResult<TypingIndicator> {
        self.check_writable("upsert_typing")?;

        let (row, refreshed) = {
            let mut tables = lock(&self.inner.tables);
            let now = tables.next_timestamp();
            let key = (channel_id.to_string(), profile_id.to_string());
            match tables.typing.get_mut(&key) {
                Some(row) => {
                    row.started_at = now;
                    (row.clone(), true)
                }
                None => {
                    let row = TypingIndicator {
                        id: Uuid::new_v4().to_string(),
                        channel_id: channel_id.to_string(),
                        profile_id: profile_id.to_string(),
                        started_at: now,
                    };
                    tables.typing.insert(key, row.clone());
                    (row, false)
                }
            }
        };

        let notification = if refreshed {
            ChangeNotification::updated(Table::TypingIndicators, &row)?
        } else {
            ChangeNotification::inserted(Table::TypingIndicators, &row)?
        };
        self.publish(channel_id, notification).await;

        Ok(row)
    }

    async fn clear_typing(&self, channel_id: &str, profile_id: &str) -> SyncResult<()> {
        self.check_writable("clear_typing")?;

        let removed = lock(&self.inner.tables)
            .typing
            .remove(&(channel_id.to_string(), profile_id.to_string()));

        if let Some(row) = removed {
            let notification = ChangeNotification::removed(Table::TypingIndicators, &row)?;
            self.publish(channel_id, notification).await;
        }

        Ok(())
    }
}

#[async_trait]
impl EventStream for MemoryBackend {
    async fn subscribe(&self, topic: &Topic) -> SyncResult<Subscription> {
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(SyncError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "backend unavailable".into(),
            });
        }

        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscribers).insert(
            id,
            Subscriber {
                topic: topic.clone(),
                tx,
            },
        );
        debug!(topic = %topic, subscriber = id, "Subscribed");

        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = SubscriptionHandle::new(move || {
            if let Some(inner) = registry.upgrade() {
                lock(&inner.subscribers).remove(&id);
            }
        });

        Ok(Subscription::new(topic.clone(), rx, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeEvent;
    use huddle_core::ChangeKind;

    #[tokio::test]
    async fn test_fetch_newest_first_with_limit() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend
                .insert_message(NewMessage::new("general", None, format!("m{i}")))
                .await
                .unwrap();
        }

        let desc = backend
            .fetch_messages("general", &MessageFilter::top_level(), 3, SortOrder::Descending)
            .await
            .unwrap();
        let bodies: Vec<_> = desc.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(bodies, vec!["m4", "m3", "m2"]);

        let asc = backend
            .fetch_messages("general", &MessageFilter::top_level(), 3, SortOrder::Ascending)
            .await
            .unwrap();
        let bodies: Vec<_> = asc.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(bodies, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_writes_publish_to_matching_topic() {
        let backend = MemoryBackend::new();
        let mut general = backend.subscribe(&Topic::messages("general")).await.unwrap();
        let mut random = backend.subscribe(&Topic::messages("random")).await.unwrap();

        let msg = backend
            .insert_message(NewMessage::new("general", None, "hi"))
            .await
            .unwrap();
        backend
            .update_message(&msg.id, MessagePatch::edit("hi!"))
            .await
            .unwrap();

        let Some(StreamSignal::Change(first)) = general.recv().await else {
            panic!("expected change");
        };
        assert_eq!(first.kind, ChangeKind::Inserted);
        let Some(StreamSignal::Change(second)) = general.recv().await else {
            panic!("expected change");
        };
        match second.decode::<Message>().unwrap() {
            ChangeEvent::Updated(m) => assert!(m.is_edited),
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(random.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_unregisters() {
        let backend = MemoryBackend::new();
        let sub = backend.subscribe(&Topic::messages("general")).await.unwrap();
        assert_eq!(backend.subscriber_count("general"), 1);

        sub.handle().cancel();
        assert_eq!(backend.subscriber_count("general"), 0);
    }

    #[tokio::test]
    async fn test_reaction_rules() {
        let backend = MemoryBackend::new();
        let msg = backend
            .insert_message(NewMessage::new("general", None, "hi"))
            .await
            .unwrap();

        let new = NewReaction::new(&msg.id, "alice", "👍");
        let row = backend.insert_reaction(new.clone()).await.unwrap();
        let dup = backend.insert_reaction(new).await.unwrap_err();
        assert!(matches!(dup, SyncError::WriteRejected { .. }));

        backend.delete_reaction(&row.id).await.unwrap();
        let gone = backend.delete_reaction(&row.id).await.unwrap_err();
        assert!(gone.is_benign());

        let orphan = backend
            .insert_reaction(NewReaction::new("ghost", "alice", "👍"))
            .await
            .unwrap_err();
        assert!(orphan.is_benign());
    }

    #[tokio::test]
    async fn test_typing_upsert_then_clear() {
        let backend = MemoryBackend::new();
        let a = backend.upsert_typing("general", "bob").await.unwrap();
        let b = backend.upsert_typing("general", "bob").await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(b.started_at > a.started_at);
        assert_eq!(backend.typing_rows("general").len(), 1);

        backend.clear_typing("general", "bob").await.unwrap();
        backend.clear_typing("general", "bob").await.unwrap();
        assert!(backend.typing_rows("general").is_empty());
    }

    #[tokio::test]
    async fn test_fault_controls() {
        let backend = MemoryBackend::new();
        backend.set_reject_writes(true);
        let err = backend
            .insert_message(NewMessage::new("general", None, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::WriteRejected { .. }));

        backend.set_fail_fetch(true);
        let err = backend
            .fetch_messages("general", &MessageFilter::top_level(), 10, SortOrder::Descending)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        backend.set_fail_subscribe(true);
        assert!(backend.subscribe(&Topic::messages("general")).await.is_err());
    }
}
