//! # Backend Seams
//!
//! The two interfaces the sync core consumes, and the backends that
//! implement them.
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────────────┐
//! │ SnapshotStore            │        │ EventStream                      │
//! │  fetch_messages          │        │  subscribe(Topic) → Subscription │
//! │  insert/update/delete    │        │                                  │
//! │  reactions, typing rows  │        │  Subscription                    │
//! └────────────┬─────────────┘        │   ├─ mpsc::Receiver<StreamSignal>│
//!              │                      │   └─ SubscriptionHandle::cancel  │
//!              │                      └───────────────┬──────────────────┘
//!              └──────────────┬───────────────────────┘
//!                             ▼
//!             MemoryBackend (tests)   SqliteBackend (huddle-db)
//! ```
//!
//! Delivery is at-least-once with no ordering guarantee. Channels are
//! bounded and producers await capacity rather than drop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use huddle_core::{
    Message, MessageFilter, MessagePatch, NewMessage, NewReaction, Reaction, SortOrder, Table,
    TypingIndicator,
};

use crate::change::ChangeNotification;
use crate::error::SyncResult;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

// =============================================================================
// Topic
// =============================================================================

/// One channel-scoped table a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub channel_id: String,
    pub table: Table,
}

impl Topic {
    pub fn new(channel_id: impl Into<String>, table: Table) -> Self {
        Topic {
            channel_id: channel_id.into(),
            table,
        }
    }

    pub fn messages(channel_id: impl Into<String>) -> Self {
        Self::new(channel_id, Table::Messages)
    }

    pub fn reactions(channel_id: impl Into<String>) -> Self {
        Self::new(channel_id, Table::Reactions)
    }

    pub fn typing(channel_id: impl Into<String>) -> Self {
        Self::new(channel_id, Table::TypingIndicators)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.channel_id)
    }
}

// =============================================================================
// Link State
// =============================================================================

/// Health of one subscription link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Subscribing or fetching.
    Connecting,
    /// Delivering events.
    Connected,
    /// The stream dropped. The view may be stale until a resync.
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// What a subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    Change(ChangeNotification),
    /// The transport dropped. Events may have been missed.
    Disconnected { reason: String },
    /// The transport is back. Missed events are not replayed.
    Reconnected,
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Cancels a subscription. Clones share the same underlying registration.
///
/// `cancel()` runs the backend's unregister hook exactly once, synchronously.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    cancelled: AtomicBool,
    on_cancel: Mutex<Option<CancelFn>>,
}

impl SubscriptionHandle {
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        SubscriptionHandle {
            inner: Arc::new(HandleInner {
                cancelled: AtomicBool::new(false),
                on_cancel: Mutex::new(Some(Box::new(on_cancel))),
            }),
        }
    }

    /// Unregisters the subscription. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self
            .inner
            .on_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A live subscription to one topic.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    receiver: mpsc::Receiver<StreamSignal>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(
        topic: Topic,
        receiver: mpsc::Receiver<StreamSignal>,
        handle: SubscriptionHandle,
    ) -> Self {
        Subscription {
            topic,
            receiver,
            handle,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Waits for the next signal. `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<StreamSignal> {
        self.receiver.recv().await
    }

    /// Splits into the receiver (for a pump task) and the cancel handle.
    pub fn into_parts(self) -> (mpsc::Receiver<StreamSignal>, SubscriptionHandle) {
        (self.receiver, self.handle)
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Request/response access to the backing store.
///
/// Rejected writes surface as `SyncError::WriteRejected`; writes against
/// rows that do not exist surface as `SyncError::NotFound`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Up to `limit` messages of a channel matching `filter`.
    async fn fetch_messages(
        &self,
        channel_id: &str,
        filter: &MessageFilter,
        limit: u32,
        order: SortOrder,
    ) -> SyncResult<Vec<Message>>;

    /// Inserts a message. The returned row carries the assigned id.
    async fn insert_message(&self, new: NewMessage) -> SyncResult<Message>;

    async fn update_message(&self, id: &str, patch: MessagePatch) -> SyncResult<()>;

    async fn soft_delete_message(&self, id: &str) -> SyncResult<()>;

    /// Reactions on any of `message_ids`.
    async fn fetch_reactions(&self, message_ids: &[String]) -> SyncResult<Vec<Reaction>>;

    async fn insert_reaction(&self, new: NewReaction) -> SyncResult<Reaction>;

    async fn delete_reaction(&self, id: &str) -> SyncResult<()>;

    /// Creates or refreshes the profile's typing row in a channel.
    async fn upsert_typing(&self, channel_id: &str, profile_id: &str)
        -> SyncResult<TypingIndicator>;

    /// Deletes the profile's typing row. Absent rows are fine.
    async fn clear_typing(&self, channel_id: &str, profile_id: &str) -> SyncResult<()>;
}

/// Push access to row changes.
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn subscribe(&self, topic: &Topic) -> SyncResult<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = SubscriptionHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = handle.clone();

        handle.cancel();
        clone.cancel();
        handle.cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_topic_display() {
        assert_eq!(Topic::messages("general").to_string(), "messages:general");
        assert_eq!(
            Topic::typing("general").table,
            Table::TypingIndicators
        );
    }
}
