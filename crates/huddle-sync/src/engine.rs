//! # Reconciliation Engine
//!
//! Maintains the ordered, de-duplicated message view of one channel while
//! local writes and pushed change notifications interleave.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Open / Resync (same path)                           │
//! │                                                                         │
//! │  1. generation += 1, tear down previous subscription + pump             │
//! │  2. subscribe(messages:<channel>)       ← events buffer in the channel  │
//! │  3. fetch newest N (DESC)               ← snapshot                      │
//! │  4. view.replace_all(snapshot)          ← ascending by (created_at, id) │
//! │  5. spawn pump(generation)              ← drains buffered + live events │
//! │                                                                         │
//! │  Subscribing before fetching leaves no gap; merges are idempotent so   │
//! │  events already reflected in the snapshot are harmless.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Event Application
//! | Event                    | In view            | Not in view        |
//! |--------------------------|--------------------|--------------------|
//! | Inserted / Updated       | replace (re-key)   | insert             |
//! | … with `is_deleted`      | evict              | no-op              |
//! | … failing the filter     | evict              | no-op              |
//! | Removed                  | evict              | no-op              |
//!
//! Every mutation happens under the state lock after checking the pump's
//! generation against the current one, so callbacks from a closed or
//! superseded subscription never touch the view.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_core::validation::validate_content;
use huddle_core::{
    Message, MessageFilter, MessagePatch, NewMessage, SortOrder, Table, TopicView, ViewChange,
    PROVISIONAL_ID_PREFIX, SNAPSHOT_LIMIT,
};

use crate::backend::{
    EventStream, LinkState, SnapshotStore, StreamSignal, SubscriptionHandle, Topic,
};
use crate::change::{ChangeEvent, ChangeNotification, RemovedIds};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Observers
// =============================================================================

/// A change to the view, reported after it has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    /// The view was replaced by a fresh snapshot.
    Reset,
    Upserted(String),
    Removed(String),
}

/// Receives view and link changes from an engine.
///
/// Called outside the engine's lock; implementations must not block.
pub trait ViewListener: Send + Sync {
    fn on_view_update(&self, channel_id: &str, update: &ViewUpdate);

    fn on_link_state(&self, channel_id: &str, state: LinkState);
}

/// Listener that ignores everything.
pub struct NoOpListener;

impl ViewListener for NoOpListener {
    fn on_view_update(&self, _channel_id: &str, _update: &ViewUpdate) {}
    fn on_link_state(&self, _channel_id: &str, _state: LinkState) {}
}

/// Result of an edit or remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The store accepted the write; the view follows once the echo arrives.
    Applied,
    /// The target was already gone.
    Skipped,
}

// =============================================================================
// Options
// =============================================================================

/// How an engine builds its view.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub filter: MessageFilter,
    pub snapshot_limit: u32,
    /// Sender recorded on appended messages.
    pub sender_id: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            filter: MessageFilter::top_level(),
            snapshot_limit: SNAPSHOT_LIMIT,
            sender_id: None,
        }
    }
}

impl EngineOptions {
    pub fn sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn snapshot_limit(mut self, limit: u32) -> Self {
        self.snapshot_limit = limit;
        self
    }

    pub fn filter(mut self, filter: MessageFilter) -> Self {
        self.filter = filter;
        self
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Handle to a channel's reconciliation engine. Clones share the view.
#[derive(Clone)]
pub struct ReconciliationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    channel_id: String,
    options: EngineOptions,
    store: Arc<dyn SnapshotStore>,
    stream: Arc<dyn EventStream>,
    listener: Arc<dyn ViewListener>,
    state: Mutex<EngineState>,
    /// Serializes open/resync.
    connect_lock: AsyncMutex<()>,
}

struct EngineState {
    view: TopicView,
    /// Ids the stream evicted; a late append response must not revive them.
    removed: RemovedIds,
    generation: u64,
    closed: bool,
    link: LinkState,
    subscription: Option<SubscriptionHandle>,
    pump: Option<JoinHandle<()>>,
}

impl EngineState {
    fn teardown(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.cancel();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl ReconciliationEngine {
    /// Subscribes to the channel's messages, loads the snapshot and starts
    /// applying events.
    ///
    /// ## Errors
    /// * `SubscribeFailed` / `FetchFailed` - nothing is left running
    pub async fn open(
        channel_id: impl Into<String>,
        options: EngineOptions,
        store: Arc<dyn SnapshotStore>,
        stream: Arc<dyn EventStream>,
        listener: Arc<dyn ViewListener>,
    ) -> SyncResult<Self> {
        let channel_id = channel_id.into();
        let view = TopicView::new(channel_id.clone(), options.filter);

        let engine = ReconciliationEngine {
            inner: Arc::new(EngineInner {
                channel_id,
                options,
                store,
                stream,
                listener,
                state: Mutex::new(EngineState {
                    view,
                    removed: RemovedIds::default(),
                    generation: 0,
                    closed: false,
                    link: LinkState::Connecting,
                    subscription: None,
                    pump: None,
                }),
                connect_lock: AsyncMutex::new(()),
            }),
        };

        engine.connect().await?;

        info!(
            channel_id = %engine.inner.channel_id,
            messages = engine.len(),
            "Engine opened"
        );
        Ok(engine)
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    /// Snapshot of the view in ascending `(created_at, id)` order.
    pub fn view(&self) -> Vec<Message> {
        self.inner.lock_state().view.to_vec()
    }

    /// Ids of confirmed messages in the view.
    pub fn message_ids(&self) -> Vec<String> {
        self.inner
            .lock_state()
            .view
            .iter()
            .filter(|m| !m.is_provisional())
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.inner.lock_state().view.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_state().view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.lock_state().link
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Bumped on every open, resync and close.
    pub fn generation(&self) -> u64 {
        self.inner.lock_state().generation
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Appends a message.
    ///
    /// A provisional entry (`local:<uuid>`) is visible in [`view`](Self::view)
    /// until the store answers. On success it is swapped for the confirmed
    /// message, which is returned; on failure it is rolled back.
    pub async fn append(&self, content: &str) -> SyncResult<Message> {
        let content = validate_content(content)?;
        let inner = &self.inner;

        let new = NewMessage::new(
            inner.channel_id.clone(),
            inner.options.sender_id.clone(),
            content,
        );
        let provisional = Message::provisional(&new, Utc::now());
        let provisional_id = provisional.id.clone();

        let change = {
            let mut state = inner.lock_state();
            if state.closed {
                return Err(inner.closed_error());
            }
            state.view.upsert(provisional)
        };
        inner.notify(change);

        match inner.store.insert_message(new).await {
            Ok(confirmed) => {
                let changes = {
                    let mut state = inner.lock_state();
                    if state.closed {
                        return Ok(confirmed);
                    }
                    let removed = state.view.remove(&provisional_id);
                    // An echo that beat the response is at least as fresh.
                    let upserted = if state.view.contains(&confirmed.id)
                        || state.removed.contains(&confirmed.id)
                    {
                        ViewChange::Unchanged
                    } else {
                        state.view.upsert(confirmed.clone())
                    };
                    [removed, upserted]
                };
                for change in changes {
                    inner.notify(change);
                }

                debug!(
                    channel_id = %inner.channel_id,
                    id = %confirmed.id,
                    provisional_id = %provisional_id,
                    "Append confirmed"
                );
                Ok(confirmed)
            }
            Err(e) => {
                let change = {
                    let mut state = inner.lock_state();
                    if state.closed {
                        ViewChange::Unchanged
                    } else {
                        state.view.remove(&provisional_id)
                    }
                };
                inner.notify(change);

                warn!(channel_id = %inner.channel_id, error = %e, "Append rolled back");
                Err(e.into_write_error("append"))
            }
        }
    }

    /// Replaces a message's content and marks it edited.
    pub async fn edit(&self, id: &str, content: &str) -> SyncResult<WriteOutcome> {
        let content = validate_content(content)?;
        self.ensure_open()?;
        if id.starts_with(PROVISIONAL_ID_PREFIX) {
            return Ok(WriteOutcome::Skipped);
        }

        let result = self
            .inner
            .store
            .update_message(id, MessagePatch::edit(content))
            .await;
        self.outcome("edit", id, result)
    }

    /// Soft-deletes a message.
    pub async fn remove(&self, id: &str) -> SyncResult<WriteOutcome> {
        self.ensure_open()?;
        if id.starts_with(PROVISIONAL_ID_PREFIX) {
            return Ok(WriteOutcome::Skipped);
        }

        let result = self.inner.store.soft_delete_message(id).await;
        self.outcome("remove", id, result)
    }

    fn outcome(
        &self,
        operation: &str,
        id: &str,
        result: SyncResult<()>,
    ) -> SyncResult<WriteOutcome> {
        match result {
            Ok(()) => Ok(WriteOutcome::Applied),
            Err(e) if e.is_benign() => {
                debug!(operation = operation, id = %id, "Write target already gone");
                Ok(WriteOutcome::Skipped)
            }
            Err(e) => {
                warn!(operation = operation, id = %id, error = %e, "Write failed");
                Err(e.into_write_error(operation))
            }
        }
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_closed() {
            return Err(self.inner.closed_error());
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Re-subscribes and replaces the view with a fresh snapshot.
    ///
    /// Late events from the previous subscription are discarded.
    pub async fn resync(&self) -> SyncResult<()> {
        info!(channel_id = %self.inner.channel_id, "Resyncing");
        self.connect().await
    }

    /// Cancels the subscription and stops the pump. Idempotent.
    ///
    /// Once this returns no event mutates the view.
    pub fn close(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.generation += 1;
            state.teardown();
        }
        info!(channel_id = %self.inner.channel_id, "Engine closed");
    }

    async fn connect(&self) -> SyncResult<()> {
        let _serial = self.inner.connect_lock.lock().await;

        let generation = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(self.inner.closed_error());
            }
            state.generation += 1;
            state.teardown();
            state.link = LinkState::Connecting;
            state.generation
        };

        match self.load(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(channel_id = %self.inner.channel_id, error = %e, "Failed to load channel");
                self.inner.set_link(generation, LinkState::Disconnected);
                Err(e)
            }
        }
    }

    async fn load(&self, generation: u64) -> SyncResult<()> {
        let inner = &self.inner;
        let topic = Topic::messages(inner.channel_id.clone());

        let (receiver, handle) = inner.stream.subscribe(&topic).await?.into_parts();

        let snapshot = match inner
            .store
            .fetch_messages(
                &inner.channel_id,
                &inner.options.filter,
                inner.options.snapshot_limit,
                SortOrder::Descending,
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                handle.cancel();
                return Err(e);
            }
        };
        let fetched = snapshot.len();

        {
            let mut state = inner.lock_state();
            if state.closed || state.generation != generation {
                handle.cancel();
                return Err(inner.closed_error());
            }
            state.view.replace_all(snapshot);
            state.link = LinkState::Connected;
            state.subscription = Some(handle);
            state.pump = Some(tokio::spawn(pump(
                Arc::downgrade(&self.inner),
                generation,
                receiver,
            )));
        }

        inner
            .listener
            .on_view_update(&inner.channel_id, &ViewUpdate::Reset);
        inner
            .listener
            .on_link_state(&inner.channel_id, LinkState::Connected);

        debug!(
            channel_id = %inner.channel_id,
            generation = generation,
            fetched = fetched,
            "Snapshot installed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("channel_id", &self.inner.channel_id)
            .field("generation", &self.generation())
            .finish()
    }
}

impl EngineInner {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_error(&self) -> SyncError {
        SyncError::SessionClosed(self.channel_id.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock_state();
        !state.closed && state.generation == generation
    }

    /// Applies one notification. Returns false once the pump is stale.
    fn apply(&self, generation: u64, notification: &ChangeNotification) -> bool {
        if notification.table != Table::Messages {
            debug!(table = %notification.table, "Ignoring foreign table event");
            return self.is_current(generation);
        }

        let event = match notification.decode::<Message>() {
            Ok(event) => event,
            Err(e) => {
                warn!(channel_id = %self.channel_id, error = %e, "Dropping malformed message event");
                return self.is_current(generation);
            }
        };

        let change = {
            let mut state = self.lock_state();
            if state.closed || state.generation != generation {
                return false;
            }
            match event {
                ChangeEvent::Inserted(message) | ChangeEvent::Updated(message) => {
                    if message.channel_id == self.channel_id
                        && (message.is_deleted || !state.view.filter().matches(&message))
                    {
                        state.removed.record(&message.id);
                    }
                    state.view.upsert(message)
                }
                ChangeEvent::Removed { id, .. } => {
                    state.removed.record(&id);
                    state.view.remove(&id)
                }
            }
        };

        self.notify(change);
        true
    }

    /// Records a link change. Returns false once the pump is stale.
    fn set_link(&self, generation: u64, link: LinkState) -> bool {
        {
            let mut state = self.lock_state();
            if state.closed || state.generation != generation {
                return false;
            }
            if state.link == link {
                return true;
            }
            state.link = link;
        }
        self.listener.on_link_state(&self.channel_id, link);
        true
    }

    fn notify(&self, change: ViewChange) {
        let update = match change {
            ViewChange::Inserted(id) | ViewChange::Replaced(id) => ViewUpdate::Upserted(id),
            ViewChange::Removed(id) => ViewUpdate::Removed(id),
            ViewChange::Unchanged => return,
        };
        self.listener.on_view_update(&self.channel_id, &update);
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.closed = true;
        state.teardown();
    }
}

/// Boxed so that the pump and the resync it spawns do not name each
/// other's future types.
type PumpFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Drains one subscription for one generation.
fn pump(
    engine: Weak<EngineInner>,
    generation: u64,
    mut receiver: mpsc::Receiver<StreamSignal>,
) -> PumpFuture {
    Box::pin(async move {
        while let Some(signal) = receiver.recv().await {
            let Some(inner) = engine.upgrade() else {
                return;
            };

            match signal {
                StreamSignal::Change(notification) => {
                    if !inner.apply(generation, &notification) {
                        return;
                    }
                }
                StreamSignal::Disconnected { reason } => {
                    warn!(channel_id = %inner.channel_id, reason = %reason, "Message stream disconnected");
                    if !inner.set_link(generation, LinkState::Disconnected) {
                        return;
                    }
                }
                StreamSignal::Reconnected => {
                    if !inner.is_current(generation) {
                        return;
                    }
                    info!(channel_id = %inner.channel_id, "Message stream reconnected");
                    let engine = ReconciliationEngine { inner };
                    tokio::spawn(async move {
                        if let Err(e) = engine.resync().await {
                            warn!(channel_id = %engine.channel_id(), error = %e, "Automatic resync failed");
                        }
                    });
                    // The resync replaces this pump.
                    return;
                }
            }
        }

        if let Some(inner) = engine.upgrade() {
            if inner.set_link(generation, LinkState::Disconnected) {
                warn!(channel_id = %inner.channel_id, "Message stream ended");
            }
        }
    })
}
