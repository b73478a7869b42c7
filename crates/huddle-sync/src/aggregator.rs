//! # Tag Aggregator
//!
//! Per-message reaction sets for one channel, grouped for display.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tag Aggregator                                   │
//! │                                                                         │
//! │   load(rows)          ─┐                                                │
//! │   reactions stream    ─┼──► message_id → ReactionSet ──► view(id)       │
//! │   toggle(...)         ─┘         (rows keyed by id)      GroupedReactions│
//! │                                                                         │
//! │   toggle(message, profile, emoji):                                     │
//! │     present?  remove locally ──► delete_reaction(row.id)               │
//! │     absent?   insert_reaction ──► apply confirmed row                  │
//! │     failure:  restore local state, surface WriteRejected               │
//! │                                                                         │
//! │   stream insert: add row, replacing same id or same (profile, emoji)   │
//! │   stream delete: remove exactly that row id                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Toggles are serialized so a double click resolves to on-then-off rather
//! than two competing inserts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use huddle_core::validation::validate_emoji;
use huddle_core::{GroupedReactions, NewReaction, Reaction, ReactionSet, Table};

use crate::backend::SnapshotStore;
use crate::change::{ChangeEvent, ChangeNotification, RemovedIds};
use crate::error::{SyncError, SyncResult};

/// Reaction state for the messages of one channel. Clones share state.
#[derive(Clone)]
pub struct TagAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    channel_id: String,
    store: Arc<dyn SnapshotStore>,
    state: Mutex<AggregatorState>,
    toggle_lock: AsyncMutex<()>,
}

#[derive(Default)]
struct AggregatorState {
    sets: HashMap<String, ReactionSet>,
    /// Row ids the stream deleted; a late insert response must not revive them.
    removed: RemovedIds,
    closed: bool,
}

impl AggregatorState {
    fn set_mut(&mut self, message_id: &str) -> &mut ReactionSet {
        self.sets.entry(message_id.to_string()).or_default()
    }

    /// Removes one row from a message's set, dropping the set once empty.
    fn remove_from(&mut self, message_id: &str, id: &str) -> Option<Reaction> {
        let set = self.sets.get_mut(message_id)?;
        let row = set.apply_delete(id);
        if set.is_empty() {
            self.sets.remove(message_id);
        }
        row
    }

    fn delete_row(&mut self, id: &str, hint: Option<&str>) -> Option<Reaction> {
        if let Some(message_id) = hint {
            if let Some(row) = self.remove_from(message_id, id) {
                return Some(row);
            }
        }
        let message_id = self
            .sets
            .iter()
            .find(|(_, set)| set.contains_id(id))
            .map(|(message_id, _)| message_id.clone())?;
        self.remove_from(&message_id, id)
    }
}

impl TagAggregator {
    pub fn new(channel_id: impl Into<String>, store: Arc<dyn SnapshotStore>) -> Self {
        TagAggregator {
            inner: Arc::new(AggregatorInner {
                channel_id: channel_id.into(),
                store,
                state: Mutex::new(AggregatorState::default()),
                toggle_lock: AsyncMutex::new(()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_error(&self) -> SyncError {
        SyncError::SessionClosed(self.inner.channel_id.clone())
    }

    /// Replaces all state with freshly fetched rows.
    pub fn load(&self, rows: Vec<Reaction>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.sets.clear();
        for row in rows {
            let message_id = row.message_id.clone();
            state.set_mut(&message_id).apply_insert(row);
        }
    }

    /// Grouped reactions on a message, in first-seen label order.
    pub fn view(&self, message_id: &str) -> GroupedReactions {
        self.lock()
            .sets
            .get(message_id)
            .map(ReactionSet::grouped)
            .unwrap_or_default()
    }

    /// Messages currently holding at least one reaction.
    pub fn tracked_messages(&self) -> usize {
        self.lock().sets.len()
    }

    /// Drops a message's reactions.
    pub fn forget(&self, message_id: &str) {
        self.lock().sets.remove(message_id);
    }

    /// Flips `profile_id`'s `emoji` on a message.
    ///
    /// ## Returns
    /// * `Ok(true)` - the reaction is now present
    /// * `Ok(false)` - the reaction is now absent (or the message is gone)
    /// * `Err(WriteRejected)` - the store refused; local state is restored
    pub async fn toggle(&self, message_id: &str, profile_id: &str, emoji: &str) -> SyncResult<bool> {
        validate_emoji(emoji)?;
        let _serial = self.inner.toggle_lock.lock().await;

        let existing = {
            let mut state = self.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            let existing = state
                .sets
                .get(message_id)
                .and_then(|set| set.find(profile_id, emoji))
                .cloned();
            if let Some(row) = &existing {
                state.remove_from(message_id, &row.id);
            }
            existing
        };

        match existing {
            Some(row) => match self.inner.store.delete_reaction(&row.id).await {
                Ok(()) => Ok(false),
                Err(e) if e.is_benign() => {
                    debug!(id = %row.id, "Reaction already removed");
                    Ok(false)
                }
                Err(e) => {
                    warn!(message_id = %message_id, emoji = %emoji, error = %e, "Reaction removal failed");
                    let mut state = self.lock();
                    if !state.closed {
                        state.set_mut(message_id).apply_insert(row);
                    }
                    Err(e.into_write_error("toggle_reaction"))
                }
            },
            None => {
                let new = NewReaction::new(message_id, profile_id, emoji);
                match self.inner.store.insert_reaction(new).await {
                    Ok(row) => {
                        let mut state = self.lock();
                        if state.removed.contains(&row.id) {
                            debug!(id = %row.id, "Reaction deleted before insert returned");
                            return Ok(false);
                        }
                        if !state.closed {
                            state.set_mut(message_id).apply_insert(row);
                        }
                        Ok(true)
                    }
                    Err(e) if e.is_benign() => {
                        debug!(message_id = %message_id, "Reaction target is gone");
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(message_id = %message_id, emoji = %emoji, error = %e, "Reaction insert failed");
                        Err(e.into_write_error("toggle_reaction"))
                    }
                }
            }
        }
    }

    /// Applies a reaction change notification.
    ///
    /// Returns false once the aggregator is closed.
    pub fn apply(&self, notification: &ChangeNotification) -> bool {
        if notification.table != Table::Reactions {
            return !self.is_closed();
        }

        let event = match notification.decode::<Reaction>() {
            Ok(event) => event,
            Err(e) => {
                warn!(channel_id = %self.inner.channel_id, error = %e, "Dropping malformed reaction event");
                return !self.is_closed();
            }
        };

        let mut state = self.lock();
        if state.closed {
            return false;
        }
        match event {
            ChangeEvent::Inserted(row) | ChangeEvent::Updated(row) => {
                let message_id = row.message_id.clone();
                state.set_mut(&message_id).apply_insert(row);
            }
            ChangeEvent::Removed { id, old } => {
                let hint = old.as_ref().map(|row| row.message_id.as_str());
                state.delete_row(&id, hint);
                state.removed.record(&id);
            }
        }
        true
    }

    /// Stops accepting changes and drops all state. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.sets.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EventStream, MemoryBackend, StreamSignal, Topic};
    use crate::testing::UndoingStore;
    use huddle_core::{ChangeKind, NewMessage};
    use serde_json::json;

    async fn setup() -> (MemoryBackend, TagAggregator, String) {
        let backend = MemoryBackend::new();
        let msg = backend
            .insert_message(NewMessage::new("general", None, "hi"))
            .await
            .unwrap();
        let aggregator = TagAggregator::new("general", Arc::new(backend.clone()));
        (backend, aggregator, msg.id)
    }

    #[tokio::test]
    async fn test_toggle_is_self_inverse() {
        let (backend, aggregator, id) = setup().await;

        assert!(aggregator.toggle(&id, "alice", "👍").await.unwrap());
        assert!(aggregator.view(&id).has_reacted("👍", "alice"));
        assert_eq!(backend.reaction_rows(&id).len(), 1);

        assert!(!aggregator.toggle(&id, "alice", "👍").await.unwrap());
        assert!(aggregator.view(&id).is_empty());
        assert!(backend.reaction_rows(&id).is_empty());
    }

    #[tokio::test]
    async fn test_toggles_from_two_actors_keep_the_remaining_one() {
        let (_backend, aggregator, id) = setup().await;

        assert!(aggregator.toggle(&id, "alice", "👍").await.unwrap());
        assert!(aggregator.toggle(&id, "bob", "👍").await.unwrap());
        assert!(!aggregator.toggle(&id, "alice", "👍").await.unwrap());

        let view = aggregator.view(&id);
        let group = view.get("👍").unwrap();
        assert_eq!(group.count, 1);
        assert_eq!(group.profile_ids, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_insert_response_does_not_revive_deleted_row() {
        let backend = MemoryBackend::new();
        let msg = backend
            .insert_message(NewMessage::new("general", None, "hi"))
            .await
            .unwrap();
        let aggregator = TagAggregator::new(
            "general",
            Arc::new(UndoingStore {
                backend: backend.clone(),
            }),
        );

        let (mut events, handle) = backend
            .subscribe(&Topic::reactions("general"))
            .await
            .unwrap()
            .into_parts();
        let feed = aggregator.clone();
        tokio::spawn(async move {
            while let Some(StreamSignal::Change(n)) = events.recv().await {
                feed.apply(&n);
            }
        });

        assert!(!aggregator.toggle(&msg.id, "alice", "👍").await.unwrap());
        assert!(aggregator.view(&msg.id).is_empty());
        assert!(backend.reaction_rows(&msg.id).is_empty());
        handle.cancel();
    }

    #[tokio::test]
    async fn test_emptied_sets_are_dropped() {
        let (backend, aggregator, id) = setup().await;
        let row = backend
            .insert_reaction(NewReaction::new(&id, "alice", "👍"))
            .await
            .unwrap();

        aggregator.apply(&ChangeNotification::inserted(Table::Reactions, &row).unwrap());
        assert_eq!(aggregator.tracked_messages(), 1);

        let id_only = ChangeNotification {
            table: Table::Reactions,
            kind: ChangeKind::Removed,
            record: None,
            old_record: Some(json!({ "id": row.id })),
        };
        aggregator.apply(&id_only);
        assert_eq!(aggregator.tracked_messages(), 0);

        aggregator.toggle(&id, "bob", "👀").await.unwrap();
        aggregator.toggle(&id, "bob", "👀").await.unwrap();
        assert_eq!(aggregator.tracked_messages(), 0);
    }

    #[tokio::test]
    async fn test_double_click_does_not_double_insert() {
        let (backend, aggregator, id) = setup().await;

        let (a, b) = tokio::join!(
            aggregator.toggle(&id, "alice", "🎉"),
            aggregator.toggle(&id, "alice", "🎉")
        );
        assert_ne!(a.unwrap(), b.unwrap());
        assert!(backend.reaction_rows(&id).is_empty());
        assert!(aggregator.view(&id).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_toggle_restores_state() {
        let (backend, aggregator, id) = setup().await;
        aggregator.toggle(&id, "alice", "👍").await.unwrap();

        backend.set_reject_writes(true);
        let err = aggregator.toggle(&id, "alice", "👍").await.unwrap_err();
        assert!(matches!(err, SyncError::WriteRejected { .. }));
        assert!(aggregator.view(&id).has_reacted("👍", "alice"));

        let err = aggregator.toggle(&id, "bob", "👀").await.unwrap_err();
        assert!(matches!(err, SyncError::WriteRejected { .. }));
        assert_eq!(aggregator.view(&id).count("👀"), 0);
    }

    #[tokio::test]
    async fn test_toggle_on_missing_message_is_noop() {
        let (_backend, aggregator, _id) = setup().await;
        assert!(!aggregator.toggle("ghost", "alice", "👍").await.unwrap());
        assert!(aggregator.view("ghost").is_empty());
    }

    #[tokio::test]
    async fn test_stream_insert_then_delete_by_id() {
        let (backend, aggregator, id) = setup().await;
        let mut sub = backend.subscribe(&Topic::reactions("general")).await.unwrap();

        let a = backend
            .insert_reaction(NewReaction::new(&id, "alice", "👍"))
            .await
            .unwrap();
        backend
            .insert_reaction(NewReaction::new(&id, "bob", "👍"))
            .await
            .unwrap();
        backend.delete_reaction(&a.id).await.unwrap();

        for _ in 0..3 {
            let Some(StreamSignal::Change(n)) = sub.recv().await else {
                panic!("expected change");
            };
            assert!(aggregator.apply(&n));
        }

        let view = aggregator.view(&id);
        let group = view.get("👍").unwrap();
        assert_eq!(group.count, 1);
        assert_eq!(group.profile_ids, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_with_id_only_payload() {
        let (backend, aggregator, id) = setup().await;
        let row = backend
            .insert_reaction(NewReaction::new(&id, "alice", "👍"))
            .await
            .unwrap();
        aggregator.load(vec![row.clone()]);

        let n = ChangeNotification {
            table: Table::Reactions,
            kind: ChangeKind::Removed,
            record: None,
            old_record: Some(json!({ "id": row.id })),
        };
        assert!(aggregator.apply(&n));
        assert!(aggregator.view(&id).is_empty());
    }

    #[tokio::test]
    async fn test_stale_row_for_same_pair_is_replaced() {
        let (backend, aggregator, id) = setup().await;
        let first = backend
            .insert_reaction(NewReaction::new(&id, "alice", "👍"))
            .await
            .unwrap();
        aggregator.load(vec![first.clone()]);

        let mut replacement = first.clone();
        replacement.id = "fresh".into();
        let n = ChangeNotification::inserted(Table::Reactions, &replacement).unwrap();
        aggregator.apply(&n);

        let view = aggregator.view(&id);
        assert_eq!(view.count("👍"), 1);
    }

    #[tokio::test]
    async fn test_closed_aggregator_ignores_events() {
        let (backend, aggregator, id) = setup().await;
        aggregator.close();

        let row = backend
            .insert_reaction(NewReaction::new(&id, "alice", "👍"))
            .await
            .unwrap();
        let n = ChangeNotification::inserted(Table::Reactions, &row).unwrap();
        assert!(!aggregator.apply(&n));
        assert!(aggregator.view(&id).is_empty());
        assert!(aggregator.toggle(&id, "alice", "👍").await.is_err());
        assert!(aggregator.is_closed());
    }

    #[tokio::test]
    async fn test_forget_drops_message() {
        let (backend, aggregator, id) = setup().await;
        aggregator.toggle(&id, "alice", "👍").await.unwrap();
        aggregator.forget(&id);
        assert!(aggregator.view(&id).is_empty());
        assert_eq!(backend.reaction_rows(&id).len(), 1);
    }
}
