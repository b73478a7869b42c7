//! # Topic View
//!
//! The ordered, id-deduplicated message sequence for one channel.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           TopicView                                     │
//! │                                                                         │
//! │  entries: BTreeMap<(created_at, id), Message>   ← iteration order      │
//! │  index:   HashMap<id, created_at>               ← id → position key    │
//! │                                                                         │
//! │  upsert(m)                                                              │
//! │    ├── fails filter / is_deleted ──► remove(m.id)                      │
//! │    ├── id known, same created_at ──► replace in place                  │
//! │    ├── id known, created_at moved ─► re-key (order invariant holds)    │
//! │    └── id unknown ─────────────────► insert at (created_at, id)        │
//! │                                                                         │
//! │  remove(id) ──► evict if present, no-op otherwise                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//! - No two entries share an id.
//! - Iteration is ascending by `(created_at, id)`.
//! - No entry has `is_deleted = true`. Tombstones are evicted, never stored.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::types::{Message, MessageFilter};

/// Effect of applying a record to a [`TopicView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    /// A new id entered the view.
    Inserted(String),
    /// An existing entry was replaced.
    Replaced(String),
    /// An entry left the view.
    Removed(String),
    /// Nothing changed.
    Unchanged,
}

impl ViewChange {
    /// Returns true if the view was modified.
    pub fn is_change(&self) -> bool {
        !matches!(self, ViewChange::Unchanged)
    }
}

/// Ordered message view for a single channel.
#[derive(Debug, Clone)]
pub struct TopicView {
    channel_id: String,
    filter: MessageFilter,
    entries: BTreeMap<(DateTime<Utc>, String), Message>,
    index: HashMap<String, DateTime<Utc>>,
}

impl TopicView {
    /// Creates an empty view for a channel.
    pub fn new(channel_id: impl Into<String>, filter: MessageFilter) -> Self {
        TopicView {
            channel_id: channel_id.into(),
            filter,
            entries: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn filter(&self) -> MessageFilter {
        self.filter
    }

    /// Inserts or replaces a message by id.
    ///
    /// Records for another channel are ignored. Tombstones and records that
    /// fail the view filter evict any entry with the same id. Tombstones are
    /// evicted even when the filter includes deleted rows.
    pub fn upsert(&mut self, message: Message) -> ViewChange {
        if message.channel_id != self.channel_id {
            return ViewChange::Unchanged;
        }

        if message.is_deleted || !self.filter.matches(&message) {
            return self.remove(&message.id);
        }

        match self.index.get(&message.id).copied() {
            Some(created_at) => {
                if created_at != message.created_at {
                    self.entries.remove(&(created_at, message.id.clone()));
                    self.index.insert(message.id.clone(), message.created_at);
                }
                let id = message.id.clone();
                self.entries.insert(message.order_key(), message);
                ViewChange::Replaced(id)
            }
            None => {
                let id = message.id.clone();
                self.index.insert(id.clone(), message.created_at);
                self.entries.insert(message.order_key(), message);
                ViewChange::Inserted(id)
            }
        }
    }

    /// Removes a message by id.
    pub fn remove(&mut self, id: &str) -> ViewChange {
        match self.index.remove(id) {
            Some(created_at) => {
                self.entries.remove(&(created_at, id.to_string()));
                ViewChange::Removed(id.to_string())
            }
            None => ViewChange::Unchanged,
        }
    }

    /// Replaces the whole contents with a fresh snapshot.
    pub fn replace_all(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.entries.clear();
        self.index.clear();
        for message in messages {
            self.upsert(message);
        }
    }

    /// Returns the message with the given id.
    pub fn get(&self, id: &str) -> Option<&Message> {
        let created_at = self.index.get(id)?;
        self.entries.get(&(*created_at, id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates messages in view order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.values()
    }

    /// Ids in view order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.values().map(|m| m.id.clone()).collect()
    }

    /// Immutable snapshot of the ordered sequence.
    pub fn to_vec(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            channel_id: "general".to_string(),
            sender_id: Some("alice".to_string()),
            content: format!("body {}", id),
            thread_id: None,
            is_edited: false,
            is_deleted: false,
            created_at: at(secs),
            updated_at: at(secs),
        }
    }

    fn view() -> TopicView {
        TopicView::new("general", MessageFilter::top_level())
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut v = view();
        assert_eq!(v.upsert(msg("a", 1)), ViewChange::Inserted("a".into()));
        assert_eq!(v.upsert(msg("a", 1)), ViewChange::Replaced("a".into()));
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let mut v = view();
        v.upsert(msg("five", 5));
        v.upsert(msg("three", 3));
        assert_eq!(v.ids(), vec!["three", "five"]);

        v.upsert(msg("four", 4));
        assert_eq!(v.ids(), vec!["three", "four", "five"]);
    }

    #[test]
    fn test_equal_timestamps_tie_break_on_id() {
        let mut v = view();
        v.upsert(msg("b", 1));
        v.upsert(msg("a", 1));
        assert_eq!(v.ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_tombstone_evicts() {
        let mut v = view();
        v.upsert(msg("a", 1));

        let mut dead = msg("a", 1);
        dead.is_deleted = true;
        assert_eq!(v.upsert(dead.clone()), ViewChange::Removed("a".into()));
        assert!(v.is_empty());

        // A tombstone for an unknown id never enters the view.
        assert_eq!(v.upsert(dead), ViewChange::Unchanged);
        assert!(v.iter().all(|m| !m.is_deleted));
    }

    #[test]
    fn test_tombstone_evicts_even_when_filter_keeps_deleted() {
        let filter = MessageFilter {
            include_deleted: true,
            ..MessageFilter::top_level()
        };
        let mut v = TopicView::new("general", filter);
        v.upsert(msg("a", 1));

        let mut dead = msg("a", 1);
        dead.is_deleted = true;
        assert_eq!(v.upsert(dead.clone()), ViewChange::Removed("a".into()));

        v.replace_all(vec![dead, msg("b", 2)]);
        assert_eq!(v.ids(), vec!["b"]);
    }

    #[test]
    fn test_update_keeps_position_and_rekeys_on_timestamp_change() {
        let mut v = view();
        v.upsert(msg("a", 1));
        v.upsert(msg("b", 2));

        let mut edited = msg("a", 1);
        edited.content = "edited".into();
        edited.is_edited = true;
        v.upsert(edited);
        assert_eq!(v.ids(), vec!["a", "b"]);
        assert_eq!(v.get("a").unwrap().content, "edited");

        v.upsert(msg("a", 3));
        assert_eq!(v.ids(), vec!["b", "a"]);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn test_thread_replies_are_excluded() {
        let mut v = view();
        v.upsert(msg("a", 1));

        let mut reply = msg("a", 1);
        reply.thread_id = Some("root".into());
        assert_eq!(v.upsert(reply), ViewChange::Removed("a".into()));
    }

    #[test]
    fn test_other_channel_is_ignored() {
        let mut v = view();
        let mut other = msg("x", 1);
        other.channel_id = "random".into();
        assert_eq!(v.upsert(other), ViewChange::Unchanged);
        assert!(v.is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut v = view();
        assert_eq!(v.remove("missing"), ViewChange::Unchanged);
    }

    #[test]
    fn test_replace_all() {
        let mut v = view();
        v.upsert(msg("old", 1));
        v.replace_all(vec![msg("n2", 20), msg("n1", 10)]);
        assert_eq!(v.ids(), vec!["n1", "n2"]);
        assert!(!v.contains("old"));
    }
}
