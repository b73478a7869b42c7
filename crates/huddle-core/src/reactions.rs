//! # Reactions
//!
//! Reaction rows for one message and their grouped projection.
//!
//! ## Row Identity vs. Triple
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ReactionSet                                    │
//! │                                                                         │
//! │  rows (application order)          label_order (append-only)           │
//! │  ─────────────────────────         ─────────────────────────           │
//! │  r1  alice  👍                      👍                                  │
//! │  r2  bob    👍                      🎉                                  │
//! │  r3  alice  🎉                                                          │
//! │                                                                         │
//! │  Stream events are keyed by row id:                                    │
//! │    insert r4 (bob, 👍)  → replaces r2 (same pair, stale row id)        │
//! │    delete r1            → removes exactly r1                           │
//! │                                                                         │
//! │  grouped():                                                             │
//! │    [ 👍 {count: 2, [alice, bob]}, 🎉 {count: 1, [alice]} ]              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Labels keep the position of their first occurrence even after their
//! count drops to zero, so the grouped view does not reorder when a
//! reaction is removed and re-added.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::Reaction;

// =============================================================================
// Grouped Projection
// =============================================================================

/// All actors that reacted to a message with one emoji.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub profile_ids: Vec<String>,
}

/// Grouped reactions for one message, in first-occurrence label order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct GroupedReactions(Vec<ReactionGroup>);

impl GroupedReactions {
    /// Returns the group for an emoji, if anyone reacted with it.
    pub fn get(&self, emoji: &str) -> Option<&ReactionGroup> {
        self.0.iter().find(|g| g.emoji == emoji)
    }

    /// Count for an emoji (0 when absent).
    pub fn count(&self, emoji: &str) -> usize {
        self.get(emoji).map(|g| g.count).unwrap_or(0)
    }

    /// Returns true if the actor reacted with the emoji.
    pub fn has_reacted(&self, emoji: &str, profile_id: &str) -> bool {
        self.get(emoji)
            .map(|g| g.profile_ids.iter().any(|p| p == profile_id))
            .unwrap_or(false)
    }

    pub fn labels(&self) -> Vec<&str> {
        self.0.iter().map(|g| g.emoji.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReactionGroup> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Reaction Set
// =============================================================================

/// Reaction rows attached to a single message.
#[derive(Debug, Clone, Default)]
pub struct ReactionSet {
    rows: Vec<Reaction>,
    label_order: Vec<String>,
}

impl ReactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the row for an (actor, emoji) pair.
    pub fn find(&self, profile_id: &str, emoji: &str) -> Option<&Reaction> {
        self.rows.iter().find(|r| r.is_same_pair(profile_id, emoji))
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.rows.iter().any(|r| r.id == id)
    }

    /// Applies an inserted row.
    ///
    /// A row with the same id is replaced in place. A row carrying the same
    /// pair under a different id is superseded.
    pub fn apply_insert(&mut self, row: Reaction) {
        self.note_label(&row.emoji);

        if let Some(existing) = self.rows.iter_mut().find(|r| r.id == row.id) {
            *existing = row;
            return;
        }

        self.rows
            .retain(|r| !r.is_same_pair(&row.profile_id, &row.emoji));
        self.rows.push(row);
    }

    /// Removes exactly the row with this id.
    pub fn apply_delete(&mut self, id: &str) -> Option<Reaction> {
        let pos = self.rows.iter().position(|r| r.id == id)?;
        Some(self.rows.remove(pos))
    }

    /// Removes the row for an (actor, emoji) pair.
    pub fn remove_pair(&mut self, profile_id: &str, emoji: &str) -> Option<Reaction> {
        let pos = self
            .rows
            .iter()
            .position(|r| r.is_same_pair(profile_id, emoji))?;
        Some(self.rows.remove(pos))
    }

    /// Recomputes the grouped projection.
    pub fn grouped(&self) -> GroupedReactions {
        let groups = self
            .label_order
            .iter()
            .filter_map(|label| {
                let profile_ids: Vec<String> = self
                    .rows
                    .iter()
                    .filter(|r| &r.emoji == label)
                    .map(|r| r.profile_id.clone())
                    .collect();

                if profile_ids.is_empty() {
                    None
                } else {
                    Some(ReactionGroup {
                        emoji: label.clone(),
                        count: profile_ids.len(),
                        profile_ids,
                    })
                }
            })
            .collect();

        GroupedReactions(groups)
    }

    pub fn rows(&self) -> &[Reaction] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn note_label(&mut self, emoji: &str) {
        if !self.label_order.iter().any(|l| l == emoji) {
            self.label_order.push(emoji.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(id: &str, profile: &str, emoji: &str) -> Reaction {
        Reaction {
            id: id.to_string(),
            message_id: "m1".to_string(),
            profile_id: profile.to_string(),
            emoji: emoji.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_grouping_counts_and_actor_order() {
        let mut set = ReactionSet::new();
        set.apply_insert(row("r1", "alice", "👍"));
        set.apply_insert(row("r2", "bob", "👍"));
        set.apply_insert(row("r3", "alice", "🎉"));

        let grouped = set.grouped();
        assert_eq!(grouped.labels(), vec!["👍", "🎉"]);
        let thumbs = grouped.get("👍").unwrap();
        assert_eq!(thumbs.count, 2);
        assert_eq!(thumbs.profile_ids, vec!["alice", "bob"]);
    }

    #[test]
    fn test_label_order_is_stable() {
        let mut set = ReactionSet::new();
        set.apply_insert(row("r1", "alice", "👍"));
        set.apply_insert(row("r2", "alice", "🎉"));

        set.apply_delete("r1");
        assert_eq!(set.grouped().labels(), vec!["🎉"]);

        set.apply_insert(row("r3", "bob", "👍"));
        assert_eq!(set.grouped().labels(), vec!["👍", "🎉"]);
    }

    #[test]
    fn test_delete_is_keyed_by_row_id() {
        let mut set = ReactionSet::new();
        set.apply_insert(row("r1", "alice", "👍"));

        assert!(set.apply_delete("unknown").is_none());
        assert_eq!(set.len(), 1);

        assert!(set.apply_delete("r1").is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn test_same_pair_new_id_supersedes() {
        let mut set = ReactionSet::new();
        set.apply_insert(row("r1", "alice", "👍"));
        set.apply_insert(row("r9", "alice", "👍"));

        assert_eq!(set.len(), 1);
        assert_eq!(set.find("alice", "👍").unwrap().id, "r9");

        // Late delete of the stale row leaves the live one alone.
        assert!(set.apply_delete("r1").is_none());
        assert_eq!(set.grouped().count("👍"), 1);
    }

    #[test]
    fn test_duplicate_insert_is_idempotent() {
        let mut set = ReactionSet::new();
        set.apply_insert(row("r1", "alice", "👍"));
        set.apply_insert(row("r1", "alice", "👍"));
        assert_eq!(set.grouped().count("👍"), 1);
    }

    #[test]
    fn test_has_reacted() {
        let mut set = ReactionSet::new();
        set.apply_insert(row("r1", "alice", "👍"));
        let grouped = set.grouped();
        assert!(grouped.has_reacted("👍", "alice"));
        assert!(!grouped.has_reacted("👍", "bob"));
        assert!(!grouped.has_reacted("🎉", "alice"));
    }
}
