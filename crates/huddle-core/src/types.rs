//! # Domain Types
//!
//! Core domain types used throughout Huddle.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Message      │   │    Reaction     │   │ TypingIndicator │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │   │  id             │   │  id             │       │
//! │  │  channel_id     │   │  message_id(FK) │   │  channel_id     │       │
//! │  │  sender_id?     │   │  profile_id     │   │  profile_id     │       │
//! │  │  content        │   │  emoji          │   │  started_at     │       │
//! │  │  thread_id?     │   └─────────────────┘   └─────────────────┘       │
//! │  │  is_edited      │                                                   │
//! │  │  is_deleted     │   Write payloads: NewMessage, MessagePatch,       │
//! │  │  created_at     │                   NewReaction                     │
//! │  └─────────────────┘   Read filters:   MessageFilter, SortOrder        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Ids are opaque strings assigned by the store. The only ids the client
//! invents are provisional ones (`local:<uuid>`) for optimistic messages, and
//! those never leave the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::PROVISIONAL_ID_PREFIX;

// =============================================================================
// Message
// =============================================================================

/// A chat message in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Message {
    /// Store-assigned identifier.
    pub id: String,

    /// Channel (topic) this message belongs to.
    pub channel_id: String,

    /// Author profile. `None` for system messages or deleted authors.
    #[serde(default)]
    pub sender_id: Option<String>,

    /// Message body.
    pub content: String,

    /// Parent message when this is a thread reply.
    #[serde(default)]
    pub thread_id: Option<String>,

    /// Set once the body has been edited.
    #[serde(default)]
    pub is_edited: bool,

    /// Soft-delete flag. Deleted messages are never presented.
    #[serde(default)]
    pub is_deleted: bool,

    /// Creation time; the primary ordering key.
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Builds an optimistic message with a provisional id.
    pub fn provisional(new: &NewMessage, now: DateTime<Utc>) -> Self {
        Message {
            id: format!("{}{}", PROVISIONAL_ID_PREFIX, Uuid::new_v4()),
            channel_id: new.channel_id.clone(),
            sender_id: new.sender_id.clone(),
            content: new.content.clone(),
            thread_id: new.thread_id.clone(),
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if this message has not been confirmed by the store.
    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(PROVISIONAL_ID_PREFIX)
    }

    /// Returns true if this is a top-level message (not a thread reply).
    pub fn is_top_level(&self) -> bool {
        self.thread_id.is_none()
    }

    /// Ordering key within a channel view.
    pub fn order_key(&self) -> (DateTime<Utc>, String) {
        (self.created_at, self.id.clone())
    }
}

/// Payload for inserting a message. The store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewMessage {
    pub channel_id: String,
    pub sender_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl NewMessage {
    /// Creates a top-level message payload.
    pub fn new(
        channel_id: impl Into<String>,
        sender_id: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        NewMessage {
            channel_id: channel_id.into(),
            sender_id,
            content: content.into(),
            thread_id: None,
        }
    }

    /// Turns the payload into a thread reply.
    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Partial update for a message. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub is_edited: Option<bool>,
    pub is_deleted: Option<bool>,
}

impl MessagePatch {
    /// A body edit. Always marks the message as edited.
    pub fn edit(content: impl Into<String>) -> Self {
        MessagePatch {
            content: Some(content.into()),
            is_edited: Some(true),
            is_deleted: None,
        }
    }

    /// A soft delete.
    pub fn soft_delete() -> Self {
        MessagePatch {
            content: None,
            is_edited: None,
            is_deleted: Some(true),
        }
    }

    /// Applies the patch in place and bumps `updated_at`.
    pub fn apply_to(&self, message: &mut Message, now: DateTime<Utc>) {
        if let Some(ref content) = self.content {
            message.content = content.clone();
        }
        if let Some(edited) = self.is_edited {
            message.is_edited = edited;
        }
        if let Some(deleted) = self.is_deleted {
            message.is_deleted = deleted;
        }
        message.updated_at = now;
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.is_edited.is_none() && self.is_deleted.is_none()
    }
}

// =============================================================================
// Query Shape
// =============================================================================

/// Which messages a channel view contains.
///
/// The same predicate is used for the snapshot query and for every live
/// event, so the view always matches what a fresh fetch would return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    /// Only messages without a `thread_id`.
    pub top_level_only: bool,

    /// Include soft-deleted rows (never true for presentation views).
    pub include_deleted: bool,
}

impl Default for MessageFilter {
    fn default() -> Self {
        MessageFilter::top_level()
    }
}

impl MessageFilter {
    /// Top-level, non-deleted messages.
    pub const fn top_level() -> Self {
        MessageFilter {
            top_level_only: true,
            include_deleted: false,
        }
    }

    /// Every non-deleted message, including thread replies.
    pub const fn all() -> Self {
        MessageFilter {
            top_level_only: false,
            include_deleted: false,
        }
    }

    /// Returns true if the message belongs in a view using this filter.
    pub fn matches(&self, message: &Message) -> bool {
        if self.top_level_only && !message.is_top_level() {
            return false;
        }
        if !self.include_deleted && message.is_deleted {
            return false;
        }
        true
    }
}

/// Sort order for snapshot fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortOrder::Ascending => write!(f, "ASC"),
            SortOrder::Descending => write!(f, "DESC"),
        }
    }
}

// =============================================================================
// Reaction
// =============================================================================

/// One actor's emoji on one message.
///
/// The store keeps `(message_id, profile_id, emoji)` unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Reaction {
    pub id: String,
    pub message_id: String,
    pub profile_id: String,
    pub emoji: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    /// Returns true if this row carries the given (actor, emoji) pair.
    pub fn is_same_pair(&self, profile_id: &str, emoji: &str) -> bool {
        self.profile_id == profile_id && self.emoji == emoji
    }
}

/// Payload for inserting a reaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReaction {
    pub message_id: String,
    pub profile_id: String,
    pub emoji: String,
}

impl NewReaction {
    pub fn new(
        message_id: impl Into<String>,
        profile_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Self {
        NewReaction {
            message_id: message_id.into(),
            profile_id: profile_id.into(),
            emoji: emoji.into(),
        }
    }
}

// =============================================================================
// Typing Indicator
// =============================================================================

/// A persisted "is typing" row.
///
/// At most one row exists per `(channel_id, profile_id)`; re-asserting
/// refreshes `started_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct TypingIndicator {
    pub id: String,
    pub channel_id: String,
    pub profile_id: String,
    #[ts(as = "String")]
    pub started_at: DateTime<Utc>,
}

// =============================================================================
// Change Vocabulary
// =============================================================================

/// Backend tables a channel subscription can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    Reactions,
    TypingIndicators,
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Table::Messages => write!(f, "messages"),
            Table::Reactions => write!(f, "reactions"),
            Table::TypingIndicators => write!(f, "typing_indicators"),
        }
    }
}

/// Kind of row change carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    #[serde(alias = "INSERT")]
    Inserted,
    #[serde(alias = "UPDATE")]
    Updated,
    #[serde(alias = "DELETE")]
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Inserted => write!(f, "inserted"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Removed => write!(f, "removed"),
        }
    }
}
