//! # Repository Module
//!
//! Database repository implementations for Huddle.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Write Path Through a Repository                      │
//! │                                                                         │
//! │  db.messages().insert(new)                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  MessageRepository                                                     │
//! │  ├── SQL INSERT (assigns id + timestamps)                              │
//! │  └── feed.publish_row(Messages, Inserted, channel, &row)               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Returned row == published row (same id, same timestamps)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`MessageRepository`](message::MessageRepository) - snapshot fetch, insert, patch, soft delete
//! - [`ReactionRepository`](reaction::ReactionRepository) - per-message reaction rows
//! - [`TypingRepository`](typing::TypingRepository) - typing indicator upsert/clear

pub mod message;
pub mod reaction;
pub mod typing;

/// Column list shared by every message query.
pub(crate) const MESSAGE_COLUMNS: &str = "id, channel_id, sender_id, content, thread_id, \
     is_edited, is_deleted, created_at, updated_at";
