//! # huddle-core: Pure Domain Logic for Huddle
//!
//! Types and in-memory structures shared by the storage layer and the sync
//! core. Nothing in here performs I/O or spawns tasks.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Huddle Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  Presentation (chat UI)                         │   │
//! │  │     message list ── typing line ── reaction chips               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ snapshots                              │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    huddle-sync                                  │   │
//! │  │    SyncSession, ReconciliationEngine, PresenceTracker           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ huddle-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   view    │  │ reactions │  │ validation│  │   │
//! │  │   │  Message  │  │ TopicView │  │ReactionSet│  │   rules   │  │   │
//! │  │   │  Reaction │  │           │  │  Grouped  │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Message, Reaction, TypingIndicator and write payloads
//! - [`view`] - Ordered, id-deduplicated per-channel message view
//! - [`reactions`] - Per-message reaction rows and their grouped projection
//! - [`validation`] - Input rules for message bodies and emoji
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod reactions;
pub mod types;
pub mod validation;
pub mod view;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, ValidationError};
pub use reactions::{GroupedReactions, ReactionGroup, ReactionSet};
pub use types::*;
pub use view::{TopicView, ViewChange};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Number of messages fetched when a channel is opened.
///
/// The newest rows win; older history is out of scope for a live view.
pub const SNAPSHOT_LIMIT: u32 = 100;

/// How long a typing assertion stays valid without being refreshed.
pub const TYPING_TTL_MS: u64 = 3_000;

/// Sweep interval for expired typing entries. Bounds staleness to one tick.
pub const TYPING_TICK_MS: u64 = 1_000;

/// Maximum message body length, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 4_000;

/// Maximum emoji label length, in characters.
pub const MAX_EMOJI_LENGTH: usize = 32;

/// Prefix of ids assigned to optimistic messages before the store confirms them.
pub const PROVISIONAL_ID_PREFIX: &str = "local:";
