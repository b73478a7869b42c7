//! # huddle-sync: Real-time Sync Core for Huddle
//!
//! This crate keeps a client's view of one chat channel consistent with the
//! backend: an initial snapshot, live row changes on top of it, optimistic
//! writes, reactions and short-lived typing presence.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Core Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncAgent (one active channel)                   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ select_channel                          │
//! │  ┌────────────────────────────▼─────────────────────────────────────┐  │
//! │  │                        SyncSession                               │  │
//! │  │                                                                  │  │
//! │  │  ┌─────────────────────┐ ┌────────────────┐ ┌─────────────────┐  │  │
//! │  │  │ ReconciliationEngine│ │ TagAggregator  │ │ PresenceTracker │  │  │
//! │  │  │ messages view       │ │ reactions      │ │ typing (TTL)    │  │  │
//! │  │  └──────────┬──────────┘ └───────┬────────┘ └────────┬────────┘  │  │
//! │  └─────────────┼────────────────────┼───────────────────┼───────────┘  │
//! │                ▼                    ▼                   ▼              │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │   SnapshotStore (fetch + writes)   EventStream (per-topic feed)  │  │
//! │  │   MemoryBackend | SqliteBackend                                  │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  STATUS EVENTS (via SessionEventEmitter):                               │
//! │  • state transitions: closed → opening → open ⇄ degraded → closed       │
//! │  • errors with a retryable flag                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent`, emitter trait and builder
//! - [`session`] - `SyncSession` and its state machine
//! - [`engine`] - snapshot + change reconciliation for messages
//! - [`aggregator`] - reaction grouping and toggles
//! - [`presence`] - TTL presence for typing indicators
//! - [`backend`] - `SnapshotStore` / `EventStream` and their backends
//! - [`change`] - change notification envelope
//! - [`config`] - TOML + environment configuration
//! - [`error`] - sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_sync::{SyncAgent, SyncConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let agent = SyncAgent::open_sqlite(config, "profile-1").await?;
//!
//! let session = agent.select_channel("general").await?;
//! session.append("hello").await?;
//! println!("{} messages", session.view().len());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod aggregator;
pub mod backend;
pub mod change;
pub mod config;
pub mod engine;
pub mod error;
pub mod presence;
pub mod session;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentStatus, NoOpEmitter, SessionEventEmitter, SyncAgent, SyncAgentBuilder};
pub use aggregator::TagAggregator;
pub use backend::{
    EventStream, LinkState, MemoryBackend, SnapshotStore, SqliteBackend, StreamSignal,
    Subscription, SubscriptionHandle, Topic,
};
pub use change::{ChangeEvent, ChangeNotification};
pub use config::{SessionSettings, StoreSettings, SyncConfig};
pub use engine::{EngineOptions, ReconciliationEngine, ViewListener, ViewUpdate, WriteOutcome};
pub use error::{SyncError, SyncResult};
pub use presence::PresenceTracker;
pub use session::{SessionState, SyncSession};
