//! # huddle-db: Database Layer for Huddle
//!
//! SQLite persistence for channels' messages, reactions and typing rows.
//! Every committed write is also published on a [`ChangeFeed`], which is
//! what realtime subscriptions are built on.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Huddle Data Flow                                 │
//! │                                                                         │
//! │  SyncSession.append("hi")                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     huddle-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  ChangeFeed  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (feed.rs)   │  │   │
//! │  │   │               │    │ MessageRepo   │───►│              │  │   │
//! │  │   │ SqlitePool    │◄───│ ReactionRepo  │    │  broadcast   │  │   │
//! │  │   │ + migrations  │    │ TypingRepo    │    │  RowChange   │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────┬───────┘  │   │
//! │  └────────────────────────────────────────────────────┼──────────┘   │
//! │                                                       │              │
//! │                                                       ▼              │
//! │                               huddle-sync SqliteBackend subscriptions │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use huddle_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("./huddle.db")).await?;
//! let recent = db.messages().fetch_recent("general", &filter, 100, SortOrder::Descending).await?;
//! ```

pub mod error;
pub mod feed;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use feed::{ChangeFeed, RowChange};
pub use pool::{Database, DbConfig};
pub use repository::message::MessageRepository;
pub use repository::reaction::ReactionRepository;
pub use repository::typing::TypingRepository;
