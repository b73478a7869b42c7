//! # Change Feed
//!
//! Broadcast of committed row changes.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Change Feed                                    │
//! │                                                                         │
//! │  MessageRepository ──┐                                                  │
//! │  ReactionRepository ─┼──► publish(RowChange) ──► broadcast::Sender     │
//! │  TypingRepository ───┘        (after commit)          │                 │
//! │                                                       ├──► receiver 1  │
//! │                                                       ├──► receiver 2  │
//! │                                                       └──► ...         │
//! │                                                                         │
//! │  A receiver that falls more than `capacity` changes behind gets        │
//! │  RecvError::Lagged. Subscribers treat that as a gap and resync.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use huddle_core::{ChangeKind, Table};

/// Default number of changes buffered per receiver.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// One committed row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: Table,
    pub kind: ChangeKind,

    /// Channel the row belongs to. Reactions inherit their message's channel.
    pub channel_id: String,

    /// Row after the change (`None` for removals).
    pub record: Option<Value>,

    /// Row before the change (removals only).
    pub old_record: Option<Value>,
}

/// Publisher side of the feed. Cloning shares the same broadcast channel.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<RowChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        ChangeFeed { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes a change. Having no receivers is not an error.
    pub fn publish(&self, change: RowChange) {
        trace!(
            table = %change.table,
            kind = %change.kind,
            channel_id = %change.channel_id,
            "Publishing row change"
        );
        let _ = self.tx.send(change);
    }

    /// Serializes a row and publishes it.
    ///
    /// Removals carry the row in `old_record`; everything else in `record`.
    pub fn publish_row<T: Serialize>(
        &self,
        table: Table,
        kind: ChangeKind,
        channel_id: &str,
        row: &T,
    ) {
        let value = match serde_json::to_value(row) {
            Ok(v) => v,
            Err(e) => {
                warn!(table = %table, error = %e, "Failed to serialize row change");
                return;
            }
        };

        let (record, old_record) = match kind {
            ChangeKind::Removed => (None, Some(value)),
            ChangeKind::Inserted | ChangeKind::Updated => (Some(value), None),
        };

        self.publish(RowChange {
            table,
            kind,
            channel_id: channel_id.to_string(),
            record,
            old_record,
        });
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        ChangeFeed::new(DEFAULT_FEED_CAPACITY)
    }
}
