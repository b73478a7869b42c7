//! # Change Notifications
//!
//! The payload a backend pushes when a row in a watched table changes, and
//! its decoding into typed events.
//!
//! ## Wire Shape
//! ```json
//! {
//!   "table": "messages",
//!   "kind": "UPDATED",
//!   "new": { "id": "…", "content": "hi", "is_edited": true, … },
//!   "old": null
//! }
//! ```
//! `kind` also accepts the realtime spellings `INSERT`, `UPDATE` and
//! `DELETE`. Removals identify their row through `old.id` (or `new.id`).
//!
//! ## Decoding
//! ```text
//! ChangeNotification ──decode::<T>()──► ChangeEvent<T>
//!                                        ├─ Inserted(T)
//!                                        ├─ Updated(T)
//!                                        └─ Removed { id, old: Option<T> }
//! ```
//! A missing or unparsable payload is `SyncError::MalformedEvent`. Pumps log
//! it and move on.

use std::collections::{HashSet, VecDeque};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use huddle_core::{ChangeKind, Table};

use crate::error::{SyncError, SyncResult};

/// One row change pushed by an [`EventStream`](crate::backend::EventStream).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: Table,
    pub kind: ChangeKind,

    #[serde(rename = "new", default)]
    pub record: Option<Value>,

    #[serde(rename = "old", default)]
    pub old_record: Option<Value>,
}

/// A notification decoded against its row type.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    Inserted(T),
    Updated(T),
    Removed {
        id: String,
        /// Last known row state, when the payload carried a full row.
        old: Option<T>,
    },
}

impl ChangeNotification {
    /// Notification for a freshly inserted row.
    pub fn inserted<T: Serialize>(table: Table, row: &T) -> SyncResult<Self> {
        Ok(ChangeNotification {
            table,
            kind: ChangeKind::Inserted,
            record: Some(serde_json::to_value(row)?),
            old_record: None,
        })
    }

    /// Notification for an updated row.
    pub fn updated<T: Serialize>(table: Table, row: &T) -> SyncResult<Self> {
        Ok(ChangeNotification {
            table,
            kind: ChangeKind::Updated,
            record: Some(serde_json::to_value(row)?),
            old_record: None,
        })
    }

    /// Notification for a deleted row.
    pub fn removed<T: Serialize>(table: Table, row: &T) -> SyncResult<Self> {
        Ok(ChangeNotification {
            table,
            kind: ChangeKind::Removed,
            record: None,
            old_record: Some(serde_json::to_value(row)?),
        })
    }

    /// Decodes the payload as a `T` row.
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<ChangeEvent<T>> {
        match self.kind {
            ChangeKind::Inserted => Ok(ChangeEvent::Inserted(self.decode_record()?)),
            ChangeKind::Updated => Ok(ChangeEvent::Updated(self.decode_record()?)),
            ChangeKind::Removed => {
                let id = self.removed_id().ok_or_else(|| {
                    SyncError::MalformedEvent(format!("{} delete without row id", self.table))
                })?;
                let old = self
                    .old_record
                    .as_ref()
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                Ok(ChangeEvent::Removed { id, old })
            }
        }
    }

    fn decode_record<T: DeserializeOwned>(&self) -> SyncResult<T> {
        let record = self.record.as_ref().ok_or_else(|| {
            SyncError::MalformedEvent(format!("{} {} without record", self.table, self.kind))
        })?;

        serde_json::from_value(record.clone())
            .map_err(|e| SyncError::MalformedEvent(format!("{} record: {}", self.table, e)))
    }

    fn removed_id(&self) -> Option<String> {
        [self.old_record.as_ref(), self.record.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|v| v.get("id").and_then(Value::as_str))
            .map(str::to_string)
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl From<huddle_db::RowChange> for ChangeNotification {
    fn from(change: huddle_db::RowChange) -> Self {
        ChangeNotification {
            table: change.table,
            kind: change.kind,
            record: change.record,
            old_record: change.old_record,
        }
    }
}

// =============================================================================
// Removed Ids
// =============================================================================

/// Ids recently removed by the stream, oldest dropped first.
///
/// A write response can arrive after the stream already removed the row it
/// describes; checking here keeps that stale response from reviving it.
#[derive(Debug, Clone)]
pub struct RemovedIds {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RemovedIds {
    pub const DEFAULT_CAPACITY: usize = 512;

    pub fn new(capacity: usize) -> Self {
        RemovedIds {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    pub fn record(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RemovedIds {
    fn default() -> Self {
        RemovedIds::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use huddle_core::{Message, NewMessage, Reaction};
    use serde_json::json;

    fn message() -> Message {
        let mut msg = Message::provisional(&NewMessage::new("general", None, "hi"), Utc::now());
        msg.id = "m1".into();
        msg
    }

    #[test]
    fn test_decode_insert_and_update() {
        let msg = message();
        let n = ChangeNotification::inserted(Table::Messages, &msg).unwrap();
        assert_eq!(n.decode::<Message>().unwrap(), ChangeEvent::Inserted(msg.clone()));

        let n = ChangeNotification::updated(Table::Messages, &msg).unwrap();
        assert!(matches!(n.decode::<Message>().unwrap(), ChangeEvent::Updated(m) if m.id == "m1"));
    }

    #[test]
    fn test_decode_removed_with_only_id() {
        let n = ChangeNotification {
            table: Table::Reactions,
            kind: ChangeKind::Removed,
            record: None,
            old_record: Some(json!({ "id": "r1" })),
        };
        match n.decode::<Reaction>().unwrap() {
            ChangeEvent::Removed { id, old } => {
                assert_eq!(id, "r1");
                assert!(old.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_payloads() {
        let missing = ChangeNotification {
            table: Table::Messages,
            kind: ChangeKind::Inserted,
            record: None,
            old_record: None,
        };
        assert!(matches!(
            missing.decode::<Message>(),
            Err(SyncError::MalformedEvent(_))
        ));

        let garbage = ChangeNotification {
            table: Table::Messages,
            kind: ChangeKind::Updated,
            record: Some(json!({ "id": 7 })),
            old_record: None,
        };
        assert!(matches!(
            garbage.decode::<Message>(),
            Err(SyncError::MalformedEvent(_))
        ));

        let anonymous = ChangeNotification {
            table: Table::Messages,
            kind: ChangeKind::Removed,
            record: None,
            old_record: Some(json!({})),
        };
        assert!(anonymous.decode::<Message>().is_err());
    }

    #[test]
    fn test_realtime_payload_shape() {
        let json = r#"{
            "table": "typing_indicators",
            "kind": "DELETE",
            "old": { "id": "t1", "channel_id": "general", "profile_id": "bob",
                     "started_at": "2024-01-01T00:00:00Z" }
        }"#;
        let n = ChangeNotification::from_json(json).unwrap();
        assert_eq!(n.kind, ChangeKind::Removed);
        assert!(n.record.is_none());

        let event = n.decode::<huddle_core::TypingIndicator>().unwrap();
        match event {
            ChangeEvent::Removed { id, old } => {
                assert_eq!(id, "t1");
                assert_eq!(old.unwrap().profile_id, "bob");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let back = ChangeNotification::from_json(&n.to_json().unwrap()).unwrap();
        assert_eq!(back, n);
    }

    #[test]
    fn test_removed_ids_drop_oldest_past_capacity() {
        let mut removed = RemovedIds::new(2);
        removed.record("a");
        removed.record("b");
        removed.record("b");
        assert_eq!(removed.len(), 2);

        removed.record("c");
        assert!(!removed.contains("a"));
        assert!(removed.contains("b"));
        assert!(removed.contains("c"));

        removed.clear();
        assert!(removed.is_empty());
    }
}
