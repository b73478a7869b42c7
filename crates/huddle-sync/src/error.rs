//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────┐  ┌─────────────────────┐ │
//! │  │  Configuration  │  │   Connectivity      │  │     Writes          │ │
//! │  │                 │  │                     │  │                     │ │
//! │  │  InvalidConfig  │  │  Transient-         │  │  WriteRejected      │ │
//! │  │  ConfigLoad…    │  │   Connectivity      │  │  NotFound (benign)  │ │
//! │  │  ConfigSave…    │  │  FetchFailed        │  │  Validation         │ │
//! │  │                 │  │  SubscribeFailed    │  │                     │ │
//! │  └─────────────────┘  └─────────────────────┘  └─────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │    Events       │  │     Lifecycle                               │  │
//! │  │                 │  │                                             │  │
//! │  │  MalformedEvent │  │  SessionClosed, Internal                    │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `MalformedEvent` never reaches callers of the public API: the pumps log
//! and drop notifications that fail to decode.

use huddle_core::ValidationError;
use huddle_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    /// The backend could not be reached. The caller may retry.
    #[error("Transient connectivity failure: {0}")]
    TransientConnectivity(String),

    /// Snapshot fetch failed.
    #[error("Snapshot fetch failed: {0}")]
    FetchFailed(String),

    /// Subscribing to a topic failed.
    #[error("Subscribe failed for {topic}: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    // =========================================================================
    // Write Errors
    // =========================================================================
    /// The backend rejected an insert, update or delete.
    #[error("{operation} rejected: {reason}")]
    WriteRejected { operation: String, reason: String },

    /// The target record no longer exists.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Input failed local validation before any write was attempted.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Event Errors
    // =========================================================================
    /// A change notification could not be decoded.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The session or engine has been closed.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates a WriteRejected error.
    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::WriteRejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Creates a NotFound error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Folds a store failure into the error surfaced by a local write.
    ///
    /// Validation and NotFound keep their meaning; anything else becomes
    /// `WriteRejected` tagged with `operation`.
    pub fn into_write_error(self, operation: &str) -> Self {
        match self {
            SyncError::WriteRejected { .. }
            | SyncError::NotFound { .. }
            | SyncError::Validation(_)
            | SyncError::SessionClosed(_) => self,
            other => SyncError::rejected(operation, other.to_string()),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => SyncError::NotFound { entity, id },
            ref e if e.is_connectivity() => SyncError::TransientConnectivity(e.to_string()),
            ref e if e.is_rejection() => SyncError::rejected("write", e.to_string()),
            other => SyncError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedEvent(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Transient connectivity failures
    /// - Failed snapshot fetches and subscribes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientConnectivity(_)
                | SyncError::FetchFailed(_)
                | SyncError::SubscribeFailed { .. }
        )
    }

    /// Returns true if the error can be treated as a no-op.
    ///
    /// A write against a record that is already gone leaves the view in the
    /// state the caller wanted.
    pub fn is_benign(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::TransientConnectivity("offline".into()).is_retryable());
        assert!(SyncError::FetchFailed("timeout".into()).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::rejected("append", "denied").is_retryable());
        assert!(!SyncError::not_found("Message", "m1").is_retryable());
    }

    #[test]
    fn test_benign_errors() {
        assert!(SyncError::not_found("Message", "m1").is_benign());
        assert!(!SyncError::rejected("edit", "denied").is_benign());
    }

    #[test]
    fn test_db_error_mapping() {
        let err: SyncError = DbError::not_found("Reaction", "r1").into();
        assert!(matches!(err, SyncError::NotFound { ref id, .. } if id == "r1"));

        let err: SyncError = DbError::duplicate("emoji", "👍").into();
        assert!(matches!(err, SyncError::WriteRejected { .. }));

        let err: SyncError = DbError::ConnectionFailed("refused".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_into_write_error() {
        let err = SyncError::TransientConnectivity("offline".into()).into_write_error("append");
        match err {
            SyncError::WriteRejected { operation, reason } => {
                assert_eq!(operation, "append");
                assert!(reason.contains("offline"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(SyncError::not_found("Message", "m1")
            .into_write_error("edit")
            .is_benign());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::rejected("append", "permission denied");
        assert_eq!(err.to_string(), "append rejected: permission denied");
    }
}
