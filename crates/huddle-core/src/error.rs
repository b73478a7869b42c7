//! # Error Types
//!
//! Domain-specific error types for huddle-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  huddle-core errors (this file)                                        │
//! │  ├── CoreError        - Malformed records, view violations             │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  huddle-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  huddle-sync errors (separate crate)                                   │
//! │  └── SyncError        - What callers of a session see                  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record could not be decoded into a domain type.
    ///
    /// ## When This Occurs
    /// - A change payload is missing required fields
    /// - A timestamp is not RFC 3339
    #[error("Malformed {entity} record: {reason}")]
    MalformedRecord { entity: String, reason: String },

    /// A record belongs to a different channel than the view it was applied to.
    #[error("Record {id} belongs to channel {actual}, expected {expected}")]
    ChannelMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a MalformedRecord error.
    pub fn malformed(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::MalformedRecord {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any write reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
