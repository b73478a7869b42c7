//! # Validation Module
//!
//! Input validation applied before any write reaches the store.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Composer (UI)                                                │
//! │  └── Disables send on empty input                                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: SyncSession (Rust)                                           │
//! │  └── THIS MODULE: body/emoji/id rules                                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Store                                                        │
//! │  ├── NOT NULL / CHECK constraints                                      │
//! │  └── UNIQUE (message_id, profile_id, emoji)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use huddle_core::validation::{validate_content, validate_emoji};
//!
//! assert_eq!(validate_content("  hello  ").unwrap(), "hello");
//! assert!(validate_emoji("👍").is_ok());
//! assert!(validate_content("   ").is_err());
//! ```

use crate::error::ValidationError;
use crate::{MAX_EMOJI_LENGTH, MAX_MESSAGE_LENGTH};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Message Validators
// =============================================================================

/// Validates a message body and returns it trimmed.
///
/// ## Rules
/// - Must not be empty after trimming
/// - At most [`MAX_MESSAGE_LENGTH`] characters
pub fn validate_content(content: &str) -> ValidationResult<String> {
    let content = content.trim();

    if content.is_empty() {
        return Err(ValidationError::Required {
            field: "content".to_string(),
        });
    }

    if content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ValidationError::TooLong {
            field: "content".to_string(),
            max: MAX_MESSAGE_LENGTH,
        });
    }

    Ok(content.to_string())
}

/// Validates a reaction label.
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_EMOJI_LENGTH`] characters
/// - No whitespace
pub fn validate_emoji(emoji: &str) -> ValidationResult<()> {
    if emoji.is_empty() {
        return Err(ValidationError::Required {
            field: "emoji".to_string(),
        });
    }

    if emoji.chars().count() > MAX_EMOJI_LENGTH {
        return Err(ValidationError::TooLong {
            field: "emoji".to_string(),
            max: MAX_EMOJI_LENGTH,
        });
    }

    if emoji.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidFormat {
            field: "emoji".to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates an opaque identifier (channel, profile or message id).
pub fn validate_id(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}
