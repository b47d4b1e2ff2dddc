//! # Error Types
//!
//! Domain-specific error types for pantry-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  pantry-core errors (this file)                                        │
//! │  ├── CoreError        - Domain rule violations                         │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  pantry-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  pantry-sync errors (separate crate)                                   │
//! │  └── SyncError        - Transport, protocol and pairing failures       │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → status / log          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Domain errors raised by pure pairing and list logic.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A list mutation referenced an item the cache does not hold.
    ///
    /// ## When This Occurs
    /// - Toggling an item that a host push removed a moment earlier
    /// - Deleting an item twice from two UI gestures
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// An item with the same id is already in the list.
    #[error("Item already exists: {0}")]
    DuplicateItem(String),

    /// Unknown device type string.
    #[error("Unknown device type: {0}")]
    UnknownDeviceType(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Used for early validation of handshake headers and pairing input before
/// any state changes.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., non-numeric pairing code).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::ItemNotFound("milk".to_string());
        assert_eq!(err.to_string(), "Item not found: milk");

        let err = ValidationError::Required {
            field: "device_id".to_string(),
        };
        assert_eq!(err.to_string(), "device_id is required");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::TooLong {
            field: "device_name".to_string(),
            max: 64,
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
