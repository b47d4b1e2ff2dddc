//! # Validation Module
//!
//! Input validation for handshake headers and pairing input.
//!
//! ## Validation Points
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Companion                                                              │
//! │  └── validate_pairing_code_format before sending `pair`                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Host handshake                                                         │
//! │  ├── validate_device_id   (X-Device-ID, refused with 400)               │
//! │  └── normalize_device_name (X-Device-Name, falls back)                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Trust store (SQLite)                                                   │
//! │  └── PRIMARY KEY / NOT NULL constraints                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::PAIRING_CODE_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum accepted length of a device id header.
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Maximum stored length of a device name.
pub const MAX_DEVICE_NAME_LEN: usize = 64;

/// Name used when a companion sends no usable `X-Device-Name`.
pub const DEFAULT_DEVICE_NAME: &str = "Unnamed device";

// =============================================================================
// Validators
// =============================================================================

/// Validates a companion's device id.
///
/// ## Rules
/// - Must not be empty
/// - At most 128 characters
/// - Printable ASCII without whitespace
///
/// ## Example
/// ```rust
/// use pantry_core::validation::validate_device_id;
///
/// assert!(validate_device_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_device_id("").is_err());
/// ```
pub fn validate_device_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "device_id".to_string(),
        });
    }

    if id.len() > MAX_DEVICE_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "device_id".to_string(),
            max: MAX_DEVICE_ID_LEN,
        });
    }

    if !id.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ValidationError::InvalidFormat {
            field: "device_id".to_string(),
            reason: "must be printable ASCII without spaces".to_string(),
        });
    }

    Ok(())
}

/// Trims a device name, truncates it, and substitutes a default when blank.
pub fn normalize_device_name(name: Option<&str>) -> String {
    let name = name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return DEFAULT_DEVICE_NAME.to_string();
    }
    name.chars().take(MAX_DEVICE_NAME_LEN).collect()
}

/// Checks that user input looks like a pairing code (6 ASCII digits).
///
/// The host still does its own exact comparison; this only saves a round
/// trip for obvious typos.
pub fn validate_pairing_code_format(code: &str) -> ValidationResult<()> {
    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "code".to_string(),
        });
    }

    if code.len() != PAIRING_CODE_LEN || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: "code".to_string(),
            reason: "must be 6 digits".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_device_id() {
        assert!(validate_device_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_device_id("tablet-1").is_ok());

        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("   ").is_err());
        assert!(validate_device_id("has space").is_err());
        assert!(validate_device_id(&"a".repeat(200)).is_err());
    }

    #[test]
    fn test_normalize_device_name() {
        assert_eq!(normalize_device_name(Some("  Kitchen iPad ")), "Kitchen iPad");
        assert_eq!(normalize_device_name(Some("")), DEFAULT_DEVICE_NAME);
        assert_eq!(normalize_device_name(None), DEFAULT_DEVICE_NAME);
        assert_eq!(
            normalize_device_name(Some(&"x".repeat(100))).len(),
            MAX_DEVICE_NAME_LEN
        );
    }

    #[test]
    fn test_validate_pairing_code_format() {
        assert!(validate_pairing_code_format("012345").is_ok());
        assert!(validate_pairing_code_format("").is_err());
        assert!(validate_pairing_code_format("12345").is_err());
        assert!(validate_pairing_code_format("12a456").is_err());
    }
}
