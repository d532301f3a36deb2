//! Error types for data parsing in bleherd-types.

use thiserror::Error;

/// Errors that can occur when decoding raw attribute payloads.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in bleherd-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload was shorter than the value it should contain.
    #[error("Insufficient bytes: expected at least {expected}, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// The payload decoded to a value outside what the field allows.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using bleherd-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
