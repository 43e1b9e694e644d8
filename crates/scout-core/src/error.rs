//! # Core Error Types
//!
//! Decode errors for advertising payloads. Malformed radio data is routine,
//! so every variant is recoverable by the caller (skip the report, keep
//! scanning); nothing here panics.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while decoding advertising payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// An AD structure's length byte runs past the end of the payload.
    #[error("AD field at offset {offset} claims {claimed} bytes but only {available} remain")]
    TruncatedField {
        offset: usize,
        claimed: usize,
        available: usize,
    },

    /// An AD structure with a length of zero (no type byte).
    #[error("AD field at offset {offset} has zero length")]
    EmptyField { offset: usize },

    /// A service UUID filter with an unsupported width.
    #[error("Service UUID must be 2 or 16 bytes, got {0}")]
    InvalidUuidLength(usize),

    /// A local name that is not valid UTF-8.
    #[error("Local name is not valid UTF-8")]
    InvalidName,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::TruncatedField {
            offset: 3,
            claimed: 10,
            available: 2,
        };
        let text = err.to_string();
        assert!(text.contains("offset 3"));
        assert!(text.contains("10 bytes"));
    }
}
