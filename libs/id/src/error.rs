//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is not a base-10 integer.
    #[error("invalid ID '{value}': {reason}")]
    NotANumber { value: String, reason: String },

    /// IDs are allocated by Postgres sequences and are always positive.
    #[error("ID must be positive, got {0}")]
    NotPositive(i64),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
