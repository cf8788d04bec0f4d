//! Error types for address decoding.

use thiserror::Error;

/// Errors that can occur when decoding an address entry.
#[derive(Debug, Error, Clone)]
pub enum DecodeError {
    /// The entry name is empty or not a valid address name.
    #[error("invalid address name: {0:?}")]
    InvalidName(String),

    /// The entry payload is not valid JSON or is missing required fields.
    #[error("malformed entry for address {name:?}: {reason}")]
    Malformed { name: String, reason: String },

    /// The group id is empty.
    #[error("empty group id for address {0:?}")]
    EmptyGroup(String),
}
