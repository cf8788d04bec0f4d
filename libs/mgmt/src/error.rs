//! Error types for the management protocol.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// A frame exceeded the maximum allowed length.
    #[error("frame of {0} bytes exceeds maximum")]
    TooLarge(usize),

    /// The frame body is not valid JSON for any known frame type.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Underlying I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a management call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagementError {
    /// The broker did not reply within the caller-supplied timeout.
    /// Safe to retry: all management verbs are idempotent.
    #[error("management call timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The broker replied with a non-success status.
    #[error("management call rejected (status {status}): {description}")]
    Rejected { status: u32, description: String },

    /// The session closed while the call was outstanding.
    #[error("connection lost")]
    ConnectionLost,
}
