//! Error types for SHELF operations.
//!
//! The taxonomy distinguishes transient I/O failures, which are retried and
//! counted toward the circuit breaker, from permanent failures
//! (serialization, validation, integrity), which abort the single operation
//! immediately and are never retried.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the keyed document store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShelfError {
    /// A retryable I/O failure: lock contention, permission races,
    /// temporary unavailability. Counts toward the circuit breaker.
    #[error("Transient I/O failure on {path}: {reason}")]
    TransientIo { path: PathBuf, reason: String },

    /// The record could not be serialized. Never retried.
    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// Verify-by-reread hash mismatch on a staged write. The destination
    /// file is untouched because the failure occurs before rename.
    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The circuit breaker is open; the operation was not attempted.
    /// Does not increment the failure counter further.
    #[error("Circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// The logical key matched no static entry and no registered family.
    #[error("Unknown key: {key}")]
    UnknownKey { key: String },

    /// The key or family prefix is already registered.
    #[error("Duplicate registration for key {key}")]
    DuplicateKey { key: String },

    /// The key's family does not support `delete`.
    #[error("Delete not supported for key {key}")]
    DeleteNotSupported { key: String },

    /// The serialized payload exceeds the configured size ceiling.
    #[error("Payload for key {key} is {size} bytes, over the {limit} byte limit")]
    PayloadTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    /// The record's shape failed the family's structural validation.
    #[error("Invalid record shape for key {key}: {reason}")]
    InvalidShape { key: String, reason: String },

    /// A lock or registry was poisoned or torn down mid-operation.
    #[error("Store is shut down")]
    ShutDown,
}

impl ShelfError {
    /// Whether this failure is retryable and counts toward the breaker.
    ///
    /// Everything else is permanent for the single operation: retrying a
    /// serialization or shape failure cannot succeed, and `CircuitOpen`
    /// must not consume retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, ShelfError::TransientIo { .. })
    }

    /// Convenience constructor mapping an `std::io::Error` onto a path.
    pub fn transient_io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        ShelfError::TransientIo {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Result alias used throughout the workspace.
pub type ShelfResult<T> = Result<T, ShelfError>;
