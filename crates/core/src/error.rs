//! Error types for the ConcordKV storage core
//!
//! This module defines the unified error type used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Every public operation in every crate returns `Result<T>` from this module.
//! The error surface is a *stable enumeration*: external callers dispatch on
//! [`ErrorKind`], which never gains payloads and never renumbers.
//!
//! ## Categories
//!
//! - **User errors**: `InvalidArg`, `InvalidState`, `Exists`, `NotFound`
//! - **Resource errors**: `NoMemory`, `QueueFull`, `BatchFull`
//! - **Timing errors**: `Timeout`, `Locked`
//! - **Durability errors**: `Io`, `Corruption`
//! - **Protocol errors**: `PrepareFailed`, `CommitFailed`
//!
//! Recoverable kinds (`Timeout`, `Locked`, `QueueFull`, `BatchFull`) carry
//! enough context to retry. `Corruption` is always fatal to the operation.

use std::io;
use thiserror::Error;

/// Result type alias for ConcordKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error-kind enumeration.
///
/// Callers that only need to branch on the failure class match on this
/// instead of the full [`Error`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Argument failed validation
    InvalidArg,
    /// Key or entity does not exist
    NotFound,
    /// Key or entity already exists
    Exists,
    /// The system allocator refused memory
    NoMemory,
    /// File or device I/O failure
    Io,
    /// Checksum mismatch or structurally invalid on-disk data
    Corruption,
    /// A bounded wait expired
    Timeout,
    /// Batch context reached its configured op limit
    BatchFull,
    /// Operation not legal in the current lifecycle state
    InvalidState,
    /// A lock could not be acquired without blocking
    Locked,
    /// Bounded queue stayed full past the enqueue deadline
    QueueFull,
    /// A 2PC participant rejected or missed the prepare phase
    PrepareFailed,
    /// The commit phase of a transaction failed
    CommitFailed,
}

/// Error type for the ConcordKV storage core
#[derive(Debug, Error)]
pub enum Error {
    /// Argument failed validation
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Key not found in the engine
    #[error("key not found")]
    NotFound,

    /// Key already exists and the operation required absence
    #[error("key already exists")]
    Exists,

    /// The system allocator refused memory
    #[error("allocation failed: {0}")]
    NoMemory(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption detected (CRC mismatch, bad magic, truncated record)
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A bounded wait expired
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Batch context reached its configured op limit
    #[error("batch full: {max} ops")]
    BatchFull {
        /// Configured maximum ops per batch context
        max: usize,
    },

    /// Operation not legal in the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A lock could not be acquired without blocking
    #[error("locked: {0}")]
    Locked(String),

    /// Bounded queue stayed full past the enqueue deadline
    #[error("queue full")]
    QueueFull,

    /// A 2PC participant rejected or missed the prepare phase
    #[error("prepare failed: {0}")]
    PrepareFailed(String),

    /// The commit phase of a transaction failed
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        // A payload that fails to decode is indistinguishable from torn bytes.
        Error::Corruption(e.to_string())
    }
}

impl Error {
    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArg(_) => ErrorKind::InvalidArg,
            Error::NotFound => ErrorKind::NotFound,
            Error::Exists => ErrorKind::Exists,
            Error::NoMemory(_) => ErrorKind::NoMemory,
            Error::Io(_) => ErrorKind::Io,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::BatchFull { .. } => ErrorKind::BatchFull,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Locked(_) => ErrorKind::Locked,
            Error::QueueFull => ErrorKind::QueueFull,
            Error::PrepareFailed(_) => ErrorKind::PrepareFailed,
            Error::CommitFailed(_) => ErrorKind::CommitFailed,
        }
    }

    /// Check if this error is safe to retry.
    ///
    /// Used for retry logic in callers: only transient resource/timing
    /// failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Locked | ErrorKind::QueueFull | ErrorKind::BatchFull
        )
    }

    /// Check if this error is fatal to the engine instance.
    ///
    /// `Corruption` requires an explicit reopen before further writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corruption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_arg() {
        let err = Error::InvalidArg("order must be >= 3".to_string());
        let msg = err.to_string();
        assert!(msg.contains("invalid argument"));
        assert!(msg.contains("order must be >= 3"));
    }

    #[test]
    fn test_error_display_corruption() {
        let err = Error::Corruption("CRC check failed".to_string());
        let msg = err.to_string();
        assert!(msg.contains("corruption"));
        assert!(msg.contains("CRC check failed"));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(Error::QueueFull.kind(), ErrorKind::QueueFull);
        assert_eq!(
            Error::BatchFull { max: 16 }.kind(),
            ErrorKind::BatchFull
        );
        assert_eq!(
            Error::PrepareFailed("node-2".into()).kind(),
            ErrorKind::PrepareFailed
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_error_from_bincode_is_corruption() {
        let invalid = vec![0xFFu8; 2];
        let result: Result<String> = bincode::deserialize(&invalid).map_err(|e| e.into());
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("dequeue".into()).is_retryable());
        assert!(Error::QueueFull.is_retryable());
        assert!(Error::BatchFull { max: 8 }.is_retryable());
        assert!(!Error::NotFound.is_retryable());
        assert!(!Error::Corruption("bad magic".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Corruption("torn record".into()).is_fatal());
        assert!(!Error::Timeout("wait".into()).is_fatal());
    }
}
