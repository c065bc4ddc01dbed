//! Error types for the Braid library.
//!
//! All fallible operations return [`BraidError`] through the crate-wide
//! [`Result`] alias. The variants separate the conditions a caller reacts to
//! differently: a corrupt index is fatal to an open attempt, a stale reader
//! is still fine for reads, and a lock failure may be worth retrying.
//!
//! # Examples
//!
//! ```
//! use braid::error::{BraidError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(BraidError::invalid_argument("doc id out of range"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Braid operations.
#[derive(Error, Debug)]
pub enum BraidError {
    /// I/O errors from the storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed segment metadata or segment data.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// The index changed since this reader's write-capable view was taken.
    #[error("Stale reader: {0}")]
    StaleReader(String),

    /// A lock could not be obtained within the timeout.
    #[error("Lock obtain timed out after {timeout_ms}ms: {lock}")]
    LockObtainFailed {
        /// Name of the lock.
        lock: String,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// The reader (or one of its resources) has been closed.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// A mutation was attempted on a read-only reader.
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization errors
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with BraidError.
pub type Result<T> = std::result::Result<T, BraidError>;

impl BraidError {
    /// Create a new corrupt-index error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        BraidError::CorruptIndex(msg.into())
    }

    /// Create a new stale-reader error.
    pub fn stale<S: Into<String>>(msg: S) -> Self {
        BraidError::StaleReader(msg.into())
    }

    /// Create a new lock-obtain error.
    pub fn lock_obtain_failed<S: Into<String>>(lock: S, timeout_ms: u64) -> Self {
        BraidError::LockObtainFailed {
            lock: lock.into(),
            timeout_ms,
        }
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        BraidError::AlreadyClosed(msg.into())
    }

    /// Create a new read-only error.
    pub fn read_only<S: Into<String>>(msg: S) -> Self {
        BraidError::ReadOnly(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        BraidError::InvalidArgument(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        BraidError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        BraidError::Storage(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        BraidError::Other(msg.into())
    }

    /// Whether this error reports a stale reader.
    pub fn is_stale(&self) -> bool {
        matches!(self, BraidError::StaleReader(_))
    }

    /// Whether this error reports lock contention.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, BraidError::LockObtainFailed { .. })
    }
}
