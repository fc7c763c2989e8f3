//! Error types for relkv
//!
//! Every engine adapter translates native failures into [`BackendError`].
//! Callers reason about outcomes through [`ErrorKind`], which collapses the
//! variants into four classes:
//!
//! - `NotFound`: the requested row is absent
//! - `AlreadyExists`: a unique constraint rejected the write
//! - `Retryable`: the engine reported a serialization conflict; restart the
//!   whole transaction
//! - `Generic`: everything else
//!
//! `BackendError` is `Clone` because a failed transaction latches its error
//! and hands the same value back from every later call.

use thiserror::Error;

/// Result type alias for relkv operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Semantic classification of a [`BackendError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Requested row absent
    NotFound,
    /// Unique-constraint violation
    AlreadyExists,
    /// Serialization or write conflict; the caller retries the transaction
    Retryable,
    /// Any other failure
    Generic,
}

/// Error type for all backend operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Requested row absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint violation (e.g. duplicate item ID for a key)
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Engine reported a serialization failure under strict isolation
    #[error("transaction must be retried: {0}")]
    Retryable(String),

    /// Stored value did not match the expected value
    #[error("compare failed: {0}")]
    CompareFailed(String),

    /// The operation's context was canceled
    #[error("operation canceled")]
    Canceled,

    /// The operation's context deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A mutating call was issued on a read-only transaction
    #[error("{0} is not permitted in a read-only transaction")]
    ReadOnly(&'static str),

    /// Invalid configuration or argument
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Connecting to the engine failed
    #[error("connection problem: {0}")]
    Connection(String),

    /// Applying a schema migration failed
    #[error("migration failed: {0}")]
    Migration(String),

    /// Any other engine failure
    #[error("engine error: {0}")]
    Engine(String),
}

impl BackendError {
    /// Create a NotFound error
    pub fn not_found(msg: impl Into<String>) -> Self {
        BackendError::NotFound(msg.into())
    }

    /// Create an AlreadyExists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        BackendError::AlreadyExists(msg.into())
    }

    /// Create a Retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        BackendError::Retryable(msg.into())
    }

    /// Create a CompareFailed error
    pub fn compare_failed(msg: impl Into<String>) -> Self {
        BackendError::CompareFailed(msg.into())
    }

    /// Create a BadParameter error
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        BackendError::BadParameter(msg.into())
    }

    /// Create a Connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        BackendError::Connection(msg.into())
    }

    /// Create a Migration error
    pub fn migration(msg: impl Into<String>) -> Self {
        BackendError::Migration(msg.into())
    }

    /// Create a generic engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        BackendError::Engine(msg.into())
    }

    /// Four-class classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::NotFound(_) => ErrorKind::NotFound,
            BackendError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            BackendError::Retryable(_) => ErrorKind::Retryable,
            _ => ErrorKind::Generic,
        }
    }

    /// True if the caller should retry the whole transaction
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// True if the error means a row was absent
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True if the error means a unique constraint was violated
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// True for cancellation and deadline failures
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BackendError::Canceled | BackendError::DeadlineExceeded)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Engine(format!("I/O error: {}", e))
    }
}
