//! Error types for kindkv
//!
//! Provides a unified error type for all datastore operations, plus the small
//! enumerated code that crosses the external boundary.

use thiserror::Error;

use crate::lock::LockError;

/// Result type alias using DatastoreError
pub type Result<T> = std::result::Result<T, DatastoreError>;

/// Unified error type for kindkv operations
#[derive(Debug, Error)]
pub enum DatastoreError {
    // -------------------------------------------------------------------------
    // Request Errors
    // -------------------------------------------------------------------------
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Query requires an index: {0}")]
    NeedsIndex(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    // -------------------------------------------------------------------------
    // Backend Errors
    // -------------------------------------------------------------------------
    #[error("Backend unavailable: {0}")]
    Backend(String),

    #[error("Lock service error: {0}")]
    LockService(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Invariant Errors
    // -------------------------------------------------------------------------
    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // -------------------------------------------------------------------------
    // Encoding Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for DatastoreError {
    fn from(err: bincode::Error) -> Self {
        DatastoreError::Serialization(err.to_string())
    }
}

impl From<LockError> for DatastoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Conflict(detail) => DatastoreError::ConcurrentModification(detail),
            LockError::InvalidTransaction(txn) => DatastoreError::ConcurrentModification(
                format!("transaction {} is no longer valid", txn),
            ),
            LockError::TooManyGroups(detail) => DatastoreError::BadRequest(detail),
            LockError::Transient(detail) | LockError::Unavailable(detail) => {
                DatastoreError::LockService(detail)
            }
        }
    }
}

/// Error code exposed to callers of the datastore API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    ConcurrentTransaction,
    InternalError,
    NeedIndex,
}

impl DatastoreError {
    /// Map this error onto the external error code
    pub fn code(&self) -> ErrorCode {
        match self {
            DatastoreError::BadRequest(_) => ErrorCode::BadRequest,
            DatastoreError::NeedsIndex(_) => ErrorCode::NeedIndex,
            DatastoreError::ConcurrentModification(_) => ErrorCode::ConcurrentTransaction,
            _ => ErrorCode::InternalError,
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, DatastoreError::ConcurrentModification(_))
    }

    /// Detail string safe to hand to a client.
    ///
    /// Internal-class errors collapse to a generic message; their detail is
    /// only for logs.
    pub fn public_detail(&self) -> String {
        match self {
            DatastoreError::BadRequest(detail)
            | DatastoreError::NeedsIndex(detail)
            | DatastoreError::ConcurrentModification(detail) => detail.clone(),
            DatastoreError::Backend(_) | DatastoreError::Io(_) => {
                "The datastore backend is unavailable".to_string()
            }
            DatastoreError::LockService(_) => {
                "The transaction coordinator is unavailable".to_string()
            }
            _ => "Internal datastore error".to_string(),
        }
    }
}
