//! Error types for the replication engine.
//!
//! Errors are categorized by their source (remote handlers, local storage,
//! malformed data) and carry enough context to debug a failing sync channel.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `PushHandler` | Yes | The user-supplied push handler rejected a batch |
//! | `PullHandler` | Yes | The user-supplied pull handler rejected a request |
//! | `Storage` | No | Local storage or checkpoint persistence failed |
//! | `Validation` | No | A pulled document failed schema validation (dev mode) |
//! | `InvalidRevision` | No | A revision string did not parse as `<height>-<hash>` |
//! | `Unreachable` | No | Internal invariant violation (should not happen) |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to classify an error observed on
//! the replication state's error stream. Retryable errors indicate transient
//! remote or network issues; the cycle runner schedules its own retry after
//! `retry_time_ms` for any failed cycle. Non-retryable errors indicate
//! malformed data or local problems that need operator attention.
//!
//! All variants are `Clone` because errors are fanned out over a broadcast
//! channel to any number of subscribers.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Use [`is_retryable()`](Self::is_retryable) to check whether the failure is
/// transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The push handler rejected a batch of outgoing documents.
    ///
    /// Typically a network or server-side failure. Retryable.
    #[error("Push handler error: {message}")]
    PushHandler { message: String },

    /// The pull handler rejected a request for remote changes.
    ///
    /// Typically a network or server-side failure. Retryable.
    #[error("Pull handler error: {message}")]
    PullHandler { message: String },

    /// Local storage failure (document reads/writes or checkpoint persistence).
    ///
    /// Not retryable as a classification: the local store needs attention,
    /// even though the cycle runner still schedules retries for failed cycles.
    #[error("Storage error ({operation}): {message}")]
    Storage { operation: String, message: String },

    /// A pulled document failed schema validation (dev mode only).
    ///
    /// The remote sent a document that does not match the collection schema.
    /// Not retryable: the data is malformed at the source.
    #[error("Schema validation failed for pulled document '{document_id}': {message}")]
    Validation {
        document_id: String,
        message: String,
    },

    /// A revision string did not have the `<height>-<hash>` shape.
    ///
    /// Not retryable: indicates a corrupt document in local storage.
    #[error("Invalid revision string: {value}")]
    InvalidRevision { value: String },

    /// Internal invariant violation.
    ///
    /// Indicates a bug in the engine or its embedding, e.g. a pull cycle
    /// executing without a configured pull handler. Not retryable.
    #[error("Unreachable state: {0}")]
    Unreachable(String),
}

impl ReplicationError {
    /// Create a storage error with an operation label.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Short stable label for this error kind (used as a metrics label).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PushHandler { .. } => "push_handler",
            Self::PullHandler { .. } => "pull_handler",
            Self::Storage { .. } => "storage",
            Self::Validation { .. } => "validation",
            Self::InvalidRevision { .. } => "invalid_revision",
            Self::Unreachable(_) => "unreachable",
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PushHandler { .. } => true,
            Self::PullHandler { .. } => true,
            Self::Storage { .. } => false,
            Self::Validation { .. } => false,
            Self::InvalidRevision { .. } => false,
            Self::Unreachable(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_push_handler() {
        let err = ReplicationError::PushHandler {
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_is_retryable_pull_handler() {
        let err = ReplicationError::PullHandler {
            message: "503 service unavailable".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_retryable_storage() {
        let err = ReplicationError::storage("bulk_add_revisions", "disk full");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("bulk_add_revisions"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_not_retryable_validation() {
        let err = ReplicationError::Validation {
            document_id: "doc-1".to_string(),
            message: "missing required field 'name'".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("doc-1"));
    }

    #[test]
    fn test_not_retryable_invalid_revision() {
        let err = ReplicationError::InvalidRevision {
            value: "garbage".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("garbage"));
    }

    #[test]
    fn test_not_retryable_unreachable() {
        let err = ReplicationError::Unreachable("pull cycle without pull handler".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_is_clone() {
        let err = ReplicationError::PushHandler {
            message: "original".to_string(),
        };
        let cloned = err.clone();
        assert_eq!(err, cloned);
    }
}
