//! Metadata store error types.

use thiserror::Error;

/// Result type for metadata store operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors that can occur during metadata store operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// No value exists at the path.
    #[error("no value at {path}")]
    NotFound {
        /// The path that was read.
        path: String,
    },

    /// The stored version differs from the expected one.
    ///
    /// Not retryable as-is: the writer must re-read and reconcile.
    #[error("bad version at {path}: expected {expected:?}, found {actual:?}")]
    BadVersion {
        /// The path that was written.
        path: String,
        /// The version the writer expected (`None` means absent).
        expected: Option<u64>,
        /// The version actually stored (`None` means absent).
        actual: Option<u64>,
    },

    /// The session to the store was lost before the outcome was known.
    #[error("connection lost during {operation}")]
    ConnectionLoss {
        /// What operation was being performed.
        operation: &'static str,
    },

    /// I/O error from a local backing store.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl MetaError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if the same request may simply be sent again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLoss { .. })
    }

    /// Returns true if the writer lost a compare-and-set race.
    #[must_use]
    pub const fn is_bad_version(&self) -> bool {
        matches!(self, Self::BadVersion { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(MetaError::ConnectionLoss { operation: "set" }.is_retryable());

        let conflict = MetaError::BadVersion {
            path: "/cursors/t/s".to_string(),
            expected: Some(3),
            actual: Some(4),
        };
        assert!(!conflict.is_retryable());
        assert!(conflict.is_bad_version());
        assert!(format!("{conflict}").contains("/cursors/t/s"));
    }
}
