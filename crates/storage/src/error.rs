//! Error types for storage operations.
//!
//! Failures carry a machine-checkable classification. Retry decisions look at
//! [`TransientKind`] and never at message text.

use std::fmt;
use std::time::Duration;

use artifact_cache_common::PathError;
use thiserror::Error;

/// Classification of a failure that may succeed if attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// Connection reset, aborted, or broken pipe.
    ConnectionReset,
    /// Request or socket timed out.
    Timeout,
    /// Backend asked the client to slow down.
    Throttled,
    /// Backend returned a 5xx class failure.
    ServiceUnavailable,
    /// Any other failure the backend marked as temporary.
    TemporaryFailure,
}

impl TransientKind {
    /// Every transient kind, in declaration order.
    pub const ALL: [TransientKind; 5] = [
        TransientKind::ConnectionReset,
        TransientKind::Timeout,
        TransientKind::Throttled,
        TransientKind::ServiceUnavailable,
        TransientKind::TemporaryFailure,
    ];

    /// Stable lowercase name used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::ConnectionReset => "connection-reset",
            TransientKind::Timeout => "timeout",
            TransientKind::Throttled => "throttled",
            TransientKind::ServiceUnavailable => "service-unavailable",
            TransientKind::TemporaryFailure => "temporary-failure",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Missing or invalid configuration, including rejected credentials.
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// Object, artifact, or cache entry does not exist.
    #[error("Not found: {key}")]
    NotFound { key: String },

    /// Network or service failure that may succeed on retry.
    #[error("Transient failure ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    /// Byte count received or committed differs from the expected size.
    #[error("Size mismatch for {key}: expected {expected} bytes, got {actual}")]
    SizeMismatch { key: String, expected: u64, actual: u64 },

    /// SHA-256 of the received bytes differs from the recorded digest.
    #[error("Digest mismatch for {key}: expected {expected}, got {actual}")]
    DigestMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// No progress was observed within the stall window.
    #[error("Transfer stalled: no progress for {timeout:?}")]
    Stalled { timeout: Duration },

    /// Backend did not hand out a usable upload session.
    #[error("Failed to initiate upload for {key}: {message}")]
    UploadInitiation { key: String, message: String },

    /// Multipart upload was rejected by the backend.
    #[error("Upload failed ({code}): {message}")]
    Upload { code: String, message: String },

    /// Source produced zero bytes and empty objects are not allowed.
    #[error("Refusing to upload empty object to {key}")]
    EmptyUpload { key: String },

    /// Target already exists and must not be overwritten.
    #[error("Already exists: {key}")]
    AlreadyExists { key: String },

    /// Caller supplied an invalid argument.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Whole operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Operation cancelled by the caller or a progress callback.
    #[error("Operation cancelled")]
    Cancelled,

    /// Local I/O error.
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// Backend failure with no more specific classification.
    #[error("Backend error ({code}): {message}")]
    Backend { code: String, message: String },
}

impl StorageError {
    /// Build a transient error.
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        StorageError::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Build a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        StorageError::Validation {
            message: message.into(),
        }
    }

    /// Build an I/O error attributed to `path`.
    pub fn io(path: impl fmt::Display, err: std::io::Error) -> Self {
        match StorageError::from(err) {
            StorageError::Io { message, .. } => StorageError::Io {
                path: path.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Transient classification, if this error is transient.
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            StorageError::Transient { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.transient_kind().is_some()
    }

    /// Check if this error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                StorageError::transient(TransientKind::ConnectionReset, err.to_string())
            }
            ErrorKind::TimedOut => StorageError::transient(TransientKind::Timeout, err.to_string()),
            _ => StorageError::Io {
                path: String::new(),
                message: err.to_string(),
            },
        }
    }
}

impl From<PathError> for StorageError {
    fn from(err: PathError) -> Self {
        StorageError::Validation {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_only_transient_is_retryable() {
        for kind in TransientKind::ALL {
            assert!(StorageError::transient(kind, "x").is_retryable());
        }

        let fatal: Vec<StorageError> = vec![
            StorageError::NotFound { key: "k".into() },
            StorageError::Cancelled,
            StorageError::validation("bad"),
            StorageError::Stalled {
                timeout: Duration::from_secs(30),
            },
            StorageError::Upload {
                code: "InvalidPart".into(),
                message: "x".into(),
            },
        ];
        for err in fatal {
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
    }

    #[test]
    fn test_io_error_classification() {
        let reset: StorageError = Error::new(ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(reset.transient_kind(), Some(TransientKind::ConnectionReset));

        let timed_out: StorageError = Error::new(ErrorKind::TimedOut, "slow").into();
        assert_eq!(timed_out.transient_kind(), Some(TransientKind::Timeout));

        let missing: StorageError = Error::new(ErrorKind::NotFound, "gone").into();
        assert!(matches!(missing, StorageError::Io { .. }));
    }

    #[test]
    fn test_io_with_path() {
        let err: StorageError =
            StorageError::io("/tmp/a.zip", Error::new(ErrorKind::PermissionDenied, "denied"));
        match err {
            StorageError::Io { path, .. } => assert_eq!(path, "/tmp/a.zip"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_path_error_becomes_validation() {
        let err: StorageError = PathError::InvalidPath { path: "".into() }.into();
        assert!(matches!(err, StorageError::Validation { .. }));
    }
}
