//! S3 error classification.
//!
//! SDK failures are first captured as [`S3Error`], then mapped onto the
//! storage error taxonomy so the retry layer can act on them.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

use artifact_cache_storage::{StorageError, TransientKind};

/// A failed S3 call, before classification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S3Error {
    /// The service answered with an error.
    #[error("S3 error {code} (HTTP {status:?}): {message}")]
    Service {
        code: String,
        status: Option<u16>,
        message: String,
    },

    /// The request timed out before a response arrived.
    #[error("S3 request timed out: {0}")]
    Timeout(String),

    /// The request could not be sent or the connection dropped.
    #[error("S3 dispatch failure: {0}")]
    Dispatch(String),

    /// A response arrived but could not be read.
    #[error("S3 response error: {0}")]
    Response(String),

    /// The request could not be built.
    #[error("S3 request construction failed: {0}")]
    Construction(String),
}

impl S3Error {
    /// Capture an SDK error.
    pub fn from_sdk<E>(err: SdkError<E, HttpResponse>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let message: String = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::TimeoutError(_) => S3Error::Timeout(message),
            SdkError::DispatchFailure(failure) if failure.is_timeout() => {
                S3Error::Timeout(message)
            }
            SdkError::DispatchFailure(_) => S3Error::Dispatch(message),
            SdkError::ResponseError(_) => S3Error::Response(message),
            SdkError::ConstructionFailure(_) => S3Error::Construction(message),
            _ => S3Error::Service {
                code: err.code().unwrap_or_default().to_string(),
                status: err.raw_response().map(|r| r.status().as_u16()),
                message: err.message().map(String::from).unwrap_or(message),
            },
        }
    }

    /// Map onto a [`StorageError`] for an operation on `key`.
    pub fn into_storage_error(self, key: &str) -> StorageError {
        match self {
            S3Error::Service {
                code,
                status,
                message,
            } => classify_error_code(key, &code, status, message),
            S3Error::Timeout(message) => StorageError::transient(TransientKind::Timeout, message),
            S3Error::Dispatch(message) => {
                StorageError::transient(TransientKind::ConnectionReset, message)
            }
            S3Error::Response(message) => {
                StorageError::transient(TransientKind::TemporaryFailure, message)
            }
            S3Error::Construction(message) => StorageError::Configuration { message },
        }
    }
}

/// Map an S3 error code, falling back to the HTTP status when the code is
/// unknown or missing.
pub fn classify_error_code(
    key: &str,
    code: &str,
    status: Option<u16>,
    message: String,
) -> StorageError {
    match code {
        "NoSuchKey" | "NotFound" => StorageError::NotFound {
            key: key.to_string(),
        },
        "SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded"
        | "TooManyRequestsException" => StorageError::transient(TransientKind::Throttled, message),
        "RequestTimeout" | "RequestTimeoutException" => {
            StorageError::transient(TransientKind::Timeout, message)
        }
        "InternalError" | "ServiceUnavailable" => {
            StorageError::transient(TransientKind::ServiceUnavailable, message)
        }
        "NoSuchUpload" | "InvalidPart" | "InvalidPartOrder" | "EntityTooSmall"
        | "EntityTooLarge" => StorageError::Upload {
            code: code.to_string(),
            message,
        },
        "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "NoSuchBucket"
        | "ExpiredToken" | "InvalidToken" => StorageError::Configuration {
            message: format!("{}: {}", code, message),
        },
        _ => match status {
            Some(404) => StorageError::NotFound {
                key: key.to_string(),
            },
            Some(408) => StorageError::transient(TransientKind::Timeout, message),
            Some(429) => StorageError::transient(TransientKind::Throttled, message),
            Some(500..=599) => StorageError::transient(TransientKind::ServiceUnavailable, message),
            _ => StorageError::Backend {
                code: if code.is_empty() {
                    status.map(|s| s.to_string()).unwrap_or_else(|| "Unknown".into())
                } else {
                    code.to_string()
                },
                message,
            },
        },
    }
}
