//! Storage settings and environment loading.

use std::time::Duration;

use artifact_cache_common::{
    default_concurrency_for_host, DEFAULT_ARTIFACT_STALL_TIMEOUT_SECS,
    DEFAULT_CACHE_STALL_TIMEOUT_SECS, DEFAULT_DOWNLOAD_TIMEOUT_SECS, DEFAULT_PRESIGN_TTL_SECS,
    DEFAULT_PROGRESS_INTERVAL_SECS, DEFAULT_UPLOAD_CHUNK_SIZE, MAX_RETENTION_DAYS,
};

use crate::error::StorageError;
use crate::retention::{parse_retention_days, validate_retention_days};
use crate::retry::RetrySettings;

pub const ENV_REGION: &str = "AWS_REGION";
pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_BUCKET: &str = "ARTIFACT_BUCKET";
pub const ENV_ENDPOINT: &str = "ARTIFACT_ENDPOINT";
pub const ENV_ROOT_PREFIX: &str = "ARTIFACT_ROOT_PREFIX";
pub const ENV_UPLOAD_CHUNK_SIZE: &str = "ARTIFACT_UPLOAD_CHUNK_SIZE";
pub const ENV_UPLOAD_CONCURRENCY: &str = "ARTIFACT_UPLOAD_CONCURRENCY";
pub const ENV_DOWNLOAD_CONCURRENCY: &str = "ARTIFACT_DOWNLOAD_CONCURRENCY";
pub const ENV_SEGMENT_TIMEOUT_MS: &str = "ARTIFACT_SEGMENT_TIMEOUT_MS";
pub const ENV_CACHE_SEGMENT_TIMEOUT_MS: &str = "CACHE_SEGMENT_TIMEOUT_MS";
pub const ENV_RETENTION_DAYS: &str = "ARTIFACT_RETENTION_DAYS";

/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Configuration settings for storage operations.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// AWS region.
    pub region: String,
    /// Static credentials. `None` defers to the SDK's default chain.
    pub credentials: Option<AwsCredentials>,
    /// Custom endpoint, e.g. an S3-compatible server.
    pub endpoint: Option<String>,
    /// Bucket holding artifacts and caches.
    pub bucket: String,
    /// Expected bucket owner account, sent with every request when set.
    pub expected_bucket_owner: Option<String>,
    /// Prefix applied to every key.
    pub root_prefix: String,
    /// Multipart part size and ranged download size.
    pub chunk_size: u64,
    /// Maximum part uploads in flight.
    pub upload_concurrency: usize,
    /// Maximum ranged downloads in flight.
    pub download_concurrency: usize,
    /// Stall window for artifact transfers.
    pub artifact_stall_timeout: Duration,
    /// Stall window for cache transfers.
    pub cache_stall_timeout: Duration,
    /// Deadline for a whole download.
    pub download_timeout: Duration,
    /// Days artifacts are kept.
    pub retention_days: u32,
    /// Lifetime of presigned URLs.
    pub presign_ttl: Duration,
    /// Interval between progress lines.
    pub progress_interval: Duration,
    /// Upload retry settings.
    pub upload_retry: RetrySettings,
    /// Download retry settings.
    pub download_retry: RetrySettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let concurrency: usize = default_concurrency_for_host();
        Self {
            region: DEFAULT_REGION.into(),
            credentials: None,
            endpoint: None,
            bucket: String::new(),
            expected_bucket_owner: None,
            root_prefix: String::new(),
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            upload_concurrency: concurrency,
            download_concurrency: concurrency,
            artifact_stall_timeout: Duration::from_secs(DEFAULT_ARTIFACT_STALL_TIMEOUT_SECS),
            cache_stall_timeout: Duration::from_secs(DEFAULT_CACHE_STALL_TIMEOUT_SECS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            retention_days: MAX_RETENTION_DAYS,
            presign_ttl: Duration::from_secs(DEFAULT_PRESIGN_TTL_SECS),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
            upload_retry: RetrySettings::default(),
            download_retry: RetrySettings::default(),
        }
    }
}

/// AWS credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl StorageSettings {
    /// Settings for `bucket` with everything else defaulted.
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through `lookup`. Blank values count as unset.
    ///
    /// # Errors
    /// `Configuration` when the bucket or half of a credential pair is
    /// missing, `Validation` when a number is malformed or out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, StorageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Option<String> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings: StorageSettings = StorageSettings::default();

        if let Some(region) = get(ENV_REGION) {
            settings.region = region;
        }
        settings.bucket = get(ENV_BUCKET).ok_or_else(|| StorageError::Configuration {
            message: format!("{} is not set", ENV_BUCKET),
        })?;
        settings.endpoint = get(ENV_ENDPOINT);
        if let Some(prefix) = get(ENV_ROOT_PREFIX) {
            settings.root_prefix = prefix.trim_matches('/').to_string();
        }

        settings.credentials = match (get(ENV_ACCESS_KEY_ID), get(ENV_SECRET_ACCESS_KEY)) {
            (Some(access_key_id), Some(secret_access_key)) => Some(AwsCredentials {
                access_key_id,
                secret_access_key,
                session_token: get(ENV_SESSION_TOKEN),
            }),
            (None, None) => None,
            _ => {
                return Err(StorageError::Configuration {
                    message: format!(
                        "{} and {} must be set together",
                        ENV_ACCESS_KEY_ID, ENV_SECRET_ACCESS_KEY
                    ),
                })
            }
        };

        if let Some(value) = get(ENV_UPLOAD_CHUNK_SIZE) {
            settings.chunk_size = parse_positive(ENV_UPLOAD_CHUNK_SIZE, &value)?;
        }
        if let Some(value) = get(ENV_UPLOAD_CONCURRENCY) {
            settings.upload_concurrency = parse_positive(ENV_UPLOAD_CONCURRENCY, &value)? as usize;
        }
        if let Some(value) = get(ENV_DOWNLOAD_CONCURRENCY) {
            settings.download_concurrency =
                parse_positive(ENV_DOWNLOAD_CONCURRENCY, &value)? as usize;
        }
        if let Some(value) = get(ENV_SEGMENT_TIMEOUT_MS) {
            settings.artifact_stall_timeout =
                Duration::from_millis(parse_positive(ENV_SEGMENT_TIMEOUT_MS, &value)?);
        }
        if let Some(value) = get(ENV_CACHE_SEGMENT_TIMEOUT_MS) {
            settings.cache_stall_timeout =
                Duration::from_millis(parse_positive(ENV_CACHE_SEGMENT_TIMEOUT_MS, &value)?);
        }
        if let Some(value) = get(ENV_RETENTION_DAYS) {
            settings.retention_days = parse_retention_days(&value)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Check settings loaded or built by hand.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.bucket.trim().is_empty() {
            return Err(StorageError::Configuration {
                message: "bucket name is empty".into(),
            });
        }
        if self.chunk_size == 0 {
            return Err(StorageError::validation("chunk size must be greater than zero"));
        }
        if self.upload_concurrency == 0 || self.download_concurrency == 0 {
            return Err(StorageError::validation("concurrency must be greater than zero"));
        }
        validate_retention_days(self.retention_days)
    }

    /// Key under the root prefix.
    pub fn prefixed(&self, path: &str) -> String {
        let path: &str = path.trim_start_matches('/');
        if self.root_prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.root_prefix, path)
        }
    }
}

fn parse_positive(name: &str, value: &str) -> Result<u64, StorageError> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(StorageError::validation(format!(
            "{} must be a positive integer, got {:?}",
            name, value
        ))),
    }
}
