//! Chunked multipart upload.
//!
//! The uploader pulls fixed-size parts from any `AsyncRead`, hashes every
//! byte as it is read, and keeps a bounded number of part uploads in flight.
//!
//! # Upload Flow
//!
//! 1. Open a multipart session (retried)
//! 2. Read parts in order, numbering them 1, 2, 3, ... as they are read
//! 3. Upload parts concurrently, each part retried on transient failure
//! 4. Commit with parts sorted by part number
//!
//! Any failure after the session opens aborts it before the error is
//! returned. A [`StallMonitor`] cancels the transfer if no bytes move within
//! the stall window.
//!
//! # Example
//!
//! ```ignore
//! let uploader = ChunkedUploader::new(&store).with_options(UploadOptions::default());
//! let progress = TransferProgress::new(OperationType::Uploading, "dist.zip", size);
//! let outcome = uploader.upload(file, "artifacts/dist.zip", &progress).await?;
//! ```

use std::collections::HashMap;
use std::time::Duration;

use artifact_cache_common::{
    default_concurrency_for_host, Sha256Hasher, DEFAULT_ARTIFACT_STALL_TIMEOUT_SECS,
    DEFAULT_UPLOAD_CHUNK_SIZE, MAX_MULTIPART_PARTS,
};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::chunking::is_valid_part_size;
use crate::error::StorageError;
use crate::progress::{StallGuard, StallMonitor, TransferProgress};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::traits::ObjectStore;
use crate::types::{CompletedPart, UploadOutcome};

/// Largest single read from the source.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// What to do when the source produces no bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyObjectPolicy {
    /// Fail with [`StorageError::EmptyUpload`].
    #[default]
    Reject,
    /// Commit a single empty part.
    Allow,
}

/// Options for upload operations.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Bytes per part. Every part except the last is exactly this size.
    pub part_size: u64,
    /// Maximum part uploads in flight.
    pub max_concurrency: usize,
    /// Cancel the upload if nothing moves for this long.
    pub stall_timeout: Duration,
    /// Retry policy for each backend call.
    pub retry: RetryPolicy,
    /// Handling of zero-byte sources.
    pub empty_object: EmptyObjectPolicy,
    /// User metadata attached to the committed object.
    pub metadata: HashMap<String, String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            max_concurrency: default_concurrency_for_host(),
            stall_timeout: Duration::from_secs(DEFAULT_ARTIFACT_STALL_TIMEOUT_SECS),
            retry: RetryPolicy::transient(),
            empty_object: EmptyObjectPolicy::Reject,
            metadata: HashMap::new(),
        }
    }
}

impl UploadOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the part size.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Set maximum concurrency for part uploads.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the stall window.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Set the per-call retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the empty-object policy.
    pub fn with_empty_object(mut self, policy: EmptyObjectPolicy) -> Self {
        self.empty_object = policy;
        self
    }

    /// Attach one user metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.part_size == 0 {
            return Err(StorageError::validation("part size must be greater than zero"));
        }
        if self.max_concurrency == 0 {
            return Err(StorageError::validation(
                "upload concurrency must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a multipart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Completing,
    Committed,
    Aborted,
}

/// Client-side record of one multipart upload session.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Backend session id.
    pub upload_id: String,
    /// Destination key.
    pub key: String,
    /// Bytes per part.
    pub part_size: u64,
    /// Parts acknowledged so far, in completion order.
    pub parts: Vec<CompletedPart>,
    /// Current state.
    pub state: SessionState,
}

impl UploadSession {
    /// Start tracking an open session.
    pub fn new(key: impl Into<String>, upload_id: impl Into<String>, part_size: u64) -> Self {
        Self {
            upload_id: upload_id.into(),
            key: key.into(),
            part_size,
            parts: Vec::new(),
            state: SessionState::Open,
        }
    }

    /// Record an acknowledged part. Only allowed while the session is open.
    pub fn record_part(&mut self, part: CompletedPart) -> Result<(), StorageError> {
        if self.state != SessionState::Open {
            return Err(StorageError::validation(format!(
                "cannot add part {} to {:?} session {}",
                part.part_number, self.state, self.upload_id
            )));
        }
        self.parts.push(part);
        Ok(())
    }

    /// Sum of acknowledged part sizes.
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    /// Parts sorted ascending by part number.
    pub fn sorted_parts(&self) -> Vec<CompletedPart> {
        let mut parts: Vec<CompletedPart> = self.parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// Move to `Completing` and return the part list to commit.
    ///
    /// # Errors
    /// Fails if the session is not open, has no parts, or its part numbers
    /// are not exactly `1..=n`.
    pub fn begin_commit(&mut self) -> Result<Vec<CompletedPart>, StorageError> {
        if self.state != SessionState::Open {
            return Err(StorageError::validation(format!(
                "cannot commit {:?} session {}",
                self.state, self.upload_id
            )));
        }
        if self.parts.is_empty() {
            return Err(StorageError::EmptyUpload {
                key: self.key.clone(),
            });
        }

        let parts: Vec<CompletedPart> = self.sorted_parts();
        for (expected, part) in (1u32..).zip(parts.iter()) {
            if part.part_number != expected {
                return Err(StorageError::Upload {
                    code: "InvalidPartOrder".into(),
                    message: format!(
                        "expected part {} but found part {} in session {}",
                        expected, part.part_number, self.upload_id
                    ),
                });
            }
        }

        self.state = SessionState::Completing;
        Ok(parts)
    }
}

/// Streams an `AsyncRead` into a multipart session.
pub struct ChunkedUploader<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    options: UploadOptions,
    retry: RetryExecutor,
}

impl<'a, S: ObjectStore + ?Sized> ChunkedUploader<'a, S> {
    /// Create an uploader with default options.
    pub fn new(store: &'a S) -> Self {
        let options: UploadOptions = UploadOptions::default();
        let retry: RetryExecutor = RetryExecutor::new(options.retry.clone());
        Self {
            store,
            options,
            retry,
        }
    }

    /// Set upload options.
    pub fn with_options(mut self, options: UploadOptions) -> Self {
        self.retry = RetryExecutor::new(options.retry.clone());
        self.options = options;
        self
    }

    /// Options in use.
    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Upload everything `source` produces to `key`.
    ///
    /// # Arguments
    /// * `source` - Byte source, read until EOF
    /// * `key` - Destination key
    /// * `progress` - Receives byte counts; its token cancels the upload
    ///
    /// # Returns
    /// Committed byte count, SHA-256 digest, and part count.
    pub async fn upload<R>(
        &self,
        source: R,
        key: &str,
        progress: &TransferProgress,
    ) -> Result<UploadOutcome, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.options.validate()?;
        if !is_valid_part_size(self.options.part_size) {
            log::warn!(
                "Part size {} for {} is below the multipart minimum; backends may reject it",
                self.options.part_size,
                key
            );
        }

        let upload_id: String = self
            .retry
            .execute("create_multipart", || {
                self.store.create_multipart(key, &self.options.metadata)
            })
            .await?;
        if upload_id.trim().is_empty() {
            return Err(StorageError::UploadInitiation {
                key: key.to_string(),
                message: "backend returned an empty upload id".into(),
            });
        }

        let mut session: UploadSession =
            UploadSession::new(key, upload_id, self.options.part_size);
        log::debug!("Opened upload session {} for {}", session.upload_id, key);

        let streamed: Result<(u64, String), StorageError> = {
            let _stall: StallGuard = StallMonitor::spawn(progress, self.options.stall_timeout);
            tokio::select! {
                biased;
                _ = progress.cancelled() => Err(progress.cancellation_error()),
                result = self.upload_parts(source, &mut session, progress) => result,
            }
        };

        let (uploaded_bytes, digest_hex): (u64, String) = match streamed {
            Ok(done) => done,
            Err(e) => {
                self.abort(&mut session).await;
                return Err(e);
            }
        };

        if let Err(e) = self.commit(&mut session).await {
            self.abort(&mut session).await;
            return Err(e);
        }

        progress.finish();
        Ok(UploadOutcome {
            key: key.to_string(),
            uploaded_bytes,
            digest_hex,
            part_count: session.parts.len() as u32,
        })
    }

    /// Read, hash, and upload every part. Returns bytes read and digest.
    async fn upload_parts<R>(
        &self,
        mut source: R,
        session: &mut UploadSession,
        progress: &TransferProgress,
    ) -> Result<(u64, String), StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key: String = session.key.clone();
        let upload_id: String = session.upload_id.clone();
        let part_size: u64 = self.options.part_size;
        let max_concurrency: usize = self.options.max_concurrency;

        let mut hasher: Sha256Hasher = Sha256Hasher::new();
        let mut next_part: u32 = 1;
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() >= max_concurrency {
                if let Some(result) = in_flight.next().await {
                    session.record_part(result?)?;
                }
            }

            let data: Vec<u8> = read_part(&mut source, part_size, progress).await?;
            if data.is_empty() {
                break;
            }
            if next_part > MAX_MULTIPART_PARTS {
                return Err(StorageError::validation(format!(
                    "{} exceeds {} parts of {} bytes",
                    key, MAX_MULTIPART_PARTS, part_size
                )));
            }

            let short_read: bool = (data.len() as u64) < part_size;
            hasher.update(&data);

            in_flight.push(self.upload_one(&key, &upload_id, next_part, Bytes::from(data), progress));
            next_part += 1;

            if short_read {
                break;
            }
        }

        while let Some(result) = in_flight.next().await {
            session.record_part(result?)?;
        }

        let total_read: u64 = hasher.bytes_hashed();
        if total_read == 0 {
            match self.options.empty_object {
                EmptyObjectPolicy::Reject => {
                    return Err(StorageError::EmptyUpload { key: key.clone() });
                }
                EmptyObjectPolicy::Allow => {
                    let part: CompletedPart = self
                        .upload_one(&key, &upload_id, 1, Bytes::new(), progress)
                        .await?;
                    session.record_part(part)?;
                }
            }
        }

        let uploaded: u64 = session.uploaded_bytes();
        if uploaded != total_read {
            return Err(StorageError::SizeMismatch {
                key: key.clone(),
                expected: total_read,
                actual: uploaded,
            });
        }

        Ok((total_read, hasher.finish_hex()))
    }

    async fn upload_one(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        progress: &TransferProgress,
    ) -> Result<CompletedPart, StorageError> {
        let size: u64 = data.len() as u64;
        let etag: String = self
            .retry
            .execute("upload_part", || {
                self.store
                    .upload_part(key, upload_id, part_number, data.clone())
            })
            .await?;

        progress.add(size);
        log::debug!("Uploaded part {} ({} bytes) of {}", part_number, size, key);

        Ok(CompletedPart {
            part_number,
            etag,
            size,
        })
    }

    async fn commit(&self, session: &mut UploadSession) -> Result<(), StorageError> {
        let parts: Vec<CompletedPart> = session.begin_commit()?;
        let key: &str = &session.key;
        let upload_id: &str = &session.upload_id;

        self.retry
            .execute("complete_multipart", || {
                self.store.complete_multipart(key, upload_id, &parts)
            })
            .await?;

        session.state = SessionState::Committed;
        log::debug!("Committed {} parts to {}", parts.len(), session.key);
        Ok(())
    }

    /// Best-effort abort. Failures are logged, never returned.
    async fn abort(&self, session: &mut UploadSession) {
        let key: &str = &session.key;
        let upload_id: &str = &session.upload_id;

        if let Err(e) = self
            .retry
            .execute("abort_multipart", || self.store.abort_multipart(key, upload_id))
            .await
        {
            log::warn!("Failed to abort upload {} for {}: {}", upload_id, key, e);
        }
        session.state = SessionState::Aborted;
    }
}

/// Read up to `part_size` bytes. Returns fewer only at end of input.
///
/// Every non-empty read refreshes the stall clock.
async fn read_part<R>(
    source: &mut R,
    part_size: u64,
    progress: &TransferProgress,
) -> Result<Vec<u8>, StorageError>
where
    R: AsyncRead + Unpin,
{
    let capacity: usize = part_size.min(DEFAULT_UPLOAD_CHUNK_SIZE) as usize;
    let mut buffer: Vec<u8> = Vec::with_capacity(capacity);
    let mut scratch: Vec<u8> = vec![0u8; capacity.clamp(1, READ_BUFFER_SIZE)];

    while (buffer.len() as u64) < part_size {
        let wanted: usize = (part_size - buffer.len() as u64).min(scratch.len() as u64) as usize;
        let n: usize = source.read(&mut scratch[..wanted]).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&scratch[..n]);
        progress.touch();
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(part_number: u32, size: u64) -> CompletedPart {
        CompletedPart {
            part_number,
            etag: format!("etag-{part_number}"),
            size,
        }
    }

    #[test]
    fn test_options_builder() {
        let options: UploadOptions = UploadOptions::new()
            .with_part_size(5 * 1024 * 1024)
            .with_max_concurrency(4)
            .with_empty_object(EmptyObjectPolicy::Allow)
            .with_metadata("artifact-name", "dist.zip");

        assert_eq!(options.part_size, 5 * 1024 * 1024);
        assert_eq!(options.max_concurrency, 4);
        assert_eq!(options.empty_object, EmptyObjectPolicy::Allow);
        assert_eq!(options.metadata["artifact-name"], "dist.zip");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_reject_zero_values() {
        assert!(UploadOptions::new().with_part_size(0).validate().is_err());
        assert!(UploadOptions::new().with_max_concurrency(0).validate().is_err());
    }

    #[test]
    fn test_session_commit_sorts_parts() {
        let mut session: UploadSession = UploadSession::new("k", "u-1", 8);
        session.record_part(part(3, 4)).unwrap();
        session.record_part(part(1, 8)).unwrap();
        session.record_part(part(2, 8)).unwrap();

        let parts: Vec<CompletedPart> = session.begin_commit().unwrap();
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(session.uploaded_bytes(), 20);
        assert_eq!(session.state, SessionState::Completing);
    }

    #[test]
    fn test_session_rejects_gap() {
        let mut session: UploadSession = UploadSession::new("k", "u-1", 8);
        session.record_part(part(1, 8)).unwrap();
        session.record_part(part(3, 8)).unwrap();

        assert!(matches!(
            session.begin_commit(),
            Err(StorageError::Upload { .. })
        ));
        assert_eq!(session.state, SessionState::Open);
    }

    #[test]
    fn test_session_rejects_empty_commit() {
        let mut session: UploadSession = UploadSession::new("k", "u-1", 8);
        assert!(matches!(
            session.begin_commit(),
            Err(StorageError::EmptyUpload { .. })
        ));
    }

    #[test]
    fn test_session_parts_append_only_while_open() {
        let mut session: UploadSession = UploadSession::new("k", "u-1", 8);
        session.record_part(part(1, 8)).unwrap();
        session.begin_commit().unwrap();
        assert!(session.record_part(part(2, 8)).is_err());
    }

    #[tokio::test]
    async fn test_read_part_stops_at_part_size() {
        let data: Vec<u8> = (0..25u8).collect();
        let mut source: &[u8] = &data;
        let tracker: TransferProgress =
            TransferProgress::new(crate::types::OperationType::Uploading, "t", 25);

        let first: Vec<u8> = read_part(&mut source, 10, &tracker).await.unwrap();
        let second: Vec<u8> = read_part(&mut source, 10, &tracker).await.unwrap();
        let third: Vec<u8> = read_part(&mut source, 10, &tracker).await.unwrap();
        let fourth: Vec<u8> = read_part(&mut source, 10, &tracker).await.unwrap();

        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
        assert_eq!(third, (20..25u8).collect::<Vec<u8>>());
        assert!(fourth.is_empty());
    }
}
