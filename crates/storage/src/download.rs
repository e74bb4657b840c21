//! Chunked download with integrity verification.
//!
//! Objects are fetched either as one streaming GET or as contiguous ranged
//! GETs in parallel. Ranged writes land at their exact offset so completion
//! order does not matter. Every download is checked against the size from
//! `head` and, when one is known, the SHA-256 digest.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use artifact_cache_common::{
    default_concurrency_for_host, hash_bytes, hash_file, DEFAULT_ARTIFACT_STALL_TIMEOUT_SECS,
    DEFAULT_DOWNLOAD_TIMEOUT_SECS, DEFAULT_UPLOAD_CHUNK_SIZE,
};
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::chunking::{download_strategy, generate_chunks, ChunkInfo, DownloadStrategy};
use crate::error::{StorageError, TransientKind};
use crate::progress::TransferProgress;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::traits::{ByteChunkStream, ByteRange, ObjectMetadata, ObjectStore};
use crate::types::{DataDestination, DownloadOutcome, METADATA_SHA256};

/// Options for download operations.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Maximum ranged requests in flight.
    pub max_concurrency: usize,
    /// Bytes per ranged request.
    pub range_size: u64,
    /// Abort an attempt if no bytes arrive for this long.
    pub idle_timeout: Duration,
    /// Deadline for the whole download, retries included.
    pub overall_timeout: Duration,
    /// Retry policy for each backend call.
    pub retry: RetryPolicy,
    /// Check the SHA-256 digest when one is known.
    pub verify_digest: bool,
    /// Digest to verify against. Falls back to the object's `sha256` metadata.
    pub expected_digest: Option<String>,
    /// Force a strategy instead of choosing by size.
    pub strategy: Option<DownloadStrategy>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency_for_host(),
            range_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            idle_timeout: Duration::from_secs(DEFAULT_ARTIFACT_STALL_TIMEOUT_SECS),
            overall_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            retry: RetryPolicy::transient(),
            verify_digest: true,
            expected_digest: None,
            strategy: None,
        }
    }
}

impl DownloadOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrency for ranged downloads.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set bytes per ranged request.
    pub fn with_range_size(mut self, range_size: u64) -> Self {
        self.range_size = range_size;
        self
    }

    /// Set the per-attempt idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the whole-download deadline.
    pub fn with_overall_timeout(mut self, overall_timeout: Duration) -> Self {
        self.overall_timeout = overall_timeout;
        self
    }

    /// Set the per-call retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable digest verification.
    pub fn with_verify_digest(mut self, verify: bool) -> Self {
        self.verify_digest = verify;
        self
    }

    /// Set the digest to verify against.
    pub fn with_expected_digest(mut self, digest: impl Into<String>) -> Self {
        self.expected_digest = Some(digest.into());
        self
    }

    /// Force a download strategy.
    pub fn with_strategy(mut self, strategy: DownloadStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.max_concurrency == 0 {
            return Err(StorageError::validation(
                "download concurrency must be greater than zero",
            ));
        }
        if self.range_size == 0 {
            return Err(StorageError::validation("range size must be greater than zero"));
        }
        Ok(())
    }
}

/// Destination that accepts writes at arbitrary offsets.
enum DownloadSink {
    File {
        path: PathBuf,
        file: tokio::sync::Mutex<tokio::fs::File>,
    },
    Memory(std::sync::Mutex<Vec<u8>>),
}

impl DownloadSink {
    async fn open(destination: &DataDestination) -> Result<Self, StorageError> {
        match destination {
            DataDestination::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| StorageError::io(parent.display(), e))?;
                    }
                }
                let file: tokio::fs::File = tokio::fs::File::create(path)
                    .await
                    .map_err(|e| StorageError::io(path.display(), e))?;
                Ok(DownloadSink::File {
                    path: path.clone(),
                    file: tokio::sync::Mutex::new(file),
                })
            }
            DataDestination::Memory => Ok(DownloadSink::Memory(std::sync::Mutex::new(Vec::new()))),
        }
    }

    async fn preallocate(&self, size: u64) -> Result<(), StorageError> {
        match self {
            DownloadSink::File { path, file } => file
                .lock()
                .await
                .set_len(size)
                .await
                .map_err(|e| StorageError::io(path.display(), e)),
            DownloadSink::Memory(buffer) => {
                let mut buffer = lock_buffer(buffer)?;
                buffer.resize(size as usize, 0);
                Ok(())
            }
        }
    }

    async fn reset(&self) -> Result<(), StorageError> {
        self.preallocate(0).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        match self {
            DownloadSink::File { path, file } => {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(|e| StorageError::io(path.display(), e))?;
                file.write_all(data)
                    .await
                    .map_err(|e| StorageError::io(path.display(), e))
            }
            DownloadSink::Memory(buffer) => {
                let mut buffer = lock_buffer(buffer)?;
                let start: usize = offset as usize;
                let end: usize = start + data.len();
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[start..end].copy_from_slice(data);
                Ok(())
            }
        }
    }

    /// Flush and compute the digest of everything written.
    async fn finish(self) -> Result<(Option<Vec<u8>>, Option<PathBuf>, String), StorageError> {
        match self {
            DownloadSink::File { path, file } => {
                let mut file: tokio::fs::File = file.into_inner();
                file.flush()
                    .await
                    .map_err(|e| StorageError::io(path.display(), e))?;
                drop(file);

                let hash_path: PathBuf = path.clone();
                let digest: String = tokio::task::spawn_blocking(move || hash_file(&hash_path))
                    .await
                    .map_err(|e| StorageError::Io {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })?
                    .map_err(|e| StorageError::io(path.display(), e))?;
                Ok((None, Some(path), digest))
            }
            DownloadSink::Memory(buffer) => {
                let data: Vec<u8> = buffer.into_inner().map_err(|_| StorageError::Io {
                    path: "<memory>".into(),
                    message: "download buffer lock poisoned".into(),
                })?;
                let digest: String = hash_bytes(&data);
                Ok((Some(data), None, digest))
            }
        }
    }
}

fn lock_buffer(
    buffer: &std::sync::Mutex<Vec<u8>>,
) -> Result<std::sync::MutexGuard<'_, Vec<u8>>, StorageError> {
    buffer.lock().map_err(|_| StorageError::Io {
        path: "<memory>".into(),
        message: "download buffer lock poisoned".into(),
    })
}

/// Fetches objects into a [`DataDestination`].
pub struct ChunkedDownloader<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    options: DownloadOptions,
    retry: RetryExecutor,
}

impl<'a, S: ObjectStore + ?Sized> ChunkedDownloader<'a, S> {
    /// Create a downloader with default options.
    pub fn new(store: &'a S) -> Self {
        let options: DownloadOptions = DownloadOptions::default();
        let retry: RetryExecutor = RetryExecutor::new(options.retry.clone());
        Self {
            store,
            options,
            retry,
        }
    }

    /// Set download options.
    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.retry = RetryExecutor::new(options.retry.clone());
        self.options = options;
        self
    }

    /// Options in use.
    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Download `key` into `destination`.
    ///
    /// # Arguments
    /// * `key` - Source key
    /// * `destination` - File path or memory
    /// * `progress` - Receives byte counts; its token cancels the download
    ///
    /// # Errors
    /// `NotFound` if the object doesn't exist, `SizeMismatch` or
    /// `DigestMismatch` on verification failure, `Timeout` when the overall
    /// deadline passes.
    pub async fn download(
        &self,
        key: &str,
        destination: DataDestination,
        progress: &TransferProgress,
    ) -> Result<DownloadOutcome, StorageError> {
        self.options.validate()?;

        let meta: ObjectMetadata = self
            .retry
            .execute("head", || self.store.head(key))
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        progress.set_total(meta.size);

        // An empty object has no satisfiable range.
        let strategy: DownloadStrategy = match self.options.strategy {
            Some(DownloadStrategy::Ranged) if meta.size == 0 => DownloadStrategy::Streaming,
            Some(forced) => forced,
            None => download_strategy(Some(meta.size), self.options.range_size),
        };
        let expected_digest: Option<String> = self
            .options
            .expected_digest
            .clone()
            .or_else(|| meta.user_metadata.get(METADATA_SHA256).cloned());

        let sink: DownloadSink = DownloadSink::open(&destination).await?;
        let overall: Duration = self.options.overall_timeout;

        let transferred: Result<u64, StorageError> = tokio::select! {
            biased;
            _ = progress.cancelled() => Err(progress.cancellation_error()),
            _ = tokio::time::sleep(overall) => {
                progress.cancel();
                Err(StorageError::Timeout {
                    operation: format!("download of {}", key),
                    after: overall,
                })
            }
            result = self.transfer(key, meta.size, strategy, &sink, progress) => result,
        };

        let verified: Result<DownloadOutcome, StorageError> = match transferred {
            Ok(written) => self.verify(key, &meta, written, expected_digest, sink).await,
            Err(e) => Err(e),
        };

        if verified.is_err() {
            if let DataDestination::File(path) = &destination {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    log::debug!("Could not remove partial download {}: {}", path.display(), e);
                }
            }
        } else {
            progress.finish();
        }
        verified
    }

    async fn transfer(
        &self,
        key: &str,
        size: u64,
        strategy: DownloadStrategy,
        sink: &DownloadSink,
        progress: &TransferProgress,
    ) -> Result<u64, StorageError> {
        match strategy {
            DownloadStrategy::Streaming => self.stream_whole(key, sink, progress).await,
            DownloadStrategy::Ranged => self.fetch_ranges(key, size, sink, progress).await,
        }
    }

    /// Single GET piped to the sink. A stalled attempt restarts from byte 0.
    async fn stream_whole(
        &self,
        key: &str,
        sink: &DownloadSink,
        progress: &TransferProgress,
    ) -> Result<u64, StorageError> {
        let store: &S = self.store;
        let idle: Duration = self.options.idle_timeout;

        self.retry
            .execute("get", move || async move {
                sink.reset().await?;
                let mut body: ByteChunkStream = store.get(key, None).await?;
                let mut written: u64 = 0;

                while let Some(chunk) = next_chunk(&mut body, idle, key).await? {
                    sink.write_at(written, &chunk).await?;
                    written += chunk.len() as u64;
                    progress.advance(written);
                }
                Ok(written)
            })
            .await
    }

    /// Contiguous ranged GETs with bounded concurrency.
    async fn fetch_ranges(
        &self,
        key: &str,
        size: u64,
        sink: &DownloadSink,
        progress: &TransferProgress,
    ) -> Result<u64, StorageError> {
        sink.preallocate(size).await?;

        let chunks: Vec<ChunkInfo> = generate_chunks(size, self.options.range_size);
        let mut fetches = stream::iter(chunks)
            .map(|chunk| self.fetch_range(key, chunk, sink, progress))
            .buffer_unordered(self.options.max_concurrency);

        let mut written: u64 = 0;
        while let Some(result) = fetches.next().await {
            written += result?;
        }
        Ok(written)
    }

    async fn fetch_range(
        &self,
        key: &str,
        chunk: ChunkInfo,
        sink: &DownloadSink,
        progress: &TransferProgress,
    ) -> Result<u64, StorageError> {
        let store: &S = self.store;
        let idle: Duration = self.options.idle_timeout;
        let range: ByteRange = chunk.range();

        let received: u64 = self
            .retry
            .execute("get_range", move || async move {
                let mut body: ByteChunkStream = store.get(key, Some(range)).await?;
                let mut received: u64 = 0;

                while let Some(piece) = next_chunk(&mut body, idle, key).await? {
                    let piece_len: u64 = piece.len() as u64;
                    if received + piece_len > range.len() {
                        return Err(StorageError::SizeMismatch {
                            key: format!("{} ({})", key, range.to_http_header()),
                            expected: range.len(),
                            actual: received + piece_len,
                        });
                    }
                    sink.write_at(range.start + received, &piece).await?;
                    received += piece_len;
                    progress.touch();
                }
                Ok(received)
            })
            .await?;

        if received != range.len() {
            return Err(StorageError::SizeMismatch {
                key: format!("{} ({})", key, range.to_http_header()),
                expected: range.len(),
                actual: received,
            });
        }

        progress.add(received);
        log::debug!("Fetched range {} of {}", range.to_http_header(), key);
        Ok(received)
    }

    async fn verify(
        &self,
        key: &str,
        meta: &ObjectMetadata,
        written: u64,
        expected_digest: Option<String>,
        sink: DownloadSink,
    ) -> Result<DownloadOutcome, StorageError> {
        if written != meta.size {
            return Err(StorageError::SizeMismatch {
                key: key.to_string(),
                expected: meta.size,
                actual: written,
            });
        }

        let (data, path, digest_hex) = sink.finish().await?;

        if self.options.verify_digest {
            if let Some(expected) = expected_digest {
                if !expected.eq_ignore_ascii_case(&digest_hex) {
                    return Err(StorageError::DigestMismatch {
                        key: key.to_string(),
                        expected,
                        actual: digest_hex,
                    });
                }
            }
        }

        Ok(DownloadOutcome {
            key: key.to_string(),
            bytes_written: written,
            digest_hex,
            data,
            path,
        })
    }
}

/// Next body chunk, or a transient timeout if none arrives within `idle`.
async fn next_chunk(
    body: &mut ByteChunkStream,
    idle: Duration,
    key: &str,
) -> Result<Option<bytes::Bytes>, StorageError> {
    match tokio::time::timeout(idle, body.next()).await {
        Ok(Some(chunk)) => chunk.map(Some),
        Ok(None) => Ok(None),
        Err(_) => Err(StorageError::transient(
            TransientKind::Timeout,
            format!("no data received from {} for {:?}", key, idle),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options: DownloadOptions = DownloadOptions::new()
            .with_max_concurrency(4)
            .with_range_size(1024)
            .with_expected_digest("abc")
            .with_strategy(DownloadStrategy::Ranged);

        assert_eq!(options.max_concurrency, 4);
        assert_eq!(options.range_size, 1024);
        assert_eq!(options.expected_digest.as_deref(), Some("abc"));
        assert_eq!(options.strategy, Some(DownloadStrategy::Ranged));
        assert!(options.validate().is_ok());
        assert!(DownloadOptions::new().with_range_size(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_memory_sink_out_of_order_writes() {
        let sink: DownloadSink = DownloadSink::open(&DataDestination::Memory).await.unwrap();
        sink.preallocate(6).await.unwrap();
        sink.write_at(3, b"def").await.unwrap();
        sink.write_at(0, b"abc").await.unwrap();

        let (data, path, digest) = sink.finish().await.unwrap();
        assert_eq!(data.unwrap(), b"abcdef");
        assert!(path.is_none());
        assert_eq!(digest, hash_bytes(b"abcdef"));
    }

    #[tokio::test]
    async fn test_file_sink_creates_parents_and_writes_at_offsets() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let target: PathBuf = dir.path().join("nested/out/archive.bin");

        let sink: DownloadSink = DownloadSink::open(&DataDestination::File(target.clone()))
            .await
            .unwrap();
        sink.preallocate(6).await.unwrap();
        sink.write_at(3, b"def").await.unwrap();
        sink.write_at(0, b"abc").await.unwrap();

        let (data, path, digest) = sink.finish().await.unwrap();
        assert!(data.is_none());
        assert_eq!(path.unwrap(), target);
        assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");
        assert_eq!(digest, hash_bytes(b"abcdef"));
    }

    #[tokio::test]
    async fn test_sink_reset_discards_previous_attempt() {
        let sink: DownloadSink = DownloadSink::open(&DataDestination::Memory).await.unwrap();
        sink.write_at(0, b"partial-attempt").await.unwrap();
        sink.reset().await.unwrap();
        sink.write_at(0, b"ok").await.unwrap();

        let (data, _, _) = sink.finish().await.unwrap();
        assert_eq!(data.unwrap(), b"ok");
    }
}
