//! Multipart transfer and cache-resolution engine for CI artifacts and build
//! caches.
//!
//! This crate moves large blobs to and from any backend implementing
//! [`ObjectStore`]:
//!
//! - **Uploads** - fixed-size parts streamed from an `AsyncRead`, uploaded
//!   with bounded concurrency, hashed on the fly, committed in part order
//! - **Downloads** - streaming or parallel ranged fetches, verified against
//!   size and SHA-256 digest
//! - **Retries** - exponential backoff driven by tagged error kinds
//! - **Stall detection** - transfers that stop moving are cancelled
//! - **Cache resolution** - exact key first, then restore-key prefixes in
//!   caller order, newest entry wins
//!
//! [`ArtifactStore`] ties these together behind artifact and cache
//! operations. Backends are injected; see the `artifact-cache-storage-s3`
//! crate for the S3 implementation.

pub mod artifact;
pub mod cache;
mod chunking;
pub mod config;
pub mod download;
mod error;
pub mod progress;
pub mod retention;
pub mod retry;
mod traits;
mod types;
pub mod upload;

pub use artifact::{
    validate_artifact_name, ArtifactRecord, ArtifactStore, CacheOptions, DownloadArtifactOptions,
    GetArtifactOptions, HandleState, UploadHandle, METADATA_ARTIFACT_ID, METADATA_ARTIFACT_NAME,
    METADATA_CACHE_KEY, METADATA_CACHE_VERSION,
};
pub use cache::{
    compute_cache_version, select_most_recent, validate_cache_key, CacheEntry, CacheKeyResolver,
    CompressionMethod, Platform,
};
pub use chunking::{
    download_strategy, expected_chunk_count, generate_chunks, is_valid_part_size, ChunkInfo,
    DownloadStrategy,
};
pub use config::{AwsCredentials, StorageSettings};
pub use download::{ChunkedDownloader, DownloadOptions};
pub use error::{StorageError, TransientKind};
pub use progress::{
    format_bytes, LogProgress, ProgressSnapshot, StallGuard, StallMonitor, TransferProgress,
};
pub use retention::{expiry_from, parse_retention_days, validate_retention_days};
pub use retry::{RetryExecutor, RetryPolicy, RetrySettings};
pub use traits::{
    ByteChunkStream, ByteRange, ObjectInfo, ObjectMetadata, ObjectStore, PresignRequest,
};
pub use types::{
    Blob, CompletedPart, DataDestination, DownloadOutcome, OperationType, UploadOutcome,
    METADATA_SHA256,
};
pub use upload::{ChunkedUploader, EmptyObjectPolicy, SessionState, UploadOptions, UploadSession};
