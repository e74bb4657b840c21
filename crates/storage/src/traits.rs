//! Object-store capability implemented by each backend.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::StorageError;
use crate::types::CompletedPart;

/// Stream of body chunks returned by [`ObjectStore::get`].
pub type ByteChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset (inclusive).
    pub start: u64,
    /// One past the last byte offset.
    pub end: u64,
}

impl ByteRange {
    /// Create a range covering `[start, end)`.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// HTTP `Range` header value. HTTP ranges are inclusive on both ends.
    pub fn to_http_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// Information about an object from list operations.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modified timestamp.
    pub last_modified: Option<DateTime<Utc>>,
    /// ETag as reported by the backend.
    pub etag: Option<String>,
}

/// Metadata returned by [`ObjectStore::head`].
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    /// Object size in bytes.
    pub size: u64,
    /// Last modified timestamp.
    pub last_modified: Option<DateTime<Utc>>,
    /// Content type recorded at upload.
    pub content_type: Option<String>,
    /// ETag as reported by the backend.
    pub etag: Option<String>,
    /// User metadata recorded at upload.
    pub user_metadata: HashMap<String, String>,
}

/// Kind of presigned URL to mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresignRequest {
    /// Download URL.
    Get { key: String },
    /// Single-request upload URL.
    Put { key: String },
}

impl PresignRequest {
    /// Key the URL grants access to.
    pub fn key(&self) -> &str {
        match self {
            PresignRequest::Get { key } | PresignRequest::Put { key } => key,
        }
    }
}

/// Object-store operations. Implemented by each backend and injected into the
/// transfer engine; nothing in this crate talks to a backend any other way.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch object metadata. Returns `None` if the object doesn't exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, StorageError>;

    /// Stream an object body, optionally restricted to `range`.
    ///
    /// # Errors
    /// `StorageError::NotFound` if the object doesn't exist.
    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteChunkStream, StorageError>;

    /// Store a small object in a single request.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Open a multipart upload session and return its upload id.
    async fn create_multipart(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, StorageError>;

    /// Upload one part of a session and return the part's ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StorageError>;

    /// Commit a session. `parts` must be sorted by part number.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError>;

    /// Abandon a session and discard its uploaded parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    /// Mint a time-limited URL for `request`.
    async fn presign(&self, request: &PresignRequest, ttl: Duration)
        -> Result<String, StorageError>;
}
