//! Shared data structures for storage operations.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::traits::ObjectMetadata;

/// User metadata key holding the SHA-256 digest of a committed blob.
pub const METADATA_SHA256: &str = "sha256";

/// One part of a multipart upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,
    /// ETag returned by the backend for this part.
    pub etag: String,
    /// Part size in bytes.
    pub size: u64,
}

/// A committed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256, when recorded.
    pub digest: Option<String>,
    /// Commit time.
    pub created_at: DateTime<Utc>,
    /// User metadata.
    pub metadata: HashMap<String, String>,
}

impl Blob {
    /// Build a blob description from head metadata.
    ///
    /// Missing timestamps fall back to `now`.
    pub fn from_metadata(key: impl Into<String>, meta: ObjectMetadata, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            size: meta.size,
            digest: meta.user_metadata.get(METADATA_SHA256).cloned(),
            created_at: meta.last_modified.unwrap_or(now),
            metadata: meta.user_metadata,
        }
    }
}

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Destination key.
    pub key: String,
    /// Total bytes committed.
    pub uploaded_bytes: u64,
    /// SHA-256 of the committed bytes.
    pub digest_hex: String,
    /// Number of parts in the committed session.
    pub part_count: u32,
}

/// Where downloaded data should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataDestination {
    /// Write to a local file. Parent directories are created.
    File(PathBuf),
    /// Collect into memory.
    Memory,
}

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Source key.
    pub key: String,
    /// Total bytes written.
    pub bytes_written: u64,
    /// SHA-256 of the written bytes.
    pub digest_hex: String,
    /// Downloaded bytes for [`DataDestination::Memory`].
    pub data: Option<Vec<u8>>,
    /// Written file for [`DataDestination::File`].
    pub path: Option<PathBuf>,
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Uploading,
    Downloading,
}

impl OperationType {
    /// Verb used in progress lines.
    pub fn verb(&self) -> &'static str {
        match self {
            OperationType::Uploading => "Uploaded",
            OperationType::Downloading => "Downloaded",
        }
    }
}
