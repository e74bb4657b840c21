//! AWS SDK S3 backend for the artifact cache.
//!
//! Provides [`S3ObjectStore`], an [`ObjectStore`] over a single bucket, and
//! [`connect`] to build an [`ArtifactStore`] on top of it.
//!
//! # Example
//!
//! ```ignore
//! use artifact_cache_storage::StorageSettings;
//! use artifact_cache_storage_s3::connect;
//!
//! let store = connect(StorageSettings::from_env()?).await?;
//! let mut handle = store.create_artifact("dist.zip")?;
//! store.upload_artifact_file(&mut handle, Path::new("dist.zip")).await?;
//! let record = store.finalize_artifact(&mut handle).await?;
//! ```
//!
//! [`ObjectStore`]: artifact_cache_storage::ObjectStore

use std::sync::Arc;

use artifact_cache_storage::{ArtifactStore, StorageError, StorageSettings};

mod client;
mod error;

pub use client::S3ObjectStore;
pub use error::{classify_error_code, S3Error};

/// Artifact store backed by S3.
pub type S3ArtifactStore = ArtifactStore<S3ObjectStore>;

/// Build an S3-backed [`ArtifactStore`] from settings.
pub async fn connect(settings: StorageSettings) -> Result<S3ArtifactStore, StorageError> {
    let backend: S3ObjectStore = S3ObjectStore::new(&settings).await?;
    ArtifactStore::new(Arc::new(backend), settings)
}
