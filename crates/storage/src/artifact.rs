//! Artifact and build-cache operations over an injected object store.
//!
//! [`ArtifactStore`] is the entry point callers use. It lays out keys under
//! the configured root prefix, drives the chunked uploader and downloader
//! with settings-derived options, and keeps a JSON record per finalized
//! artifact so artifacts can be found by name.
//!
//! Key layout:
//! - `{root}/artifacts/{id}/{name}` - artifact blob
//! - `{root}/records/{id}.json` - artifact record
//! - `{root}/cache/{key}:{version}` - cache archive
//! - `{root}/cache-digests/{key}:{version}` - SHA-256 of the cache archive

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use artifact_cache_common::{join_within_root, MAX_ARTIFACT_NAME_LENGTH};

use crate::cache::{
    compute_cache_version, validate_cache_key, CacheEntry, CacheKeyResolver, CompressionMethod,
    Platform,
};
use crate::config::StorageSettings;
use crate::download::{ChunkedDownloader, DownloadOptions};
use crate::error::StorageError;
use crate::progress::{LogProgress, TransferProgress};
use crate::retention::expiry_from;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::traits::{ByteChunkStream, ObjectInfo, ObjectMetadata, ObjectStore, PresignRequest};
use crate::types::{
    Blob, DataDestination, DownloadOutcome, OperationType, UploadOutcome, METADATA_SHA256,
};
use crate::upload::{ChunkedUploader, UploadOptions};

/// Metadata key holding the artifact id on artifact blobs.
pub const METADATA_ARTIFACT_ID: &str = "artifact-id";
/// Metadata key holding the artifact name on artifact blobs.
pub const METADATA_ARTIFACT_NAME: &str = "artifact-name";
/// Metadata key holding the cache key on cache archives.
pub const METADATA_CACHE_KEY: &str = "cache-key";
/// Metadata key holding the version fingerprint on cache archives.
pub const METADATA_CACHE_VERSION: &str = "cache-version";

const RECORD_CONTENT_TYPE: &str = "application/json";
const DIGEST_CONTENT_TYPE: &str = "text/plain";

/// Characters not allowed in artifact names.
const INVALID_NAME_CHARS: [char; 10] = ['"', ':', '<', '>', '|', '*', '?', '\\', '/', '\0'];

/// Finalized artifact, stored as JSON next to the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub name: String,
    /// Object key of the artifact blob.
    pub key: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the blob.
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Where an upload handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Uploaded,
    Finalized,
}

/// An artifact being created. Returned by [`ArtifactStore::create_artifact`].
#[derive(Debug, Clone)]
pub struct UploadHandle {
    pub artifact_id: String,
    pub name: String,
    /// Object key the blob is uploaded to.
    pub key: String,
    state: HandleState,
    outcome: Option<UploadOutcome>,
}

impl UploadHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Result of the upload, once uploaded.
    pub fn outcome(&self) -> Option<&UploadOutcome> {
        self.outcome.as_ref()
    }

    fn expect_state(&self, expected: HandleState) -> Result<(), StorageError> {
        if self.state != expected {
            return Err(StorageError::validation(format!(
                "artifact {} is {:?}, expected {:?}",
                self.name, self.state, expected
            )));
        }
        Ok(())
    }
}

/// Options for [`ArtifactStore::get_artifact`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetArtifactOptions {
    /// Return `NotFound` instead of `None` when nothing matches.
    pub fail_if_not_found: bool,
}

/// Options for [`ArtifactStore::download_artifact`].
#[derive(Debug, Clone)]
pub struct DownloadArtifactOptions {
    /// Directory the artifact is written into, under its own name.
    pub path: PathBuf,
}

/// Options shared by the cache operations.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub compression: CompressionMethod,
    /// Allow archives made on Windows to restore elsewhere and vice versa.
    pub enable_cross_os_archive: bool,
    pub platform: Platform,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::default(),
            enable_cross_os_archive: false,
            platform: Platform::current(),
        }
    }
}

/// Validate an artifact name.
///
/// Names are non-empty, at most 256 characters, and free of path separators
/// and characters that are invalid in file names on common platforms.
pub fn validate_artifact_name(name: &str) -> Result<(), StorageError> {
    if name.trim().is_empty() {
        return Err(StorageError::validation("artifact name must not be empty"));
    }
    if name.chars().count() > MAX_ARTIFACT_NAME_LENGTH {
        return Err(StorageError::validation(format!(
            "artifact name is longer than {} characters",
            MAX_ARTIFACT_NAME_LENGTH
        )));
    }
    if name == "." || name == ".." {
        return Err(StorageError::validation(format!(
            "artifact name {:?} is reserved",
            name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| INVALID_NAME_CHARS.contains(c) || c.is_control())
    {
        return Err(StorageError::validation(format!(
            "artifact name {:?} contains invalid character {:?}",
            name, bad
        )));
    }
    Ok(())
}

fn validate_artifact_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(StorageError::validation(format!("invalid artifact id {:?}", id)));
    }
    Ok(())
}

/// Artifact and cache operations against one bucket.
pub struct ArtifactStore<S: ObjectStore + ?Sized> {
    store: Arc<S>,
    settings: StorageSettings,
    retry: RetryExecutor,
}

impl<S: ObjectStore + ?Sized> ArtifactStore<S> {
    /// Create a store over `store` with `settings`.
    ///
    /// # Errors
    /// Fails if `settings` don't validate.
    pub fn new(store: Arc<S>, settings: StorageSettings) -> Result<Self, StorageError> {
        settings.validate()?;
        let retry: RetryExecutor =
            RetryExecutor::new(RetryPolicy::from_settings(&settings.upload_retry));
        Ok(Self {
            store,
            settings,
            retry,
        })
    }

    /// Settings in use.
    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Underlying object store.
    pub fn object_store(&self) -> &Arc<S> {
        &self.store
    }

    fn artifact_key(&self, id: &str, name: &str) -> String {
        self.settings.prefixed(&format!("artifacts/{}/{}", id, name))
    }

    fn record_key(&self, id: &str) -> String {
        self.settings.prefixed(&format!("records/{}.json", id))
    }

    fn cache_namespace(&self) -> String {
        self.settings.prefixed("cache")
    }

    /// Kept outside the cache namespace so restore-key listings never see it.
    fn cache_digest_key(&self, key: &str, version: &str) -> String {
        self.settings.prefixed(&format!("cache-digests/{}:{}", key, version))
    }

    /// Digest recorded when the cache entry was saved, if any.
    async fn cache_digest(&self, key: &str, version: &str) -> Result<Option<String>, StorageError> {
        let digest_key: String = self.cache_digest_key(key, version);
        Ok(self
            .head(&digest_key)
            .await?
            .and_then(|meta| meta.user_metadata.get(METADATA_SHA256).cloned()))
    }

    fn upload_options(&self, stall_timeout: std::time::Duration) -> UploadOptions {
        UploadOptions::new()
            .with_part_size(self.settings.chunk_size)
            .with_max_concurrency(self.settings.upload_concurrency)
            .with_stall_timeout(stall_timeout)
            .with_retry(RetryPolicy::from_settings(&self.settings.upload_retry))
    }

    fn download_options(&self, idle_timeout: std::time::Duration) -> DownloadOptions {
        DownloadOptions::new()
            .with_max_concurrency(self.settings.download_concurrency)
            .with_range_size(self.settings.chunk_size)
            .with_idle_timeout(idle_timeout)
            .with_overall_timeout(self.settings.download_timeout)
            .with_retry(RetryPolicy::from_settings(&self.settings.download_retry))
    }

    fn cache_resolver(&self) -> CacheKeyResolver<'_, S> {
        CacheKeyResolver::new(&*self.store, self.cache_namespace())
            .with_retry(RetryPolicy::from_settings(&self.settings.download_retry))
    }

    async fn run_upload<R>(
        &self,
        key: &str,
        label: &str,
        reader: R,
        total: u64,
        options: UploadOptions,
    ) -> Result<UploadOutcome, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let progress: TransferProgress = TransferProgress::new(OperationType::Uploading, label, total);
        progress.start_display(self.settings.progress_interval, Arc::new(LogProgress));

        let result: Result<UploadOutcome, StorageError> = ChunkedUploader::new(&*self.store)
            .with_options(options)
            .upload(reader, key, &progress)
            .await;

        progress.stop_display().await;
        result
    }

    async fn run_download(
        &self,
        key: &str,
        label: &str,
        destination: DataDestination,
        options: DownloadOptions,
    ) -> Result<DownloadOutcome, StorageError> {
        let progress: TransferProgress = TransferProgress::new(OperationType::Downloading, label, 0);
        progress.start_display(self.settings.progress_interval, Arc::new(LogProgress));

        let result: Result<DownloadOutcome, StorageError> = ChunkedDownloader::new(&*self.store)
            .with_options(options)
            .download(key, destination, &progress)
            .await;

        progress.stop_display().await;
        result
    }

    async fn read_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let store: &S = &*self.store;
        self.retry
            .execute("get", move || async move {
                let mut body: ByteChunkStream = store.get(key, None).await?;
                let mut data: Vec<u8> = Vec::new();
                while let Some(chunk) = body.next().await {
                    data.extend_from_slice(&chunk?);
                }
                Ok(data)
            })
            .await
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, StorageError> {
        self.retry.execute("head", || self.store.head(key)).await
    }

    // ========================================================================
    // Artifacts
    // ========================================================================

    /// Start a new artifact.
    ///
    /// # Arguments
    /// * `name` - Artifact name, also the file name it downloads as
    ///
    /// # Returns
    /// A handle to pass to `upload_artifact*` and then `finalize_artifact`.
    pub fn create_artifact(&self, name: &str) -> Result<UploadHandle, StorageError> {
        validate_artifact_name(name)?;
        let artifact_id: String = uuid::Uuid::new_v4().simple().to_string();
        let key: String = self.artifact_key(&artifact_id, name);

        log::debug!("Created artifact {} ({}) at {}", name, artifact_id, key);
        Ok(UploadHandle {
            artifact_id,
            name: name.to_string(),
            key,
            state: HandleState::Created,
            outcome: None,
        })
    }

    fn artifact_upload_options(&self, handle: &UploadHandle) -> UploadOptions {
        self.upload_options(self.settings.artifact_stall_timeout)
            .with_metadata(METADATA_ARTIFACT_ID, handle.artifact_id.clone())
            .with_metadata(METADATA_ARTIFACT_NAME, handle.name.clone())
    }

    /// Upload artifact contents from a reader. Not retried as a whole since
    /// the reader can't be rewound.
    pub async fn upload_artifact<R>(
        &self,
        handle: &mut UploadHandle,
        reader: R,
    ) -> Result<UploadOutcome, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        handle.expect_state(HandleState::Created)?;
        let options: UploadOptions = self.artifact_upload_options(handle);

        let outcome: UploadOutcome = self
            .run_upload(&handle.key, &handle.name, reader, 0, options)
            .await?;

        handle.state = HandleState::Uploaded;
        handle.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// Upload artifact contents from a file.
    ///
    /// The whole upload is retried on transient failure, reopening the file
    /// and starting a new session each attempt.
    pub async fn upload_artifact_file(
        &self,
        handle: &mut UploadHandle,
        path: &Path,
    ) -> Result<UploadOutcome, StorageError> {
        handle.expect_state(HandleState::Created)?;
        let options: UploadOptions = self.artifact_upload_options(handle);
        let options_ref: &UploadOptions = &options;
        let key: &str = &handle.key;
        let name: &str = &handle.name;

        let outcome: UploadOutcome = self
            .retry
            .execute("upload_artifact_file", move || {
                let options: UploadOptions = options_ref.clone();
                async move {
                    let file: tokio::fs::File = tokio::fs::File::open(path)
                        .await
                        .map_err(|e| StorageError::io(path.display(), e))?;
                    let size: u64 = file
                        .metadata()
                        .await
                        .map_err(|e| StorageError::io(path.display(), e))?
                        .len();
                    self.run_upload(key, name, file, size, options).await
                }
            })
            .await?;

        handle.state = HandleState::Uploaded;
        handle.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// Verify the uploaded blob and write its record.
    ///
    /// # Errors
    /// `NotFound` if the blob is missing, `SizeMismatch` if its size differs
    /// from what was uploaded.
    pub async fn finalize_artifact(
        &self,
        handle: &mut UploadHandle,
    ) -> Result<ArtifactRecord, StorageError> {
        handle.expect_state(HandleState::Uploaded)?;
        let outcome: UploadOutcome = handle
            .outcome
            .clone()
            .ok_or_else(|| StorageError::validation("artifact has no upload outcome"))?;

        let meta: ObjectMetadata = self
            .head(&handle.key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: handle.key.clone(),
            })?;
        if meta.size != outcome.uploaded_bytes {
            return Err(StorageError::SizeMismatch {
                key: handle.key.clone(),
                expected: outcome.uploaded_bytes,
                actual: meta.size,
            });
        }

        let now: DateTime<Utc> = Utc::now();
        let record: ArtifactRecord = ArtifactRecord {
            id: handle.artifact_id.clone(),
            name: handle.name.clone(),
            key: handle.key.clone(),
            size: meta.size,
            digest: outcome.digest_hex,
            created_at: now,
            expires_at: expiry_from(self.settings.retention_days, now),
        };

        let body: Bytes = Bytes::from(serde_json::to_vec_pretty(&record).map_err(|e| {
            StorageError::Backend {
                code: "SerializationError".into(),
                message: e.to_string(),
            }
        })?);
        let record_key: String = self.record_key(&record.id);
        let no_metadata: HashMap<String, String> = HashMap::new();
        self.retry
            .execute("put_record", || {
                self.store.put(
                    &record_key,
                    body.clone(),
                    Some(RECORD_CONTENT_TYPE),
                    &no_metadata,
                )
            })
            .await?;

        handle.state = HandleState::Finalized;
        log::info!(
            "Finalized artifact {} ({} bytes, sha256 {})",
            record.name,
            record.size,
            record.digest
        );
        Ok(record)
    }

    async fn read_record(&self, id: &str) -> Result<ArtifactRecord, StorageError> {
        let key: String = self.record_key(id);
        if self.head(&key).await?.is_none() {
            return Err(StorageError::NotFound {
                key: format!("artifact {}", id),
            });
        }
        let data: Vec<u8> = self.read_object(&key).await?;
        serde_json::from_slice(&data).map_err(|e| StorageError::Backend {
            code: "InvalidRecord".into(),
            message: format!("{}: {}", key, e),
        })
    }

    /// Every unexpired record, newest first.
    async fn load_records(&self) -> Result<Vec<ArtifactRecord>, StorageError> {
        let prefix: String = self.settings.prefixed("records/");
        let listed: Vec<ObjectInfo> = self.retry.execute("list", || self.store.list(&prefix)).await?;

        let now: DateTime<Utc> = Utc::now();
        let mut records: Vec<ArtifactRecord> = Vec::new();
        for info in listed.into_iter().filter(|i| i.key.ends_with(".json")) {
            let data: Vec<u8> = match self.read_object(&info.key).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            match serde_json::from_slice::<ArtifactRecord>(&data) {
                Ok(record) if record.expires_at > now => records.push(record),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping unreadable artifact record {}: {}", info.key, e),
            }
        }

        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(records)
    }

    /// Find the newest artifact called `name`.
    ///
    /// # Returns
    /// `Ok(None)` when nothing matches, unless `fail_if_not_found` is set, in
    /// which case `NotFound` is returned.
    pub async fn get_artifact(
        &self,
        name: &str,
        options: GetArtifactOptions,
    ) -> Result<Option<ArtifactRecord>, StorageError> {
        let found: Option<ArtifactRecord> = self
            .load_records()
            .await?
            .into_iter()
            .find(|r| r.name == name);

        match found {
            Some(record) => Ok(Some(record)),
            None if options.fail_if_not_found => Err(StorageError::NotFound {
                key: format!("artifact {}", name),
            }),
            None => Ok(None),
        }
    }

    /// List finalized artifacts, newest first.
    ///
    /// # Arguments
    /// * `latest_only` - Keep only the newest artifact per name
    pub async fn list_artifacts(&self, latest_only: bool) -> Result<Vec<ArtifactRecord>, StorageError> {
        let records: Vec<ArtifactRecord> = self.load_records().await?;
        if !latest_only {
            return Ok(records);
        }

        let mut seen: HashSet<String> = HashSet::new();
        Ok(records
            .into_iter()
            .filter(|r| seen.insert(r.name.clone()))
            .collect())
    }

    /// Delete an artifact's blob and record.
    ///
    /// # Errors
    /// `NotFound` if no record exists for `id`.
    pub async fn delete_artifact(&self, id: &str) -> Result<(), StorageError> {
        validate_artifact_id(id)?;
        let record: ArtifactRecord = self.read_record(id).await?;
        let record_key: String = self.record_key(id);

        self.retry
            .execute("delete", || self.store.delete(&record.key))
            .await?;
        self.retry
            .execute("delete", || self.store.delete(&record_key))
            .await?;

        log::info!("Deleted artifact {} ({})", record.name, id);
        Ok(())
    }

    /// Delete an artifact if it exists.
    ///
    /// # Returns
    /// Whether anything was deleted.
    pub async fn delete_artifact_if_exists(&self, id: &str) -> Result<bool, StorageError> {
        match self.delete_artifact(id).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Presigned download URL for `key`, valid for the configured TTL.
    pub async fn signed_download_url(&self, key: &str) -> Result<String, StorageError> {
        let request: PresignRequest = PresignRequest::Get {
            key: key.to_string(),
        };
        let ttl: std::time::Duration = self.settings.presign_ttl;
        self.retry
            .execute("presign", || self.store.presign(&request, ttl))
            .await
    }

    /// Download an artifact into `options.path`, named after the artifact.
    ///
    /// # Returns
    /// Path of the written file.
    pub async fn download_artifact(
        &self,
        id: &str,
        options: DownloadArtifactOptions,
    ) -> Result<PathBuf, StorageError> {
        validate_artifact_id(id)?;
        let record: ArtifactRecord = self.read_record(id).await?;
        let target: PathBuf = join_within_root(&options.path, &record.name)?;

        let download_options: DownloadOptions = self
            .download_options(self.settings.artifact_stall_timeout)
            .with_expected_digest(record.digest.clone());
        self.run_download(
            &record.key,
            &record.name,
            DataDestination::File(target.clone()),
            download_options,
        )
        .await?;

        Ok(target)
    }

    // ========================================================================
    // Blobs
    // ========================================================================

    /// Describe the object at `key`.
    pub async fn get(&self, key: &str) -> Result<Blob, StorageError> {
        let meta: ObjectMetadata = self
            .head(key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        let mut blob: Blob = Blob::from_metadata(key, meta, Utc::now());
        if blob.digest.is_none() {
            blob.digest = self.recorded_digest(&blob.metadata).await?;
        }
        Ok(blob)
    }

    /// Digest this store recorded for an artifact or cache blob.
    async fn recorded_digest(
        &self,
        metadata: &HashMap<String, String>,
    ) -> Result<Option<String>, StorageError> {
        if let Some(id) = metadata.get(METADATA_ARTIFACT_ID) {
            return match self.read_record(id).await {
                Ok(record) => Ok(Some(record.digest)),
                Err(StorageError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            };
        }
        match (
            metadata.get(METADATA_CACHE_KEY),
            metadata.get(METADATA_CACHE_VERSION),
        ) {
            (Some(key), Some(version)) => self.cache_digest(key, version).await,
            _ => Ok(None),
        }
    }

    /// Describe every object whose key starts with `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<Blob>, StorageError> {
        let listed: Vec<ObjectInfo> = self.retry.execute("list", || self.store.list(prefix)).await?;
        let now: DateTime<Utc> = Utc::now();
        Ok(listed
            .into_iter()
            .map(|info| Blob {
                key: info.key,
                size: info.size,
                digest: None,
                created_at: info.last_modified.unwrap_or(now),
                metadata: HashMap::new(),
            })
            .collect())
    }

    /// Delete the object at `key`.
    ///
    /// # Errors
    /// `NotFound` if it doesn't exist.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.head(key).await?.is_none() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        self.retry.execute("delete", || self.store.delete(key)).await
    }

    // ========================================================================
    // Caches
    // ========================================================================

    /// Version fingerprint for `paths` under `options`.
    pub fn cache_version(&self, paths: &[String], options: &CacheOptions) -> Result<String, StorageError> {
        compute_cache_version(
            paths,
            options.compression,
            options.enable_cross_os_archive,
            options.platform,
        )
    }

    /// Resolve which cache entry would be restored.
    ///
    /// # Arguments
    /// * `key` - Primary cache key
    /// * `paths` - Cached paths, part of the version fingerprint
    /// * `restore_keys` - Fallback prefixes in priority order
    /// * `options` - Archive format options
    pub async fn lookup_cache(
        &self,
        key: &str,
        paths: &[String],
        restore_keys: &[String],
        options: &CacheOptions,
    ) -> Result<Option<CacheEntry>, StorageError> {
        let version: String = self.cache_version(paths, options)?;
        self.cache_resolver().resolve(key, restore_keys, &version).await
    }

    /// Resolve a cache entry and download its archive to `archive_path`.
    ///
    /// Extracting the archive is up to the caller.
    pub async fn restore_cache(
        &self,
        key: &str,
        paths: &[String],
        restore_keys: &[String],
        options: &CacheOptions,
        archive_path: &Path,
    ) -> Result<Option<CacheEntry>, StorageError> {
        let Some(entry) = self.lookup_cache(key, paths, restore_keys, options).await? else {
            return Ok(None);
        };

        let mut download_options: DownloadOptions =
            self.download_options(self.settings.cache_stall_timeout);
        match self.cache_digest(&entry.key, &entry.version).await? {
            Some(digest) => download_options = download_options.with_expected_digest(digest),
            None => log::warn!(
                "No digest recorded for cache {}, restoring without verification",
                entry.name()
            ),
        }

        let outcome: DownloadOutcome = self
            .run_download(
                &entry.storage_key,
                &entry.name(),
                DataDestination::File(archive_path.to_path_buf()),
                download_options,
            )
            .await?;

        log::info!(
            "Restored cache {} ({} bytes) to {}",
            entry.name(),
            outcome.bytes_written,
            archive_path.display()
        );
        Ok(Some(entry))
    }

    /// Save a cache archive under `key`.
    ///
    /// The archive digest computed during upload is stored next to it and
    /// checked by `restore_cache`.
    ///
    /// # Errors
    /// `AlreadyExists` if an entry for this key and version is already stored.
    pub async fn save_cache<R>(
        &self,
        key: &str,
        paths: &[String],
        options: &CacheOptions,
        reader: R,
    ) -> Result<CacheEntry, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_cache_key(key)?;
        let version: String = self.cache_version(paths, options)?;
        let storage_key: String = self.cache_resolver().storage_key(key, &version);

        if self.head(&storage_key).await?.is_some() {
            return Err(StorageError::AlreadyExists { key: storage_key });
        }

        let upload_options: UploadOptions = self
            .upload_options(self.settings.cache_stall_timeout)
            .with_metadata(METADATA_CACHE_KEY, key)
            .with_metadata(METADATA_CACHE_VERSION, version.clone());
        let outcome: UploadOutcome = self
            .run_upload(&storage_key, key, reader, 0, upload_options)
            .await?;

        let digest_key: String = self.cache_digest_key(key, &version);
        let digest_metadata: HashMap<String, String> = HashMap::from([
            (METADATA_SHA256.to_string(), outcome.digest_hex.clone()),
            (METADATA_CACHE_KEY.to_string(), key.to_string()),
            (METADATA_CACHE_VERSION.to_string(), version.clone()),
        ]);
        let digest_body: Bytes = Bytes::from(outcome.digest_hex.clone());
        self.retry
            .execute("put_digest", || {
                self.store.put(
                    &digest_key,
                    digest_body.clone(),
                    Some(DIGEST_CONTENT_TYPE),
                    &digest_metadata,
                )
            })
            .await?;

        let creation_time: Option<DateTime<Utc>> = self
            .head(&storage_key)
            .await?
            .and_then(|meta| meta.last_modified)
            .or_else(|| Some(Utc::now()));

        log::info!("Saved cache {}:{} ({} bytes)", key, version, outcome.uploaded_bytes);
        Ok(CacheEntry {
            key: key.to_string(),
            version,
            storage_key,
            creation_time,
            size_bytes: outcome.uploaded_bytes,
        })
    }
}
