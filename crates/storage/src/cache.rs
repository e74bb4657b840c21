//! Build-cache version fingerprints and key resolution.
//!
//! Cache entries are stored as `{namespace}/{key}:{version}`. The version
//! fingerprints the cached paths and archive format so entries made with a
//! different layout never restore. Lookups try the exact primary key first,
//! then each restore key as a prefix in the order the caller gave them.

use chrono::{DateTime, Utc};

use artifact_cache_common::{hash_string, normalize_cache_path, MAX_CACHE_KEY_LENGTH};

use crate::error::StorageError;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::traits::{ObjectInfo, ObjectMetadata, ObjectStore};

/// Marker mixed into versions of Windows-only archives.
const WINDOWS_ONLY_MARKER: &str = "windows-only";

/// Separator between fingerprint inputs.
const VERSION_SEPARATOR: &str = "|";

/// Archive compression, part of the version fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    Gzip,
    /// Zstandard without long-distance matching.
    ZstdWithoutLong,
    #[default]
    Zstd,
}

impl CompressionMethod {
    /// Name mixed into the version fingerprint.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::Gzip => "gzip",
            CompressionMethod::ZstdWithoutLong => "zstd-without-long",
            CompressionMethod::Zstd => "zstd",
        }
    }
}

/// Platform the archive was produced on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Other,
}

impl Platform {
    /// Platform of the running process.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

/// Compute the version fingerprint for a set of cached paths.
///
/// SHA-256 over the normalized paths (in caller order), the compression
/// name, and a Windows-only marker when the archive is Windows-specific.
///
/// # Arguments
/// * `paths` - Cached path patterns
/// * `compression` - Archive compression
/// * `enable_cross_os_archive` - Allow restoring the archive on any OS
/// * `platform` - Platform producing or restoring the archive
///
/// # Errors
/// `Validation` if `paths` is empty or contains a blank pattern.
pub fn compute_cache_version(
    paths: &[String],
    compression: CompressionMethod,
    enable_cross_os_archive: bool,
    platform: Platform,
) -> Result<String, StorageError> {
    if paths.is_empty() {
        return Err(StorageError::validation("at least one cache path is required"));
    }

    let mut components: Vec<String> = paths
        .iter()
        .map(|p| normalize_cache_path(p))
        .collect::<Result<Vec<String>, _>>()?;
    components.push(compression.as_str().to_string());
    if platform == Platform::Windows && !enable_cross_os_archive {
        components.push(WINDOWS_ONLY_MARKER.to_string());
    }

    Ok(hash_string(&components.join(VERSION_SEPARATOR)))
}

/// Check a cache key before any I/O.
///
/// Keys must be non-empty, at most 512 characters, and free of commas.
pub fn validate_cache_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::validation("cache key must not be empty"));
    }
    if key.chars().count() > MAX_CACHE_KEY_LENGTH {
        return Err(StorageError::validation(format!(
            "cache key is longer than {} characters",
            MAX_CACHE_KEY_LENGTH
        )));
    }
    if key.contains(',') {
        return Err(StorageError::validation(format!(
            "cache key must not contain commas: {}",
            key
        )));
    }
    Ok(())
}

/// A stored cache archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Cache key the entry was saved under.
    pub key: String,
    /// Version fingerprint the entry was saved with.
    pub version: String,
    /// Object key of the archive.
    pub storage_key: String,
    /// Time the archive was committed, if known.
    pub creation_time: Option<DateTime<Utc>>,
    /// Archive size in bytes.
    pub size_bytes: u64,
}

impl CacheEntry {
    /// Entry name, `{key}:{version}`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.key, self.version)
    }
}

/// Pick the most recently created entry.
///
/// Entries without a timestamp sort oldest. Ties go to the lexicographically
/// highest `key:version` name so the choice never depends on listing order.
pub fn select_most_recent(entries: Vec<CacheEntry>) -> Option<CacheEntry> {
    entries
        .into_iter()
        .max_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then_with(|| a.name().cmp(&b.name()))
        })
}

/// Resolves cache keys against an object store namespace.
pub struct CacheKeyResolver<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    namespace: String,
    retry: RetryExecutor,
}

impl<'a, S: ObjectStore + ?Sized> CacheKeyResolver<'a, S> {
    /// Create a resolver for entries stored under `namespace`.
    pub fn new(store: &'a S, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into().trim_end_matches('/').to_string(),
            retry: RetryExecutor::new(RetryPolicy::transient()),
        }
    }

    /// Set the retry policy for backend calls.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    /// Object key for `key` at `version`.
    pub fn storage_key(&self, key: &str, version: &str) -> String {
        format!("{}/{}:{}", self.namespace, key, version)
    }

    /// Find the entry to restore.
    ///
    /// 1. `{primary_key}:{version}` exists: return it.
    /// 2. Otherwise, for each restore key in order, list entries whose
    ///    `key:version` name starts with it and return the most recent. The
    ///    first restore key with any entry wins.
    ///
    /// # Arguments
    /// * `primary_key` - Exact key to try first
    /// * `restore_keys` - Prefixes to fall back to, in priority order
    /// * `version` - Version fingerprint for the exact lookup
    ///
    /// # Returns
    /// The chosen entry, or `None` when nothing matches.
    pub async fn resolve(
        &self,
        primary_key: &str,
        restore_keys: &[String],
        version: &str,
    ) -> Result<Option<CacheEntry>, StorageError> {
        validate_cache_key(primary_key)?;
        for restore_key in restore_keys {
            validate_cache_key(restore_key)?;
        }

        let exact_key: String = self.storage_key(primary_key, version);
        let exact: Option<ObjectMetadata> = self
            .retry
            .execute("head", || self.store.head(&exact_key))
            .await?;
        if let Some(meta) = exact {
            log::debug!("Cache hit on primary key {}", primary_key);
            return Ok(Some(CacheEntry {
                key: primary_key.to_string(),
                version: version.to_string(),
                storage_key: exact_key,
                creation_time: meta.last_modified,
                size_bytes: meta.size,
            }));
        }

        for restore_key in restore_keys {
            let prefix: String = format!("{}/{}", self.namespace, restore_key);
            let listed: Vec<ObjectInfo> = self
                .retry
                .execute("list", || self.store.list(&prefix))
                .await?;

            let candidates: Vec<CacheEntry> = listed
                .into_iter()
                .filter_map(|info| self.parse_entry(info))
                .filter(|entry| entry.name().starts_with(restore_key.as_str()))
                .collect();

            if let Some(entry) = select_most_recent(candidates) {
                log::debug!(
                    "Cache hit on restore key {} -> {}",
                    restore_key,
                    entry.name()
                );
                return Ok(Some(entry));
            }
        }

        log::debug!("Cache miss for {}", primary_key);
        Ok(None)
    }

    /// Turn a listed object into an entry. Objects outside the namespace or
    /// without a `:version` suffix are skipped.
    fn parse_entry(&self, info: ObjectInfo) -> Option<CacheEntry> {
        let name: &str = info
            .key
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix('/')?;
        let (key, version) = name.rsplit_once(':')?;
        if key.is_empty() || version.is_empty() {
            return None;
        }

        Some(CacheEntry {
            key: key.to_string(),
            version: version.to_string(),
            creation_time: info.last_modified,
            size_bytes: info.size,
            storage_key: info.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn paths(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn entry(key: &str, version: &str, secs: Option<i64>) -> CacheEntry {
        CacheEntry {
            key: key.into(),
            version: version.into(),
            storage_key: format!("cache/{key}:{version}"),
            creation_time: secs.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            size_bytes: 1,
        }
    }

    #[test]
    fn test_version_is_stable_sha256() {
        let v1: String =
            compute_cache_version(&paths(&["node_modules"]), CompressionMethod::Zstd, false, Platform::Other)
                .unwrap();
        let v2: String =
            compute_cache_version(&paths(&["./node_modules/"]), CompressionMethod::Zstd, false, Platform::Other)
                .unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 64);
        assert_eq!(v1, hash_string("node_modules|zstd"));
    }

    #[test]
    fn test_version_depends_on_order_and_compression() {
        let ab: String =
            compute_cache_version(&paths(&["a", "b"]), CompressionMethod::Zstd, false, Platform::Other)
                .unwrap();
        let ba: String =
            compute_cache_version(&paths(&["b", "a"]), CompressionMethod::Zstd, false, Platform::Other)
                .unwrap();
        let gz: String =
            compute_cache_version(&paths(&["a", "b"]), CompressionMethod::Gzip, false, Platform::Other)
                .unwrap();
        assert_ne!(ab, ba);
        assert_ne!(ab, gz);
    }

    #[test]
    fn test_version_windows_marker() {
        let p: Vec<String> = paths(&["target"]);
        let windows: String =
            compute_cache_version(&p, CompressionMethod::Zstd, false, Platform::Windows).unwrap();
        let cross_os: String =
            compute_cache_version(&p, CompressionMethod::Zstd, true, Platform::Windows).unwrap();
        let linux: String =
            compute_cache_version(&p, CompressionMethod::Zstd, false, Platform::Other).unwrap();

        assert_eq!(windows, hash_string("target|zstd|windows-only"));
        assert_eq!(cross_os, linux);
    }

    #[test]
    fn test_version_requires_paths() {
        assert!(compute_cache_version(&[], CompressionMethod::Zstd, false, Platform::Other).is_err());
    }

    #[test]
    fn test_validate_cache_key() {
        assert!(validate_cache_key("deps-v1").is_ok());
        assert!(validate_cache_key("").is_err());
        assert!(validate_cache_key("a,b").is_err());
        assert!(validate_cache_key(&"k".repeat(512)).is_ok());
        assert!(validate_cache_key(&"k".repeat(513)).is_err());
    }

    #[test]
    fn test_select_most_recent() {
        let chosen: CacheEntry = select_most_recent(vec![
            entry("deps-v1", "abc", Some(100)),
            entry("deps-v2", "abc", Some(300)),
            entry("deps-v3", "abc", None),
        ])
        .unwrap();
        assert_eq!(chosen.key, "deps-v2");
    }

    #[test]
    fn test_select_most_recent_tie_breaks_on_name() {
        let chosen: CacheEntry = select_most_recent(vec![
            entry("deps-b", "1", Some(100)),
            entry("deps-a", "1", Some(100)),
            entry("deps-c", "1", Some(100)),
        ])
        .unwrap();
        assert_eq!(chosen.key, "deps-c");
        assert!(select_most_recent(Vec::new()).is_none());
    }
}
