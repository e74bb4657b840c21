//! Shared constants used across the artifact cache crates.

/// Default multipart upload part size (8MB).
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Smallest part size accepted by S3 for every part except the last (5MB).
pub const MIN_MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of parts in one multipart upload session.
pub const MAX_MULTIPART_PARTS: u32 = 10_000;

/// Concurrency floor used on small machines.
pub const MIN_TRANSFER_CONCURRENCY: usize = 32;

/// Concurrency ceiling regardless of core count.
pub const MAX_TRANSFER_CONCURRENCY: usize = 300;

/// Per-CPU multiplier applied above the floor.
pub const CONCURRENCY_PER_CORE: usize = 16;

/// Default stall timeout for interactive artifact transfers (seconds).
pub const DEFAULT_ARTIFACT_STALL_TIMEOUT_SECS: u64 = 30;

/// Default stall timeout for cache chunk transfers (seconds).
pub const DEFAULT_CACHE_STALL_TIMEOUT_SECS: u64 = 300;

/// Default overall timeout for whole-download operations (seconds).
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 5 * 60;

/// Default lifetime of presigned download URLs (seconds).
pub const DEFAULT_PRESIGN_TTL_SECS: u64 = 60 * 60;

/// Default interval between progress lines (seconds).
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 10;

/// Shortest allowed artifact retention.
pub const MIN_RETENTION_DAYS: u32 = 1;

/// Longest allowed artifact retention.
pub const MAX_RETENTION_DAYS: u32 = 90;

/// Maximum length of a cache key.
pub const MAX_CACHE_KEY_LENGTH: usize = 512;

/// Maximum length of an artifact name.
pub const MAX_ARTIFACT_NAME_LENGTH: usize = 256;

/// Compute the default transfer concurrency for a machine with `cores` CPUs.
///
/// 32 on machines with 4 or fewer cores, otherwise 16 per core capped at 300.
///
/// # Arguments
/// * `cores` - Number of available CPUs
pub fn default_concurrency(cores: usize) -> usize {
    if cores <= 4 {
        MIN_TRANSFER_CONCURRENCY
    } else {
        (CONCURRENCY_PER_CORE * cores).min(MAX_TRANSFER_CONCURRENCY)
    }
}

/// Default transfer concurrency for the current machine.
pub fn default_concurrency_for_host() -> usize {
    let cores: usize = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    default_concurrency(cores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_concurrency_small_machines() {
        assert_eq!(default_concurrency(1), 32);
        assert_eq!(default_concurrency(4), 32);
    }

    #[test]
    fn test_default_concurrency_scales_with_cores() {
        assert_eq!(default_concurrency(5), 80);
        assert_eq!(default_concurrency(16), 256);
    }

    #[test]
    fn test_default_concurrency_ceiling() {
        assert_eq!(default_concurrency(19), 300);
        assert_eq!(default_concurrency(128), 300);
    }

    #[test]
    fn test_default_concurrency_for_host_in_bounds() {
        let value: usize = default_concurrency_for_host();
        assert!((MIN_TRANSFER_CONCURRENCY..=MAX_TRANSFER_CONCURRENCY).contains(&value));
    }
}
