//! SHA-256 digest utilities.
//!
//! Blob digests and cache version fingerprints are lowercase hex SHA-256.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Compute the SHA-256 digest of a byte slice.
///
/// # Arguments
/// * `data` - Bytes to hash
///
/// # Returns
/// 64-character lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the SHA-256 digest of a UTF-8 string.
pub fn hash_string(value: &str) -> String {
    hash_bytes(value.as_bytes())
}

/// Compute the SHA-256 digest of a file.
///
/// Reads the file in 64KB blocks so large archives are never fully buffered.
///
/// # Arguments
/// * `path` - Path to the file to hash
///
/// # Errors
/// Returns error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file: std::fs::File = std::fs::File::open(path)?;
    let mut hasher: Sha256Hasher = Sha256Hasher::new();
    let mut buffer: Vec<u8> = vec![0u8; 64 * 1024];

    loop {
        let bytes_read: usize = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish_hex())
}

/// Incremental SHA-256 accumulator.
///
/// Fed by the uploader as parts are read, so the digest is ready the moment
/// the source stream ends.
#[derive(Clone, Default)]
pub struct Sha256Hasher {
    inner: Sha256,
    bytes: u64,
}

impl Sha256Hasher {
    /// Create an empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data into the digest.
    ///
    /// # Arguments
    /// * `data` - Bytes to add to the digest
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the digest as lowercase hex.
    pub fn finish_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl std::fmt::Debug for Sha256Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha256Hasher")
            .field("bytes", &self.bytes)
            .finish()
    }
}
