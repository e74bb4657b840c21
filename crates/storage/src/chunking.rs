//! Part and range planning.
//!
//! Pure logic, no I/O. The uploader uses these to size parts and the
//! downloader uses them to split an object into ranged fetches.

use artifact_cache_common::MIN_MULTIPART_PART_SIZE;

use crate::traits::ByteRange;

/// One contiguous slice of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Zero-based chunk index.
    pub index: usize,
    /// Byte offset within the object.
    pub offset: u64,
    /// Length of this chunk in bytes.
    pub length: u64,
}

impl ChunkInfo {
    /// Byte range covered by this chunk.
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.offset + self.length)
    }
}

/// Split `size` bytes into chunks of `chunk_size` bytes.
///
/// The last chunk may be smaller than `chunk_size`. Empty objects and a
/// zero `chunk_size` produce a single chunk covering everything.
///
/// # Arguments
/// * `size` - Total object size in bytes
/// * `chunk_size` - Size of each chunk
pub fn generate_chunks(size: u64, chunk_size: u64) -> Vec<ChunkInfo> {
    if chunk_size == 0 || size == 0 {
        return vec![ChunkInfo {
            index: 0,
            offset: 0,
            length: size,
        }];
    }

    let mut chunks: Vec<ChunkInfo> = Vec::with_capacity(expected_chunk_count(size, chunk_size));
    let mut offset: u64 = 0;
    let mut index: usize = 0;

    while offset < size {
        let length: u64 = std::cmp::min(chunk_size, size - offset);
        chunks.push(ChunkInfo {
            index,
            offset,
            length,
        });
        offset += length;
        index += 1;
    }

    chunks
}

/// Calculate the expected number of chunks for an object.
pub fn expected_chunk_count(size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 || size == 0 {
        return 1;
    }
    size.div_ceil(chunk_size) as usize
}

/// Whether `part_size` is acceptable for a multipart session.
pub fn is_valid_part_size(part_size: u64) -> bool {
    part_size >= MIN_MULTIPART_PART_SIZE
}

/// How an object is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// Single streaming GET piped to the destination.
    Streaming,
    /// Contiguous ranged GETs fetched in parallel.
    Ranged,
}

/// Pick a download strategy.
///
/// Ranged fetches are only worthwhile when the size is known and spans more
/// than one range.
///
/// # Arguments
/// * `size` - Object size reported by head, `None` if unknown
/// * `range_size` - Bytes per ranged request
pub fn download_strategy(size: Option<u64>, range_size: u64) -> DownloadStrategy {
    match size {
        Some(size) if range_size > 0 && size > range_size => DownloadStrategy::Ranged,
        _ => DownloadStrategy::Streaming,
    }
}
