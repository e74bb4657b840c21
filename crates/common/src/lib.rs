//! Shared types and utilities for the artifact cache crates.
//!
//! This crate provides functionality used by both the transfer engine and
//! the storage backends:
//! - Path normalization for cache fingerprints and download destinations
//! - SHA-256 digest helpers
//! - Generic progress callback trait
//! - Shared constants and error types

pub mod constants;
pub mod error;
pub mod hash;
pub mod path_utils;
pub mod progress;

// Re-export commonly used items at crate root
pub use constants::*;
pub use error::PathError;
pub use hash::{hash_bytes, hash_file, hash_string, Sha256Hasher};
pub use path_utils::{
    is_within_root, join_within_root, lexical_normalize, normalize_cache_path, to_posix_path,
};
pub use progress::ProgressCallback;
