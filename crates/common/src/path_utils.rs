//! Path normalization for cache fingerprints and download destinations.

use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Lexical path normalization without filesystem access.
///
/// Removes `.` components and resolves `..` components lexically.
/// Does not access the filesystem or resolve symlinks.
///
/// # Arguments
/// * `path` - Path to normalize
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !components.is_empty()
                    && !matches!(
                        components.last(),
                        Some(Component::ParentDir) | Some(Component::RootDir)
                    )
                {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            _ => components.push(component),
        }
    }

    components.iter().collect()
}

/// Convert a path to POSIX-style string (forward slashes).
///
/// # Arguments
/// * `path` - Path to convert
pub fn to_posix_path(path: &Path) -> String {
    let joined: String = path
        .components()
        .map(|c: Component| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    // A leading RootDir renders as "/" and would otherwise double up.
    if joined.starts_with("//") {
        joined[1..].to_string()
    } else {
        joined
    }
}

/// Normalize a cache path pattern before it enters a version fingerprint.
///
/// Trims whitespace, converts `\` separators to `/`, and lexically resolves
/// `.` and `..` so equivalent spellings fingerprint identically. Glob
/// characters and a leading `~` are preserved verbatim.
///
/// # Arguments
/// * `pattern` - Path or glob pattern as supplied by the caller
///
/// # Errors
/// Returns `PathError::InvalidPath` for empty patterns.
pub fn normalize_cache_path(pattern: &str) -> Result<String, PathError> {
    let trimmed: &str = pattern.trim();
    if trimmed.is_empty() {
        return Err(PathError::InvalidPath {
            path: pattern.to_string(),
        });
    }

    let forward: String = trimmed.replace('\\', "/");
    let normalized: PathBuf = lexical_normalize(Path::new(&forward));
    let posix: String = to_posix_path(&normalized);

    if posix.is_empty() {
        Ok(".".to_string())
    } else {
        Ok(posix)
    }
}

/// Check if a path is within a root directory.
///
/// Uses lexical comparison, does not access filesystem.
///
/// # Arguments
/// * `path` - Path to check
/// * `root` - Root directory that should contain the path
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    let norm_path: PathBuf = lexical_normalize(path);
    let norm_root: PathBuf = lexical_normalize(root);
    norm_path.starts_with(&norm_root)
}

/// Join `relative` onto `root`, rejecting results that escape `root`.
///
/// # Errors
/// Returns `PathError::PathOutsideRoot` if the joined path leaves the root.
pub fn join_within_root(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let joined: PathBuf = lexical_normalize(&root.join(relative));
    if !is_within_root(&joined, root) || joined == lexical_normalize(root) {
        return Err(PathError::PathOutsideRoot {
            path: joined.display().to_string(),
            root: root.display().to_string(),
        });
    }
    Ok(joined)
}
