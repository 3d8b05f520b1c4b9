//! Resolution of untrusted file names against an allowed root.
//!
//! Security model:
//!   1. The name must be non-empty.
//!   2. The name must be a single path component (its final component is
//!      the whole name), which rules out absolute paths and separators.
//!   3. The name must not contain `..` anywhere.
//!
//! A rejected name and a missing file look the same to the client: both
//! become 404.

use std::path::{Path, PathBuf};

/// Resolve `name` to a direct child of `root`.
pub(crate) fn resolve_child(root: &Path, name: &str) -> Option<PathBuf> {
    if is_safe_component(name) {
        Some(root.join(name))
    } else {
        None
    }
}

/// Resolve a `/`-separated relative path under `root`, requiring every
/// segment to pass the same check as [`resolve_child`].
pub(crate) fn resolve_nested(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for segment in relative.split('/') {
        if !is_safe_component(segment) {
            return None;
        }
        resolved.push(segment);
    }
    Some(resolved)
}

fn is_safe_component(name: &str) -> bool {
    if name.is_empty() || name.contains("..") {
        return false;
    }
    // Backslash is a separator on Windows and never legitimate in a name.
    if name.contains('\\') {
        return false;
    }
    Path::new(name).file_name().and_then(|base| base.to_str()) == Some(name)
}
