//! Canonical engine paths.
//!
//! The engine keys everything by a canonical relative path: forward slashes,
//! no leading or trailing separator, Unicode NFC. The remote store is
//! case-preserving but case-insensitive, so remote lookups additionally fold
//! case via [`case_fold`].

use std::path::Path;

use unicode_normalization::UnicodeNormalization;

/// Canonicalize a relative path for use as an engine key.
///
/// Backslashes become forward slashes, repeated separators collapse,
/// leading `./` and surrounding separators are stripped, and the result is
/// NFC-normalized so that composed and decomposed spellings of the same name
/// collide.
pub fn canonical(path: &str) -> String {
    let slashes = path.replace('\\', "/");
    let mut parts: Vec<&str> = slashes.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    // ".." is not meaningful inside the sync tree; resolve it textually so a
    // watcher quirk can't escape the root.
    let mut resolved: Vec<&str> = Vec::with_capacity(parts.len());
    for part in parts.drain(..) {
        if part == ".." {
            resolved.pop();
        } else {
            resolved.push(part);
        }
    }
    resolved.join("/").nfc().collect()
}

/// Lower-case a canonical path for case-insensitive comparison.
///
/// This is the lookup key on the remote side, and the local key on hosts
/// whose filesystem folds case.
pub fn case_fold(path: &str) -> String {
    path.to_lowercase()
}

/// Whether two canonical paths refer to the same item ignoring case.
pub fn equal_ignoring_case(a: &str, b: &str) -> bool {
    case_fold(a) == case_fold(b)
}

/// Whether two canonical paths differ *only* in case.
pub fn differs_only_in_case(a: &str, b: &str) -> bool {
    a != b && equal_ignoring_case(a, b)
}

/// Parent of a canonical path, `None` for top-level entries.
pub fn parent(path: &str) -> Option<&str> {
    path.rfind('/').map(|pos| &path[..pos])
}

/// Final component of a canonical path.
pub fn file_name(path: &str) -> &str {
    path.rfind('/').map_or(path, |pos| &path[pos + 1..])
}

/// Number of components in a canonical path. The empty path (the root) has
/// depth 0.
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

/// Whether `path` lies strictly below `ancestor`.
pub fn is_child_of(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return !path.is_empty();
    }
    path.len() > ancestor.len() + 1 && path.starts_with(ancestor) && path.as_bytes()[ancestor.len()] == b'/'
}

/// Join a canonical parent path with a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Canonical relative path of `abs` under `root`, or `None` if `abs` is not
/// inside `root`.
pub fn relative_to_root(abs: &Path, root: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let rel_str = rel.to_string_lossy();
    if rel_str.is_empty() {
        return None;
    }
    Some(canonical(&rel_str))
}
