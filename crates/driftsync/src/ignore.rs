//! Path exclusion rules.
//!
//! Three layers, checked in order of cost: hard-coded ignored basenames,
//! the engine's own artifacts (cache directory, index DB and its WAL/SHM
//! sidecars), and the two injected user predicates — the "mignore" pattern
//! matcher (excludes paths from upload) and the selective-sync query
//! (remote roots excluded from local materialization).

use std::sync::Arc;

use crate::paths;

// ── Hard-coded ignores ───────────────────────────────────────────────

/// Basenames that never sync in either direction.
const IGNORED_BASENAMES: &[&str] = &[".DS_Store", "desktop.ini", "Thumbs.db", ".directory", "Icon\r"];

/// Basename prefixes marking editor lock files.
const IGNORED_PREFIXES: &[&str] = &[".~", "~$"];

/// Basename suffixes marking temporary files.
const IGNORED_SUFFIXES: &[&str] = &["~", ".tmp", ".swp", ".part", ".crdownload"];

/// Whether a basename is on the hard-coded ignore list.
pub fn is_ignored_name(name: &str) -> bool {
    if IGNORED_BASENAMES.contains(&name) {
        return true;
    }
    if IGNORED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

// ── Injected predicates ──────────────────────────────────────────────

/// User-supplied mignore matcher: `true` means "exclude from upload".
pub type MignoreMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Selective-sync query: `true` means the canonical path lies in (or under)
/// a remote root the user chose not to materialize locally.
pub type SelectiveSyncQuery = Arc<dyn Fn(&str) -> bool + Send + Sync>;

// ── Filter set ───────────────────────────────────────────────────────

/// The complete exclusion rule set handed to the event pipeline.
#[derive(Clone)]
pub struct PathFilters {
    /// Canonical path of the engine's state directory inside the root.
    cache_dir: String,
    mignore: Option<MignoreMatcher>,
    selective_sync: Option<SelectiveSyncQuery>,
}

impl PathFilters {
    pub fn new(cache_dir_name: &str) -> Self {
        Self {
            cache_dir: paths::canonical(cache_dir_name),
            mignore: None,
            selective_sync: None,
        }
    }

    pub fn with_mignore(mut self, matcher: MignoreMatcher) -> Self {
        self.mignore = Some(matcher);
        self
    }

    pub fn with_selective_sync(mut self, query: SelectiveSyncQuery) -> Self {
        self.selective_sync = Some(query);
        self
    }

    /// Whether any component of the canonical path is hard-ignored.
    pub fn has_ignored_component(&self, path: &str) -> bool {
        path.split('/').any(is_ignored_name)
    }

    /// Whether the path is the engine's own cache directory or lies under it.
    pub fn is_own_artifact(&self, path: &str) -> bool {
        path == self.cache_dir || paths::is_child_of(path, &self.cache_dir)
    }

    /// Whether the user's mignore patterns exclude the path from upload.
    pub fn is_mignored(&self, path: &str) -> bool {
        self.mignore.as_ref().is_some_and(|m| m(path))
    }

    /// Whether selective sync excludes the path from local materialization.
    pub fn is_selective_excluded(&self, path: &str) -> bool {
        self.selective_sync.as_ref().is_some_and(|q| q(path))
    }

    /// Full suppression check for the raw local event stream: the engine's
    /// artifacts, hard-coded names, and mignore patterns. Selective sync is
    /// deliberately NOT checked here — locally created items under an
    /// excluded root must reach the upload resolver so it can rename them.
    pub fn suppress_local_event(&self, path: &str) -> bool {
        self.is_own_artifact(path) || self.has_ignored_component(path) || self.is_mignored(path)
    }

    /// Suppression check for the download direction: excluded roots are not
    /// materialized, and ignored names never sync.
    pub fn suppress_remote_change(&self, path: &str) -> bool {
        self.is_selective_excluded(path) || self.has_ignored_component(path) || self.is_own_artifact(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_coded_names() {
        assert!(is_ignored_name(".DS_Store"));
        assert!(is_ignored_name("desktop.ini"));
        assert!(is_ignored_name("~$report.docx"));
        assert!(is_ignored_name(".~lock.ods"));
        assert!(is_ignored_name("notes.txt~"));
        assert!(is_ignored_name("download.part"));
        assert!(!is_ignored_name("notes.txt"));
        assert!(!is_ignored_name("tilde~middle.txt~x"));
    }

    #[test]
    fn own_artifacts_are_suppressed() {
        let filters = PathFilters::new(".driftsync");
        assert!(filters.suppress_local_event(".driftsync"));
        assert!(filters.suppress_local_event(".driftsync/index.db"));
        assert!(filters.suppress_local_event(".driftsync/index.db-wal"));
        assert!(!filters.suppress_local_event("driftsync/notes.txt"));
    }

    #[test]
    fn ignored_component_anywhere_in_path() {
        let filters = PathFilters::new(".driftsync");
        assert!(filters.suppress_local_event("a/.DS_Store"));
        assert!(filters.suppress_local_event(".DS_Store"));
        assert!(filters.suppress_local_event("a/b.tmp"));
        assert!(!filters.suppress_local_event("a/b.txt"));
    }

    #[test]
    fn mignore_applies_to_local_only() {
        let filters =
            PathFilters::new(".driftsync").with_mignore(Arc::new(|p: &str| p.ends_with(".log")));
        assert!(filters.suppress_local_event("build/out.log"));
        assert!(!filters.suppress_remote_change("build/out.log"));
    }

    #[test]
    fn selective_sync_applies_to_remote_only() {
        let filters = PathFilters::new(".driftsync")
            .with_selective_sync(Arc::new(|p: &str| p == "excluded" || p.starts_with("excluded/")));
        assert!(filters.suppress_remote_change("excluded/y.txt"));
        // Local events under the excluded root still flow to the resolver.
        assert!(!filters.suppress_local_event("excluded/y.txt"));
        assert!(filters.is_selective_excluded("excluded/y.txt"));
    }
}
