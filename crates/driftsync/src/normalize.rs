//! The filter / coalesce / sort stage, shared by both sync directions.
//!
//! Input is a raw batch of changes (local or remote); output is an
//! exclusion-filtered, per-path coalesced, hierarchically sorted list that
//! the resolver and apply workers can process front to back: deletions
//! deepest-first, then creations shallowest-first with folders ahead of
//! files, so parents always exist before children and children are gone
//! before their parents.

use std::collections::{HashMap, HashSet};

use crate::change::{ItemKind, LocalChange, RemoteChange};
use crate::ignore::PathFilters;
use crate::index::IndexStore;
use crate::index::StoreError;
use crate::paths;
use crate::watcher::coalesce;

// ── Local direction ──────────────────────────────────────────────────

/// Normalize a batch of local changes for upload.
///
/// Selective-sync exclusions are deliberately not applied here: local items
/// under an excluded root must reach the upload resolver, which renames
/// them instead of dropping them.
pub fn normalize_local(changes: Vec<LocalChange>, filters: &PathFilters) -> Vec<LocalChange> {
    let admitted: Vec<LocalChange> = changes
        .into_iter()
        .filter(|c| !filters.suppress_local_event(c.path()))
        .collect();

    let coalesced = coalesce(admitted);
    let pruned = prune_subsumed_children(coalesced);
    sort_local(pruned)
}

/// Drop events under a folder that is itself deleted or moved in the same
/// batch: the folder operation subsumes them.
fn prune_subsumed_children(changes: Vec<LocalChange>) -> Vec<LocalChange> {
    let subsuming_roots: HashSet<String> = changes
        .iter()
        .filter_map(|c| match c {
            LocalChange::Deleted {
                path,
                kind: ItemKind::Folder,
            } => Some(path.clone()),
            LocalChange::Moved {
                src,
                kind: ItemKind::Folder,
                ..
            } => Some(src.clone()),
            _ => None,
        })
        .collect();

    if subsuming_roots.is_empty() {
        return changes;
    }

    // `is_child_of` is strict, so the subsuming folder operations
    // themselves survive the filter.
    changes
        .into_iter()
        .filter(|c| {
            let under_root = |p: &str| subsuming_roots.iter().any(|root| paths::is_child_of(p, root));
            match c {
                LocalChange::Moved { src, .. } => !under_root(src),
                other => !under_root(other.path()),
            }
        })
        .collect()
}

fn sort_local(mut changes: Vec<LocalChange>) -> Vec<LocalChange> {
    changes.sort_by_key(|c| {
        order_key(
            c.depth(),
            c.is_delete(),
            matches!(c.kind(), ItemKind::Folder),
            c.path(),
        )
    });
    changes
}

// ── Remote direction ─────────────────────────────────────────────────

/// Normalize a batch of remote changes for download.
///
/// Per path the last meta wins (the remote emits deltas in order, so a
/// `DeletedMeta` followed by a `FileMeta` nets out to the file). If the
/// surviving meta contradicts the item kind recorded in the index, a
/// synthetic `DeletedMeta` for the old entry is inserted ahead of it.
pub fn normalize_remote(
    changes: Vec<RemoteChange>,
    index: &IndexStore,
    filters: &PathFilters,
) -> Result<Vec<RemoteChange>, StoreError> {
    // Last-wins coalescing keyed by case-folded path (the remote is
    // case-insensitive).
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, RemoteChange> = HashMap::new();
    for change in changes {
        if filters.suppress_remote_change(change.path()) {
            continue;
        }
        let key = paths::case_fold(change.path());
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, change);
    }

    let mut out = Vec::new();
    for key in order {
        let Some(change) = latest.remove(&key) else { continue };

        // Type-change synthesis: a remote meta whose kind contradicts the
        // index means the old item must be torn down first. The remote is
        // case-preserving, so fall back to a folded lookup.
        if let Some(new_kind) = change.kind() {
            let entry = match index.get(change.path())? {
                Some(e) => Some(e),
                None => index.get_by_fold(&paths::case_fold(change.path()))?,
            };
            if let Some(entry) = entry {
                if !entry.is_tombstone() && entry.kind != new_kind {
                    out.push(RemoteChange::DeletedMeta {
                        path: entry.path.clone(),
                    });
                }
            }
        }
        out.push(change);
    }

    Ok(sort_remote(out))
}

fn sort_remote(mut changes: Vec<RemoteChange>) -> Vec<RemoteChange> {
    changes.sort_by_key(|c| {
        order_key(
            c.depth(),
            c.is_delete(),
            matches!(c.kind(), Some(ItemKind::Folder)),
            c.path(),
        )
    });
    changes
}

// ── Hierarchical ordering ────────────────────────────────────────────

/// Total order over a batch: all deletions first, deepest paths first
/// (children before parents); then everything else shallowest first with
/// folders ahead of files (parents before children); path as tiebreak.
/// The sort is stable, so a type-change `Deleted`+`Created` pair at one
/// path keeps its relative order via the delete-first class.
fn order_key(depth: usize, is_delete: bool, is_folder: bool, path: &str) -> (u8, i64, u8, String) {
    if is_delete {
        (0, -(depth as i64), 0, path.to_string())
    } else {
        (1, depth as i64, if is_folder { 0 } else { 1 }, path.to_string())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;

    fn filters() -> PathFilters {
        PathFilters::new(".driftsync")
    }

    fn open_index() -> (IndexStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        (store, dir)
    }

    fn created(path: &str, kind: ItemKind) -> LocalChange {
        LocalChange::Created {
            path: path.into(),
            kind,
        }
    }

    fn deleted(path: &str, kind: ItemKind) -> LocalChange {
        LocalChange::Deleted {
            path: path.into(),
            kind,
        }
    }

    fn file_meta(path: &str, rev: &str) -> RemoteChange {
        RemoteChange::FileMeta {
            path: path.into(),
            rev: rev.into(),
            content_hash: format!("hash-{rev}"),
            server_modified_ms: 0,
        }
    }

    #[test]
    fn folder_becomes_file_emits_delete_then_create_and_prunes_children() {
        // S3: local folder /x replaced by file /x; child events are subsumed.
        let batch = vec![
            deleted("x/inner.txt", ItemKind::File),
            deleted("x", ItemKind::Folder),
            created("x", ItemKind::File),
        ];
        let out = normalize_local(batch, &filters());
        assert_eq!(
            out,
            vec![deleted("x", ItemKind::Folder), created("x", ItemKind::File)]
        );
    }

    #[test]
    fn moved_folder_subsumes_child_events() {
        let batch = vec![
            LocalChange::Moved {
                src: "old".into(),
                dst: "new".into(),
                kind: ItemKind::Folder,
                modified: false,
            },
            LocalChange::Modified {
                path: "old/a.txt".into(),
            },
        ];
        let out = normalize_local(batch, &filters());
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], LocalChange::Moved { src, .. } if src == "old"));
    }

    #[test]
    fn creations_are_parent_first_deletions_child_first() {
        let batch = vec![
            created("a/b/c.txt", ItemKind::File),
            created("a", ItemKind::Folder),
            created("a/b", ItemKind::Folder),
            deleted("z/sub/f.txt", ItemKind::File),
            deleted("z/sub", ItemKind::Folder),
            deleted("z", ItemKind::Folder),
        ];
        // Shuffle-resistant: prune drops children of deleted folder z.
        let out = normalize_local(batch, &filters());
        let paths: Vec<&str> = out.iter().map(|c| c.path()).collect();
        assert_eq!(paths, vec!["z", "a", "a/b", "a/b/c.txt"]);
        assert!(out[0].is_delete());
    }

    #[test]
    fn folders_sort_before_files_at_equal_depth() {
        let batch = vec![
            created("a/file.txt", ItemKind::File),
            created("a/dir", ItemKind::Folder),
            created("a", ItemKind::Folder),
        ];
        let out = normalize_local(batch, &filters());
        let paths: Vec<&str> = out.iter().map(|c| c.path()).collect();
        assert_eq!(paths, vec!["a", "a/dir", "a/file.txt"]);
    }

    #[test]
    fn local_filter_drops_ignored_but_keeps_selective_excluded() {
        let f = PathFilters::new(".driftsync")
            .with_selective_sync(std::sync::Arc::new(|p: &str| p.starts_with("excluded")));
        let batch = vec![
            created(".DS_Store", ItemKind::File),
            created("excluded/y.txt", ItemKind::File),
        ];
        let out = normalize_local(batch, &f);
        assert_eq!(out, vec![created("excluded/y.txt", ItemKind::File)]);
    }

    #[test]
    fn remote_deleted_then_file_meta_nets_to_file() {
        let (index, _dir) = open_index();
        let batch = vec![
            RemoteChange::DeletedMeta { path: "a.txt".into() },
            file_meta("a.txt", "r2"),
        ];
        let out = normalize_remote(batch, &index, &filters()).unwrap();
        assert_eq!(out, vec![file_meta("a.txt", "r2")]);
    }

    #[test]
    fn remote_coalescing_is_case_insensitive() {
        let (index, _dir) = open_index();
        let batch = vec![file_meta("A.txt", "r1"), file_meta("a.txt", "r2")];
        let out = normalize_remote(batch, &index, &filters()).unwrap();
        assert_eq!(out, vec![file_meta("a.txt", "r2")]);
    }

    #[test]
    fn remote_type_change_synthesizes_deletion() {
        let (index, _dir) = open_index();
        index.put(&IndexEntry::folder("x", 100)).unwrap();

        let out = normalize_remote(vec![file_meta("x", "r1")], &index, &filters()).unwrap();
        assert_eq!(
            out,
            vec![RemoteChange::DeletedMeta { path: "x".into() }, file_meta("x", "r1")]
        );
    }

    #[test]
    fn remote_selective_excluded_roots_are_dropped() {
        let (index, _dir) = open_index();
        let f = PathFilters::new(".driftsync")
            .with_selective_sync(std::sync::Arc::new(|p: &str| p.starts_with("excluded")));
        let out = normalize_remote(
            vec![file_meta("excluded/y.txt", "r1"), file_meta("kept.txt", "r2")],
            &index,
            &f,
        )
        .unwrap();
        assert_eq!(out, vec![file_meta("kept.txt", "r2")]);
    }

    #[test]
    fn remote_deletions_sort_deepest_first() {
        let (index, _dir) = open_index();
        let batch = vec![
            RemoteChange::DeletedMeta { path: "a".into() },
            RemoteChange::DeletedMeta { path: "a/b/c.txt".into() },
            RemoteChange::DeletedMeta { path: "a/b".into() },
            RemoteChange::FolderMeta { path: "n".into() },
        ];
        let out = normalize_remote(batch, &index, &filters()).unwrap();
        let paths: Vec<&str> = out.iter().map(|c| c.path()).collect();
        assert_eq!(paths, vec!["a/b/c.txt", "a/b", "a", "n"]);
    }
}
