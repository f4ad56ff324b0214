//! Reconciliation: rebuild divergence between the index and reality into
//! synthetic local changes.
//!
//! Runs at startup, after long pauses, and periodically from maintenance.
//! Walks the local tree with the same exclusion rules as the event
//! pipeline, joins the observed set against the index, and emits
//! `Created`/`Modified`/`Deleted` records for any drift. The output feeds
//! the normal upload pipeline, which makes the engine self-healing across
//! crashes and offline edits: the resolver's content-hash fast path weeds
//! out items whose mtime moved but whose bytes did not.

use std::collections::BTreeMap;
use std::path::Path;

use walkdir::WalkDir;

use crate::change::{ItemKind, LocalChange};
use crate::error::SyncError;
use crate::ignore::PathFilters;
use crate::index::{IndexEntry, IndexStore};
use crate::paths;

/// What a tree walk observed at one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedItem {
    pub kind: ItemKind,
    pub mtime_ms: Option<i64>,
    pub size: u64,
}

/// Walk the local tree and produce the observed `(path → item)` set,
/// suppressed paths excluded. Excluded directories are never descended
/// into, so the engine's own cache directory costs nothing.
pub fn scan_local_tree(root: &Path, filters: &PathFilters) -> Result<BTreeMap<String, ObservedItem>, SyncError> {
    let mut observed = BTreeMap::new();

    let walker = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|entry| {
        match paths::relative_to_root(entry.path(), root) {
            Some(rel) => !filters.suppress_local_event(&rel),
            None => false,
        }
    });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // Items vanishing mid-walk are routine; reconciliation runs
                // again.
                log::debug!("Reconcile walk skipping entry: {e}");
                continue;
            }
        };
        let Some(rel) = paths::relative_to_root(entry.path(), root) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else { continue };

        let kind = if meta.is_dir() { ItemKind::Folder } else { ItemKind::File };
        observed.insert(
            rel,
            ObservedItem {
                kind,
                mtime_ms: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64),
                size: if meta.is_dir() { 0 } else { meta.len() },
            },
        );
    }

    Ok(observed)
}

/// Join the observed tree against the index and emit synthetic changes for
/// every divergence.
pub fn diff_against_index(
    observed: &BTreeMap<String, ObservedItem>,
    index_entries: &[IndexEntry],
) -> Vec<LocalChange> {
    let mut changes = Vec::new();
    let by_path: BTreeMap<&str, &IndexEntry> =
        index_entries.iter().map(|e| (e.path.as_str(), e)).collect();

    for (path, item) in observed {
        match by_path.get(path.as_str()) {
            None => changes.push(LocalChange::Created {
                path: path.clone(),
                kind: item.kind,
            }),
            Some(entry) if entry.is_tombstone() => changes.push(LocalChange::Created {
                path: path.clone(),
                kind: item.kind,
            }),
            Some(entry) if entry.kind != item.kind => {
                // Type change while we were not looking.
                changes.push(LocalChange::Deleted {
                    path: path.clone(),
                    kind: entry.kind,
                });
                changes.push(LocalChange::Created {
                    path: path.clone(),
                    kind: item.kind,
                });
            }
            Some(entry) => {
                if item.kind == ItemKind::File && item.mtime_ms.is_some_and(|m| m > entry.last_sync_ms) {
                    changes.push(LocalChange::Modified { path: path.clone() });
                }
            }
        }
    }

    // Index entries with no counterpart on disk: deleted while offline.
    for entry in index_entries {
        if !entry.is_tombstone() && !observed.contains_key(&entry.path) {
            changes.push(LocalChange::Deleted {
                path: entry.path.clone(),
                kind: entry.kind,
            });
        }
    }

    changes
}

/// Full reconciliation pass: scan, join, return the synthetic batch.
pub fn reconcile(root: &Path, filters: &PathFilters, index: &IndexStore) -> Result<Vec<LocalChange>, SyncError> {
    let observed = scan_local_tree(root, filters)?;
    let entries = index.all_entries()?;
    let changes = diff_against_index(&observed, &entries);
    log::info!(
        "Reconciliation: {} observed items, {} index entries, {} synthetic changes",
        observed.len(),
        entries.len(),
        changes.len(),
    );
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> PathFilters {
        PathFilters::new(".driftsync")
    }

    fn make_tree(spec: &[(&str, Option<&[u8]>)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in spec {
            let abs = dir.path().join(rel);
            match content {
                Some(bytes) => {
                    if let Some(parent) = abs.parent() {
                        std::fs::create_dir_all(parent).unwrap();
                    }
                    std::fs::write(abs, bytes).unwrap();
                }
                None => std::fs::create_dir_all(abs).unwrap(),
            }
        }
        dir
    }

    #[test]
    fn scan_observes_files_and_folders() {
        let dir = make_tree(&[
            ("docs", None),
            ("docs/a.txt", Some(b"hello")),
            (".driftsync/index.db", Some(b"db")),
            (".DS_Store", Some(b"junk")),
        ]);

        let observed = scan_local_tree(dir.path(), &filters()).unwrap();
        assert_eq!(observed.len(), 2);
        assert_eq!(observed["docs"].kind, ItemKind::Folder);
        assert_eq!(observed["docs/a.txt"].kind, ItemKind::File);
        assert_eq!(observed["docs/a.txt"].size, 5);
        assert!(!observed.contains_key(".driftsync/index.db"));
    }

    #[test]
    fn unknown_items_synthesize_creates() {
        let dir = make_tree(&[("new.txt", Some(b"x"))]);
        let observed = scan_local_tree(dir.path(), &filters()).unwrap();

        let changes = diff_against_index(&observed, &[]);
        assert_eq!(
            changes,
            vec![LocalChange::Created {
                path: "new.txt".into(),
                kind: ItemKind::File
            }]
        );
    }

    #[test]
    fn missing_items_synthesize_deletes() {
        let dir = make_tree(&[]);
        let observed = scan_local_tree(dir.path(), &filters()).unwrap();

        let entries = vec![
            IndexEntry::file("gone.txt", "r1", "h1", 1000),
            IndexEntry::tombstone("already-gone.txt", ItemKind::File, 1000),
        ];
        let changes = diff_against_index(&observed, &entries);
        assert_eq!(
            changes,
            vec![LocalChange::Deleted {
                path: "gone.txt".into(),
                kind: ItemKind::File
            }]
        );
    }

    #[test]
    fn newer_mtime_synthesizes_modified() {
        let dir = make_tree(&[("doc.txt", Some(b"edited offline"))]);
        let observed = scan_local_tree(dir.path(), &filters()).unwrap();

        // Synced long ago: the on-disk mtime is newer.
        let stale = vec![IndexEntry::file("doc.txt", "r1", "h1", 1000)];
        let changes = diff_against_index(&observed, &stale);
        assert_eq!(changes, vec![LocalChange::Modified { path: "doc.txt".into() }]);

        // Synced in the far future: nothing to do.
        let fresh = vec![IndexEntry::file("doc.txt", "r1", "h1", 4_000_000_000_000)];
        assert!(diff_against_index(&observed, &fresh).is_empty());
    }

    #[test]
    fn kind_mismatch_synthesizes_type_change_pair() {
        let dir = make_tree(&[("x", Some(b"now a file"))]);
        let observed = scan_local_tree(dir.path(), &filters()).unwrap();

        let entries = vec![IndexEntry::folder("x", 4_000_000_000_000)];
        let changes = diff_against_index(&observed, &entries);
        assert_eq!(
            changes,
            vec![
                LocalChange::Deleted {
                    path: "x".into(),
                    kind: ItemKind::Folder
                },
                LocalChange::Created {
                    path: "x".into(),
                    kind: ItemKind::File
                },
            ]
        );
    }

    #[test]
    fn tombstoned_entry_recreated_locally_is_a_create() {
        let dir = make_tree(&[("back.txt", Some(b"resurrected"))]);
        let observed = scan_local_tree(dir.path(), &filters()).unwrap();

        let entries = vec![IndexEntry::tombstone("back.txt", ItemKind::File, 1000)];
        let changes = diff_against_index(&observed, &entries);
        assert_eq!(
            changes,
            vec![LocalChange::Created {
                path: "back.txt".into(),
                kind: ItemKind::File
            }]
        );
    }
}
