//! The conflict resolver.
//!
//! Given a single normalized change, the current index entry, and the live
//! state of the local tree, decide what the apply workers should do:
//! apply as-is, skip, rename the target, or preserve content as a conflict
//! copy first. The decision tables below implement the cardinal rule of
//! the engine: an unsynced local edit is never overwritten or deleted
//! without a conflict copy surviving next to it.

use std::path::{Path, PathBuf};

use crate::change::{
    ItemKind, LocalChange, RemoteChange, ResolvedDownload, ResolvedUpload, SyncAction,
};
use crate::error::SyncError;
use crate::hash::{self, FOLDER_SENTINEL, HashOutcome};
use crate::ignore::PathFilters;
use crate::index::{IndexEntry, IndexStore};
use crate::paths;
use crate::remote::RemoteClient;

/// Marker inserted into conflict-copy names, as in
/// `report (conflicting copy).txt`.
pub const CONFLICT_MARKER: &str = "conflicting copy";
/// Marker for items renamed away from a selective-sync excluded target.
pub const SELECTIVE_SYNC_MARKER: &str = "selective sync conflict";
/// Marker for items renamed to dodge a case collision.
pub const CASE_MARKER: &str = "case conflict";

pub struct Resolver<'a> {
    index: &'a IndexStore,
    filters: &'a PathFilters,
    root: &'a Path,
    /// Whether the local filesystem folds case. On such hosts the FS itself
    /// prevents two case-variants, so the case-conflict rename only applies
    /// on case-sensitive hosts.
    case_insensitive_host: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(
        index: &'a IndexStore,
        filters: &'a PathFilters,
        root: &'a Path,
        case_insensitive_host: bool,
    ) -> Self {
        Self {
            index,
            filters,
            root,
            case_insensitive_host,
        }
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    // ── Download direction ───────────────────────────────────────────

    /// Decide what to do with one remote change.
    pub fn resolve_download(&self, change: &RemoteChange) -> Result<ResolvedDownload, SyncError> {
        // The remote is case-preserving; the spelling in a delta may differ
        // from the index key, so fall back to a folded lookup.
        let entry = match self.index.get(change.path())? {
            Some(e) => Some(e),
            None => self.index.get_by_fold(&paths::case_fold(change.path()))?,
        };
        let action = self.download_action(change, entry.as_ref())?;
        Ok(ResolvedDownload {
            change: change.clone(),
            action,
        })
    }

    fn download_action(
        &self,
        change: &RemoteChange,
        entry: Option<&IndexEntry>,
    ) -> Result<SyncAction, SyncError> {
        // Already in sync at this revision.
        if let (Some(change_rev), Some(entry)) = (change.rev(), entry) {
            if entry.rev.as_deref() == Some(change_rev) {
                return Ok(SyncAction::Skip);
            }
        }

        let abs = self.abs(change.path());
        let local = std::fs::symlink_metadata(&abs).ok();

        match change {
            RemoteChange::DeletedMeta { path } => match local {
                None => {
                    // Nothing on disk. Clear a stale index record if one
                    // exists; otherwise there is nothing to do.
                    if entry.is_some_and(|e| !e.is_tombstone()) {
                        Ok(SyncAction::Apply)
                    } else {
                        Ok(SyncAction::Skip)
                    }
                }
                Some(meta) => {
                    if self.modified_since_last_sync(path, &meta, entry)? {
                        Ok(SyncAction::CreateConflictCopy {
                            copy_path: self.conflict_copy_path(path, CONFLICT_MARKER),
                        })
                    } else {
                        Ok(SyncAction::Apply)
                    }
                }
            },

            RemoteChange::FolderMeta { path } => match local {
                Some(meta) if meta.is_dir() => Ok(SyncAction::SkipUpdateIndex {
                    rev: Some(FOLDER_SENTINEL.to_string()),
                    content_hash: Some(FOLDER_SENTINEL.to_string()),
                }),
                Some(meta) => {
                    // Local file where the remote has a folder.
                    if self.modified_since_last_sync(path, &meta, entry)? {
                        Ok(SyncAction::CreateConflictCopy {
                            copy_path: self.conflict_copy_path(path, CONFLICT_MARKER),
                        })
                    } else {
                        Ok(SyncAction::Apply)
                    }
                }
                None => Ok(SyncAction::Apply),
            },

            RemoteChange::FileMeta {
                path,
                rev,
                content_hash,
                ..
            } => {
                let Some(meta) = local else {
                    return Ok(SyncAction::Apply);
                };
                match hash::hash_file(&abs)? {
                    HashOutcome::Vanished => Ok(SyncAction::Apply),
                    HashOutcome::Hashed(local_hash) if local_hash == *content_hash => {
                        // Same bytes, stale index: record the new rev.
                        Ok(SyncAction::SkipUpdateIndex {
                            rev: Some(rev.clone()),
                            content_hash: Some(content_hash.clone()),
                        })
                    }
                    _ => {
                        if self.modified_since_last_sync(path, &meta, entry)? {
                            Ok(SyncAction::CreateConflictCopy {
                                copy_path: self.conflict_copy_path(path, CONFLICT_MARKER),
                            })
                        } else {
                            Ok(SyncAction::Apply)
                        }
                    }
                }
            }
        }
    }

    // ── Upload direction ─────────────────────────────────────────────

    /// Decide what to do with one local change.
    pub fn resolve_upload(
        &self,
        change: &LocalChange,
        client: &dyn RemoteClient,
    ) -> Result<ResolvedUpload, SyncError> {
        let action = self.upload_action(change, client)?;
        Ok(ResolvedUpload {
            change: change.clone(),
            action,
        })
    }

    fn upload_action(
        &self,
        change: &LocalChange,
        client: &dyn RemoteClient,
    ) -> Result<SyncAction, SyncError> {
        let path = change.path();

        if !change.is_delete() {
            // Selective-sync collision: the target is excluded from local
            // materialization, yet something lives there remotely.
            if self.filters.is_selective_excluded(path)
                && client.get_metadata(path)?.is_some()
            {
                return Ok(SyncAction::RenameTarget {
                    new_path: self.conflict_copy_path(path, SELECTIVE_SYNC_MARKER),
                });
            }

            // Case collision: on a case-sensitive host the local tree can
            // hold a name the case-folding remote already has in another
            // spelling.
            if !self.case_insensitive_host {
                if let Some(remote) = client.get_metadata(path)? {
                    if paths::differs_only_in_case(remote.path(), path) {
                        return Ok(SyncAction::RenameTarget {
                            new_path: self.conflict_copy_path(path, CASE_MARKER),
                        });
                    }
                }
                if let Some(existing) = self.index.get_by_fold(&paths::case_fold(path))? {
                    if !existing.is_tombstone() && paths::differs_only_in_case(&existing.path, path) {
                        return Ok(SyncAction::RenameTarget {
                            new_path: self.conflict_copy_path(path, CASE_MARKER),
                        });
                    }
                }
            }
        }

        match change {
            LocalChange::Created { .. } | LocalChange::Modified { .. } => {
                let entry = self.index.get(path)?;

                if matches!(change.kind(), ItemKind::File) {
                    match hash::hash_file(&self.abs(path))? {
                        HashOutcome::Vanished => return Ok(SyncAction::Skip),
                        HashOutcome::Hashed(local_hash) => {
                            if let Some(entry) = &entry {
                                // Content never actually diverged; just
                                // refresh the sync timestamp.
                                if entry.content_hash.as_deref() == Some(local_hash.as_str()) {
                                    return Ok(SyncAction::SkipUpdateIndex {
                                        rev: entry.rev.clone(),
                                        content_hash: entry.content_hash.clone(),
                                    });
                                }
                            }
                        }
                        HashOutcome::Folder => {
                            // The path turned into a folder after the event
                            // was recorded; the follow-up events cover it.
                            return Ok(SyncAction::Skip);
                        }
                    }
                }

                // Type change racing a remote edit: the remote content that
                // is about to be replaced is newer than what we last synced.
                // Preserve it locally before uploading over it.
                if let LocalChange::Created { kind, .. } = change {
                    if let Some(remote) = client.get_metadata(path)? {
                        let remote_kind = remote.kind();
                        let index_rev = entry.as_ref().and_then(|e| e.rev.as_deref());
                        if remote_kind.is_some_and(|k| k != *kind) && remote.rev() != index_rev {
                            return Ok(SyncAction::CreateConflictCopy {
                                copy_path: self.conflict_copy_path(path, CONFLICT_MARKER),
                            });
                        }
                    }
                }

                Ok(SyncAction::Apply)
            }
            LocalChange::Deleted { .. } | LocalChange::Moved { .. } => Ok(SyncAction::Apply),
        }
    }

    // ── Modification test ────────────────────────────────────────────

    /// Whether the local item changed after its last sync. For folders the
    /// comparison uses the newest mtime across visible direct children
    /// (same exclusion rules as the event pipeline); an item that was never
    /// synced counts as modified whenever it exists.
    fn modified_since_last_sync(
        &self,
        rel: &str,
        meta: &std::fs::Metadata,
        entry: Option<&IndexEntry>,
    ) -> Result<bool, SyncError> {
        let last_sync_ms = match entry {
            Some(e) if !e.is_tombstone() => e.last_sync_ms,
            // Never synced: any existing local content is an unsynced edit.
            _ => return Ok(true),
        };

        let mtime_ms = if meta.is_dir() {
            self.newest_visible_child_mtime(rel)?
        } else {
            mtime_ms(meta)
        };

        Ok(mtime_ms.is_some_and(|m| m > last_sync_ms))
    }

    fn newest_visible_child_mtime(&self, rel: &str) -> Result<Option<i64>, SyncError> {
        let abs = self.abs(rel);
        let read_dir = match std::fs::read_dir(&abs) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(rel, e)),
        };

        let mut newest: Option<i64> = None;
        for dir_entry in read_dir.flatten() {
            let name = dir_entry.file_name().to_string_lossy().to_string();
            let child_rel = paths::join(rel, &paths::canonical(&name));
            if self.filters.suppress_local_event(&child_rel) {
                continue;
            }
            if let Ok(meta) = dir_entry.metadata() {
                if let Some(m) = mtime_ms(&meta) {
                    newest = Some(newest.map_or(m, |n| n.max(m)));
                }
            }
        }
        Ok(newest)
    }

    // ── Conflict-copy naming ─────────────────────────────────────────

    /// Pick a free sibling name: `stem (marker)ext`, then
    /// `stem (marker 2)ext`, `stem (marker 3)ext`, strictly increasing.
    pub fn conflict_copy_path(&self, rel: &str, marker: &str) -> String {
        let dir = paths::parent(rel).unwrap_or("");
        let name = paths::file_name(rel);
        let (stem, ext) = split_extension(name);

        let mut counter = 1u32;
        loop {
            let candidate_name = if counter == 1 {
                format!("{stem} ({marker}){ext}")
            } else {
                format!("{stem} ({marker} {counter}){ext}")
            };
            let candidate = paths::join(dir, &candidate_name);
            if !self.abs(&candidate).exists() {
                return candidate;
            }
            counter += 1;
        }
    }
}

/// Split `name.ext` so the conflict marker lands before the extension.
/// Dotfiles without a second dot keep the whole name as the stem.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

fn mtime_ms(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;

    use crate::remote::{ChangePage, RemoteError, UploadedMeta};

    /// Remote stub serving a fixed metadata map.
    struct MetadataRemote {
        items: Vec<RemoteChange>,
    }

    impl RemoteClient for MetadataRemote {
        fn list_changes(&self, _cursor: Option<&str>) -> Result<ChangePage, RemoteError> {
            Ok(ChangePage {
                changes: Vec::new(),
                cursor: "0".into(),
                reset: false,
                has_more: false,
            })
        }

        fn wait_for_changes(&self, _cursor: &str, _timeout: Duration) -> Result<bool, RemoteError> {
            Ok(false)
        }

        fn download(&self, _path: &str, _rev: &str) -> Result<Box<dyn Read + Send>, RemoteError> {
            Err(RemoteError::NotFound)
        }

        fn upload(
            &self,
            _path: &str,
            _contents: &mut dyn Read,
            _if_match: Option<&str>,
        ) -> Result<UploadedMeta, RemoteError> {
            Err(RemoteError::PermissionDenied)
        }

        fn create_folder(&self, _path: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        fn delete(&self, _path: &str, _if_match: Option<&str>) -> Result<(), RemoteError> {
            Ok(())
        }

        fn rename(&self, _src: &str, _dst: &str, _if_match: Option<&str>) -> Result<(), RemoteError> {
            Ok(())
        }

        fn list_folder(&self, _path: &str) -> Result<Vec<RemoteChange>, RemoteError> {
            Ok(self.items.clone())
        }

        fn get_metadata(&self, path: &str) -> Result<Option<RemoteChange>, RemoteError> {
            let folded = paths::case_fold(path);
            Ok(self
                .items
                .iter()
                .find(|c| paths::case_fold(c.path()) == folded)
                .cloned())
        }
    }

    struct Fixture {
        index: IndexStore,
        filters: PathFilters,
        root: tempfile::TempDir,
        _index_dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let index_dir = tempfile::tempdir().unwrap();
            Self {
                index: IndexStore::open(&index_dir.path().join("index.db")).unwrap(),
                filters: PathFilters::new(".driftsync"),
                root: tempfile::tempdir().unwrap(),
                _index_dir: index_dir,
            }
        }

        fn resolver(&self) -> Resolver<'_> {
            Resolver::new(&self.index, &self.filters, self.root.path(), false)
        }

        fn write(&self, rel: &str, content: &[u8]) {
            let abs = self.root.path().join(rel);
            if let Some(parent) = abs.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(abs, content).unwrap();
        }
    }

    fn file_meta(path: &str, rev: &str, content: &[u8]) -> RemoteChange {
        RemoteChange::FileMeta {
            path: path.into(),
            rev: rev.into(),
            content_hash: hash::hash_bytes(content),
            server_modified_ms: 0,
        }
    }

    const FAR_FUTURE_MS: i64 = 4_000_000_000_000;

    #[test]
    fn matching_rev_skips() {
        let fx = Fixture::new();
        fx.index
            .put(&IndexEntry::file("a.txt", "r1", "h1", FAR_FUTURE_MS))
            .unwrap();

        let resolved = fx
            .resolver()
            .resolve_download(&file_meta("a.txt", "r1", b"x"))
            .unwrap();
        assert_eq!(resolved.action, SyncAction::Skip);
    }

    #[test]
    fn missing_local_file_downloads() {
        let fx = Fixture::new();
        let resolved = fx
            .resolver()
            .resolve_download(&file_meta("new.txt", "r1", b"content"))
            .unwrap();
        assert_eq!(resolved.action, SyncAction::Apply);
    }

    #[test]
    fn equal_content_skips_but_updates_index() {
        let fx = Fixture::new();
        fx.write("same.txt", b"identical");

        let resolved = fx
            .resolver()
            .resolve_download(&file_meta("same.txt", "r2", b"identical"))
            .unwrap();
        assert_eq!(
            resolved.action,
            SyncAction::SkipUpdateIndex {
                rev: Some("r2".into()),
                content_hash: Some(hash::hash_bytes(b"identical")),
            }
        );
    }

    #[test]
    fn unmodified_local_is_overwritten() {
        let fx = Fixture::new();
        fx.write("doc.txt", b"old content");
        // last_sync far in the future => local mtime <= last_sync.
        fx.index
            .put(&IndexEntry::file("doc.txt", "r1", "stale-hash", FAR_FUTURE_MS))
            .unwrap();

        let resolved = fx
            .resolver()
            .resolve_download(&file_meta("doc.txt", "r2", b"new content"))
            .unwrap();
        assert_eq!(resolved.action, SyncAction::Apply);
    }

    #[test]
    fn locally_modified_file_gets_conflict_copy() {
        let fx = Fixture::new();
        fx.write("doc.txt", b"my unsaved work");
        // last_sync in the distant past => local mtime > last_sync.
        fx.index
            .put(&IndexEntry::file("doc.txt", "r1", "old-hash", 1000))
            .unwrap();

        let resolved = fx
            .resolver()
            .resolve_download(&file_meta("doc.txt", "r2", b"their version"))
            .unwrap();
        assert_eq!(
            resolved.action,
            SyncAction::CreateConflictCopy {
                copy_path: "doc (conflicting copy).txt".into()
            }
        );
    }

    #[test]
    fn never_synced_local_file_gets_conflict_copy() {
        let fx = Fixture::new();
        fx.write("doc.txt", b"created independently");

        let resolved = fx
            .resolver()
            .resolve_download(&file_meta("doc.txt", "r1", b"remote version"))
            .unwrap();
        assert!(matches!(resolved.action, SyncAction::CreateConflictCopy { .. }));
    }

    #[test]
    fn remote_delete_of_missing_local_skips_or_clears_index() {
        let fx = Fixture::new();
        let change = RemoteChange::DeletedMeta { path: "gone.txt".into() };

        // No index entry: plain skip.
        let resolved = fx.resolver().resolve_download(&change).unwrap();
        assert_eq!(resolved.action, SyncAction::Skip);

        // Stale index entry: apply clears it.
        fx.index
            .put(&IndexEntry::file("gone.txt", "r1", "h", 1000))
            .unwrap();
        let resolved = fx.resolver().resolve_download(&change).unwrap();
        assert_eq!(resolved.action, SyncAction::Apply);
    }

    #[test]
    fn remote_delete_of_modified_local_preserves_content() {
        let fx = Fixture::new();
        fx.write("keep.txt", b"do not lose this");
        fx.index.put(&IndexEntry::file("keep.txt", "r1", "h", 1000)).unwrap();

        let resolved = fx
            .resolver()
            .resolve_download(&RemoteChange::DeletedMeta { path: "keep.txt".into() })
            .unwrap();
        assert_eq!(
            resolved.action,
            SyncAction::CreateConflictCopy {
                copy_path: "keep (conflicting copy).txt".into()
            }
        );
    }

    #[test]
    fn conflict_copy_counter_increments_past_existing_copies() {
        let fx = Fixture::new();
        fx.write("a.txt", b"0");
        fx.write("a (conflicting copy).txt", b"1");
        fx.write("a (conflicting copy 2).txt", b"2");

        let copy = fx.resolver().conflict_copy_path("a.txt", CONFLICT_MARKER);
        assert_eq!(copy, "a (conflicting copy 3).txt");
    }

    #[test]
    fn conflict_copy_keeps_directory_and_handles_no_extension() {
        let fx = Fixture::new();
        let copy = fx.resolver().conflict_copy_path("docs/README", CONFLICT_MARKER);
        assert_eq!(copy, "docs/README (conflicting copy)");

        let copy = fx.resolver().conflict_copy_path("docs/notes.md", CONFLICT_MARKER);
        assert_eq!(copy, "docs/notes (conflicting copy).md");
    }

    #[test]
    fn upload_selective_sync_conflict_renames() {
        // S4: local item under an excluded root that also exists remotely.
        let fx = Fixture::new();
        let filters = PathFilters::new(".driftsync")
            .with_selective_sync(std::sync::Arc::new(|p: &str| {
                p == "excluded" || p.starts_with("excluded/")
            }));
        fx.write("excluded/y.txt", b"local");

        let remote = MetadataRemote {
            items: vec![file_meta("excluded/y.txt", "r9", b"remote")],
        };
        let resolver = Resolver::new(&fx.index, &filters, fx.root.path(), false);
        let resolved = resolver
            .resolve_upload(
                &LocalChange::Created {
                    path: "excluded/y.txt".into(),
                    kind: ItemKind::File,
                },
                &remote,
            )
            .unwrap();
        assert_eq!(
            resolved.action,
            SyncAction::RenameTarget {
                new_path: "excluded/y (selective sync conflict).txt".into()
            }
        );
    }

    #[test]
    fn upload_case_conflict_renames_on_case_sensitive_host() {
        // S5: remote has Foo.txt, local creates foo.txt.
        let fx = Fixture::new();
        fx.write("foo.txt", b"local");
        let remote = MetadataRemote {
            items: vec![file_meta("Foo.txt", "r1", b"remote")],
        };

        let resolved = fx
            .resolver()
            .resolve_upload(
                &LocalChange::Created {
                    path: "foo.txt".into(),
                    kind: ItemKind::File,
                },
                &remote,
            )
            .unwrap();
        assert_eq!(
            resolved.action,
            SyncAction::RenameTarget {
                new_path: "foo (case conflict).txt".into()
            }
        );
    }

    #[test]
    fn upload_case_conflict_not_raised_on_case_insensitive_host() {
        let fx = Fixture::new();
        fx.write("foo.txt", b"local");
        let remote = MetadataRemote {
            items: vec![file_meta("Foo.txt", "r1", b"remote")],
        };

        let resolver = Resolver::new(&fx.index, &fx.filters, fx.root.path(), true);
        let resolved = resolver
            .resolve_upload(
                &LocalChange::Created {
                    path: "foo.txt".into(),
                    kind: ItemKind::File,
                },
                &remote,
            )
            .unwrap();
        assert_eq!(resolved.action, SyncAction::Apply);
    }

    #[test]
    fn upload_unchanged_content_only_refreshes_index() {
        let fx = Fixture::new();
        fx.write("same.txt", b"bytes");
        let h = hash::hash_bytes(b"bytes");
        fx.index.put(&IndexEntry::file("same.txt", "r1", &h, 1000)).unwrap();

        let remote = MetadataRemote { items: vec![] };
        let resolved = fx
            .resolver()
            .resolve_upload(&LocalChange::Modified { path: "same.txt".into() }, &remote)
            .unwrap();
        assert_eq!(
            resolved.action,
            SyncAction::SkipUpdateIndex {
                rev: Some("r1".into()),
                content_hash: Some(h),
            }
        );
    }

    #[test]
    fn upload_vanished_file_is_dropped() {
        let fx = Fixture::new();
        let remote = MetadataRemote { items: vec![] };
        let resolved = fx
            .resolver()
            .resolve_upload(&LocalChange::Modified { path: "ghost.txt".into() }, &remote)
            .unwrap();
        assert_eq!(resolved.action, SyncAction::Skip);
    }

    #[test]
    fn upload_type_change_over_newer_remote_preserves_remote_content() {
        let fx = Fixture::new();
        // Local folder became a file; index still says the old folder
        // synced against a remote that has since been replaced by a file
        // at a new rev.
        fx.write("x", b"now a file");
        fx.index.put(&IndexEntry::folder("x", 1000)).unwrap();
        let remote = MetadataRemote {
            items: vec![RemoteChange::FolderMeta { path: "x".into() }],
        };

        // Remote kind (folder) matches the index here, so no copy...
        let resolved = fx
            .resolver()
            .resolve_upload(
                &LocalChange::Created {
                    path: "x".into(),
                    kind: ItemKind::File,
                },
                &remote,
            )
            .unwrap();
        // ...because rev "folder" equals the index rev "folder": Apply.
        assert_eq!(resolved.action, SyncAction::Apply);

        // But if the remote moved on (folder replaced by a file we never
        // saw), the divergent remote content is preserved first.
        let remote = MetadataRemote {
            items: vec![file_meta("x", "r7", b"remote file")],
        };
        let resolved = fx
            .resolver()
            .resolve_upload(
                &LocalChange::Created {
                    path: "x".into(),
                    kind: ItemKind::Folder,
                },
                &remote,
            )
            .unwrap();
        assert!(matches!(resolved.action, SyncAction::CreateConflictCopy { .. }));
    }
}
