//! Change and action types flowing through the sync pipeline.
//!
//! `LocalChange` comes out of the debounced watcher stream (or a
//! reconciliation scan), `RemoteChange` out of the delta fetcher. The
//! conflict resolver turns either into a `SyncAction`. All three are sum
//! types with exhaustive matches downstream.

use serde::{Deserialize, Serialize};

use crate::hash::FOLDER_SENTINEL;
use crate::paths;

// ── Item kind ────────────────────────────────────────────────────────

/// What kind of item a change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Folder,
}

// ── Sync direction ───────────────────────────────────────────────────

/// Which way a batch moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Remote changes applied to the local tree.
    Download,
    /// Local changes pushed to the remote.
    Upload,
}

// ── Local changes ────────────────────────────────────────────────────

/// A coalesced mutation observed in the local tree.
///
/// A type change (folder replaced by file or vice versa) is represented as
/// `Deleted` of the old kind followed by `Created` of the new kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalChange {
    Created {
        path: String,
        kind: ItemKind,
    },
    Deleted {
        path: String,
        kind: ItemKind,
    },
    Modified {
        path: String,
    },
    Moved {
        src: String,
        dst: String,
        kind: ItemKind,
        /// Set when a `Modified` for the destination was coalesced into the
        /// move; content must be re-uploaded after the rename.
        modified: bool,
    },
}

impl LocalChange {
    /// Canonical path the change takes effect at (the destination for moves).
    pub fn path(&self) -> &str {
        match self {
            LocalChange::Created { path, .. } => path,
            LocalChange::Deleted { path, .. } => path,
            LocalChange::Modified { path } => path,
            LocalChange::Moved { dst, .. } => dst,
        }
    }

    /// Item kind if the change carries one (`Modified` is files only).
    pub fn kind(&self) -> ItemKind {
        match self {
            LocalChange::Created { kind, .. } => *kind,
            LocalChange::Deleted { kind, .. } => *kind,
            LocalChange::Modified { .. } => ItemKind::File,
            LocalChange::Moved { kind, .. } => *kind,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, LocalChange::Deleted { .. })
    }

    /// Depth used for hierarchical ordering (destination for moves).
    pub fn depth(&self) -> usize {
        paths::depth(self.path())
    }
}

// ── Remote changes ───────────────────────────────────────────────────

/// A delta entry materialized from the remote change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteChange {
    /// The item no longer exists remotely.
    DeletedMeta { path: String },
    /// A folder exists remotely.
    FolderMeta { path: String },
    /// A file exists remotely at a specific revision.
    FileMeta {
        path: String,
        rev: String,
        content_hash: String,
        server_modified_ms: i64,
    },
}

impl RemoteChange {
    pub fn path(&self) -> &str {
        match self {
            RemoteChange::DeletedMeta { path } => path,
            RemoteChange::FolderMeta { path } => path,
            RemoteChange::FileMeta { path, .. } => path,
        }
    }

    /// Item kind, `None` for deletions (the remote does not say what kind
    /// the deleted item was).
    pub fn kind(&self) -> Option<ItemKind> {
        match self {
            RemoteChange::DeletedMeta { .. } => None,
            RemoteChange::FolderMeta { .. } => Some(ItemKind::Folder),
            RemoteChange::FileMeta { .. } => Some(ItemKind::File),
        }
    }

    /// The revision this change asserts, using the folder sentinel.
    pub fn rev(&self) -> Option<&str> {
        match self {
            RemoteChange::DeletedMeta { .. } => None,
            RemoteChange::FolderMeta { .. } => Some(FOLDER_SENTINEL),
            RemoteChange::FileMeta { rev, .. } => Some(rev),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RemoteChange::DeletedMeta { .. })
    }

    pub fn depth(&self) -> usize {
        paths::depth(self.path())
    }
}

// ── Actions ──────────────────────────────────────────────────────────

/// What the conflict resolver decided to do with a single change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Execute the change as-is.
    Apply,
    /// Nothing to do; the sides already agree (or the change is moot).
    Skip,
    /// Content already matches but the index is stale: record the given
    /// rev/hash (or refresh `last_sync` for uploads) without transferring.
    SkipUpdateIndex {
        rev: Option<String>,
        content_hash: Option<String>,
    },
    /// Upload under a different name (selective-sync or case conflict);
    /// the local item is renamed to `new_path` first.
    RenameTarget { new_path: String },
    /// Preserve content that would otherwise be lost as a sibling copy at
    /// `copy_path`, then execute the change.
    CreateConflictCopy { copy_path: String },
}

/// A remote change paired with its resolution.
#[derive(Debug, Clone)]
pub struct ResolvedDownload {
    pub change: RemoteChange,
    pub action: SyncAction,
}

/// A local change paired with its resolution.
#[derive(Debug, Clone)]
pub struct ResolvedUpload {
    pub change: LocalChange,
    pub action: SyncAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_change_accessors() {
        let moved = LocalChange::Moved {
            src: "a/old.txt".into(),
            dst: "a/new.txt".into(),
            kind: ItemKind::File,
            modified: false,
        };
        assert_eq!(moved.path(), "a/new.txt");
        assert_eq!(moved.depth(), 2);
        assert!(!moved.is_delete());

        let deleted = LocalChange::Deleted {
            path: "x".into(),
            kind: ItemKind::Folder,
        };
        assert!(deleted.is_delete());
        assert_eq!(deleted.kind(), ItemKind::Folder);
    }

    #[test]
    fn remote_change_rev_uses_folder_sentinel() {
        let folder = RemoteChange::FolderMeta { path: "docs".into() };
        assert_eq!(folder.rev(), Some(FOLDER_SENTINEL));
        assert_eq!(folder.kind(), Some(ItemKind::Folder));

        let deleted = RemoteChange::DeletedMeta { path: "docs".into() };
        assert_eq!(deleted.rev(), None);
        assert_eq!(deleted.kind(), None);
    }
}
