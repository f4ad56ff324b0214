//! The persistent sync index.
//!
//! Maps canonical local paths to the last-known-good state of each synced
//! item: remote revision, content hash, and the time the item was last in
//! sync. Also persists the remote cursor. See [`store::IndexStore`].

pub mod store;

use serde::{Deserialize, Serialize};

use crate::change::ItemKind;
use crate::hash::FOLDER_SENTINEL;

pub use store::{IndexStore, IndexTxn, StoreError};

/// Last-known-good record for one synced item.
///
/// `rev == None` means "deleted / never synced"; such tombstones also carry
/// `content_hash == None`. Folders always use the `"folder"` sentinel for
/// both fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Canonical local path (the store key).
    pub path: String,
    pub kind: ItemKind,
    pub rev: Option<String>,
    pub content_hash: Option<String>,
    /// Unix milliseconds of the last successful sync of this item.
    pub last_sync_ms: i64,
}

impl IndexEntry {
    /// Entry for a synced folder.
    pub fn folder(path: impl Into<String>, last_sync_ms: i64) -> Self {
        Self {
            path: path.into(),
            kind: ItemKind::Folder,
            rev: Some(FOLDER_SENTINEL.to_string()),
            content_hash: Some(FOLDER_SENTINEL.to_string()),
            last_sync_ms,
        }
    }

    /// Entry for a synced file.
    pub fn file(
        path: impl Into<String>,
        rev: impl Into<String>,
        content_hash: impl Into<String>,
        last_sync_ms: i64,
    ) -> Self {
        Self {
            path: path.into(),
            kind: ItemKind::File,
            rev: Some(rev.into()),
            content_hash: Some(content_hash.into()),
            last_sync_ms,
        }
    }

    /// Tombstone: the item is deleted (or was never synced).
    pub fn tombstone(path: impl Into<String>, kind: ItemKind, last_sync_ms: i64) -> Self {
        Self {
            path: path.into(),
            kind,
            rev: None,
            content_hash: None,
            last_sync_ms,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.rev.is_none()
    }
}
