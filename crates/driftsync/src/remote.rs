//! The remote file-store capability and the change fetcher.
//!
//! The engine never speaks HTTP itself: it consumes a blocking
//! [`RemoteClient`] implementation (the production one wraps the cloud API
//! with OAuth and long-polling). Calls run under `spawn_blocking` from the
//! monitor loops and apply workers. The client is thread-safe and shared;
//! it rate-limits internally.

use std::io::Read;
use std::time::Duration;

use crate::change::RemoteChange;

// ── Errors ───────────────────────────────────────────────────────────

/// Failure modes of remote calls, grouped by the policies in the monitor:
/// `Network`/`RateLimited` retry with backoff, `Conflict` defers to the
/// remote's server-side conflict copy, `AuthExpired` pauses both loops,
/// quota/permission failures halt the upload direction only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    Network(String),
    RateLimited { retry_after_ms: u64 },
    AuthExpired,
    NotFound,
    Conflict { rev: String },
    InsufficientQuota,
    PermissionDenied,
    Server(String),
}

impl RemoteError {
    /// Whether retrying the same call can succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::RateLimited { .. })
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Network(msg) => write!(f, "network error: {msg}"),
            RemoteError::RateLimited { retry_after_ms } => {
                write!(f, "rate limited (retry after {retry_after_ms} ms)")
            }
            RemoteError::AuthExpired => write!(f, "authentication expired"),
            RemoteError::NotFound => write!(f, "item not found"),
            RemoteError::Conflict { rev } => write!(f, "revision conflict (remote at {rev})"),
            RemoteError::InsufficientQuota => write!(f, "insufficient quota"),
            RemoteError::PermissionDenied => write!(f, "permission denied"),
            RemoteError::Server(msg) => write!(f, "server error: {msg}"),
        }
    }
}

impl std::error::Error for RemoteError {}

// ── Wire types ───────────────────────────────────────────────────────

/// Metadata returned by a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMeta {
    pub path: String,
    pub rev: String,
    pub content_hash: String,
    pub server_modified_ms: i64,
}

/// One page of the remote change stream.
#[derive(Debug, Clone)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    /// Cursor identifying the position *after* this page.
    pub cursor: String,
    /// The supplied cursor was invalid; the caller must discard its cursor
    /// and reconcile from a full listing.
    pub reset: bool,
    /// More pages are immediately available.
    pub has_more: bool,
}

// ── Capability ───────────────────────────────────────────────────────

/// Blocking client for the remote store. Paths are canonical engine paths;
/// the remote is case-preserving but case-insensitive, so implementations
/// must fold case for lookups.
pub trait RemoteClient: Send + Sync {
    /// List changes after `cursor`; `None` requests a full listing from the
    /// beginning of time.
    fn list_changes(&self, cursor: Option<&str>) -> Result<ChangePage, RemoteError>;

    /// Block until changes exist after `cursor` or the timeout elapses.
    /// Returns `true` if changes are waiting.
    fn wait_for_changes(&self, cursor: &str, timeout: Duration) -> Result<bool, RemoteError>;

    /// Stream the content of a file at a specific revision.
    fn download(&self, path: &str, rev: &str) -> Result<Box<dyn Read + Send>, RemoteError>;

    /// Upload file content. `if_match` of `None` means unconditional;
    /// otherwise the remote rejects with [`RemoteError::Conflict`] when its
    /// current revision differs (and creates a server-side conflict copy).
    fn upload(
        &self,
        path: &str,
        contents: &mut dyn Read,
        if_match: Option<&str>,
    ) -> Result<UploadedMeta, RemoteError>;

    fn create_folder(&self, path: &str) -> Result<(), RemoteError>;

    fn delete(&self, path: &str, if_match: Option<&str>) -> Result<(), RemoteError>;

    fn rename(&self, src: &str, dst: &str, if_match: Option<&str>) -> Result<(), RemoteError>;

    /// Metadata of everything directly under `path` (empty string = root).
    fn list_folder(&self, path: &str) -> Result<Vec<RemoteChange>, RemoteError>;

    /// Metadata of a single item, `None` if absent.
    fn get_metadata(&self, path: &str) -> Result<Option<RemoteChange>, RemoteError>;
}

// ── Change fetcher ───────────────────────────────────────────────────

/// A fully drained delta: every immediately available page, concatenated.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub changes: Vec<RemoteChange>,
    pub cursor: String,
    pub reset: bool,
}

/// Drains the remote change stream page by page.
pub struct ChangeFetcher<'a> {
    client: &'a dyn RemoteClient,
}

impl<'a> ChangeFetcher<'a> {
    pub fn new(client: &'a dyn RemoteClient) -> Self {
        Self { client }
    }

    /// Fetch all pages available after `cursor` and materialize them as one
    /// batch. If any page signals a reset, fetching stops immediately and
    /// the caller discards its cursor.
    pub fn fetch(&self, cursor: Option<&str>) -> Result<FetchedBatch, RemoteError> {
        let mut page = self.client.list_changes(cursor)?;
        if page.reset {
            return Ok(FetchedBatch {
                changes: Vec::new(),
                cursor: page.cursor,
                reset: true,
            });
        }

        let mut changes = std::mem::take(&mut page.changes);
        let mut next_cursor = page.cursor;
        let mut has_more = page.has_more;

        while has_more {
            let mut next = self.client.list_changes(Some(&next_cursor))?;
            if next.reset {
                return Ok(FetchedBatch {
                    changes: Vec::new(),
                    cursor: next.cursor,
                    reset: true,
                });
            }
            changes.append(&mut next.changes);
            next_cursor = next.cursor;
            has_more = next.has_more;
        }

        log::debug!("Fetched {} remote changes (cursor {next_cursor})", changes.len());
        Ok(FetchedBatch {
            changes,
            cursor: next_cursor,
            reset: false,
        })
    }
}
