//! Apply workers: execute resolved actions against the local tree or the
//! remote client.
//!
//! A batch arrives in normalized order. The executor walks it in stages:
//! consecutive same-depth file actions fan out across a bounded worker pool
//! (default parallelism 6); folder operations and deletions run serialized
//! so hierarchy invariants hold. Every worker claims its canonical path in
//! the shared in-flight set first, retries transient failures with
//! exponential backoff, and finishes by committing its index mutation in a
//! store transaction. The batch cursor is committed only after every action
//! of the batch has been durably applied or durably recorded.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::change::{
    ItemKind, LocalChange, RemoteChange, ResolvedDownload, ResolvedUpload, SyncAction, SyncDirection,
};
use crate::config::RetryPolicy;
use crate::error::{ErrorClass, SyncError};
use crate::index::{IndexEntry, IndexStore};
use crate::paths;
use crate::remote::{RemoteClient, RemoteError};

/// Granularity of cancellation checks during backoff sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

// ── In-flight path set ───────────────────────────────────────────────

/// Guards the "at most one in-flight action per canonical path" invariant.
/// Workers claim on take and release on completion; a conflicting claim
/// waits and re-tries.
pub struct InFlightPaths {
    set: Mutex<HashSet<String>>,
}

impl InFlightPaths {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(HashSet::new()),
        }
    }

    /// The set holds plain path strings; a panicked holder cannot corrupt
    /// it, so a poisoned lock is recovered rather than propagated.
    fn locked(&self) -> MutexGuard<'_, HashSet<String>> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim every path at once, or none. Multi-path claims (moves) are
    /// all-or-nothing so two waiters cannot deadlock on reversed order.
    pub fn try_claim(&self, claim_paths: &[String]) -> bool {
        let mut set = self.locked();
        if claim_paths.iter().any(|p| set.contains(p)) {
            return false;
        }
        for p in claim_paths {
            set.insert(p.clone());
        }
        true
    }

    pub fn release(&self, claim_paths: &[String]) {
        let mut set = self.locked();
        for p in claim_paths {
            set.remove(p);
        }
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InFlightPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII claim over a set of canonical paths.
struct PathClaim {
    inflight: Arc<InFlightPaths>,
    claim_paths: Vec<String>,
}

impl PathClaim {
    /// Wait until every path is free, then claim them.
    async fn acquire(inflight: Arc<InFlightPaths>, mut claim_paths: Vec<String>) -> Self {
        claim_paths.sort();
        claim_paths.dedup();
        loop {
            if inflight.try_claim(&claim_paths) {
                return Self { inflight, claim_paths };
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        self.inflight.release(&self.claim_paths);
    }
}

// ── Outcomes and summaries ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Applied,
    Skipped,
    /// Applied with a conflict side effect (copy created, target renamed,
    /// or the remote rejected with a rev mismatch and will produce its own
    /// conflict copy).
    Conflict,
}

/// One permanently failed item, packaged as a value for the monitor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub path: String,
    pub kind: String,
    pub message: String,
    #[serde(skip)]
    pub class: ErrorClass,
}

/// What happened to a batch, handed to `on_batch_applied`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub direction: SyncDirection,
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: Vec<FailedItem>,
    /// A download hit `NotFound` (item vanished between list and fetch);
    /// the monitor must re-list from scratch.
    pub needs_full_relist: bool,
    /// The batch cursor was committed (download direction only).
    pub cursor_committed: bool,
}

impl BatchSummary {
    fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            applied: 0,
            skipped: 0,
            conflicts: 0,
            failed: Vec::new(),
            needs_full_relist: false,
            cursor_committed: false,
        }
    }

    fn record(&mut self, path: &str, result: Result<TaskOutcome, SyncError>) {
        match result {
            Ok(TaskOutcome::Applied) => self.applied += 1,
            Ok(TaskOutcome::Skipped) => self.skipped += 1,
            Ok(TaskOutcome::Conflict) => self.conflicts += 1,
            Err(e) => {
                if matches!(e, SyncError::Remote(RemoteError::NotFound))
                    && self.direction == SyncDirection::Download
                {
                    self.needs_full_relist = true;
                }
                log::warn!("Apply failed for {path}: {e}");
                self.failed.push(FailedItem {
                    path: path.to_string(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    class: e.class(),
                });
            }
        }
    }

    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.conflicts + self.failed.len()
    }

    /// The most severe escalation among the failures, if any.
    pub fn worst_class(&self) -> Option<ErrorClass> {
        let rank = |c: &ErrorClass| match c {
            ErrorClass::Fatal => 4,
            ErrorClass::Auth => 3,
            ErrorClass::UploadHalting => 2,
            ErrorClass::Transient => 1,
            ErrorClass::Permanent => 0,
        };
        self.failed.iter().map(|f| f.class).max_by_key(rank)
    }
}

// ── Shared worker context ────────────────────────────────────────────

pub struct ApplyCtx {
    pub root: PathBuf,
    pub cache_dir: PathBuf,
    pub index: Arc<IndexStore>,
    pub client: Arc<dyn RemoteClient>,
    pub retry: RetryPolicy,
    pub cancel: Arc<AtomicBool>,
    pub inflight: Arc<InFlightPaths>,
    pub parallelism: usize,
}

impl ApplyCtx {
    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

// ── Stage planning ───────────────────────────────────────────────────

enum Stage<T> {
    Serial(T),
    Parallel(Vec<T>),
}

/// Partition a normalized batch into execution stages: consecutive
/// same-depth file actions become one parallel stage, everything else runs
/// serially in order.
fn plan_stages<T>(items: Vec<T>, parallel_eligible: impl Fn(&T) -> bool, depth_of: impl Fn(&T) -> usize) -> Vec<Stage<T>> {
    let mut stages = Vec::new();
    let mut group: Vec<T> = Vec::new();
    let mut group_depth = 0usize;

    let flush = |group: &mut Vec<T>, stages: &mut Vec<Stage<T>>| {
        if group.len() == 1 {
            if let Some(item) = group.pop() {
                stages.push(Stage::Serial(item));
            }
        } else if !group.is_empty() {
            stages.push(Stage::Parallel(std::mem::take(group)));
        }
    };

    for item in items {
        if parallel_eligible(&item) {
            let depth = depth_of(&item);
            if !group.is_empty() && depth != group_depth {
                flush(&mut group, &mut stages);
            }
            group_depth = depth;
            group.push(item);
        } else {
            flush(&mut group, &mut stages);
            stages.push(Stage::Serial(item));
        }
    }
    flush(&mut group, &mut stages);
    stages
}

// ── Public entry points ──────────────────────────────────────────────

/// Apply a resolved download batch, then commit `cursor` if every action
/// was durably applied or durably recorded as skipped/conflicted.
pub async fn apply_download_batch(
    ctx: Arc<ApplyCtx>,
    batch: Vec<ResolvedDownload>,
    cursor: &str,
) -> BatchSummary {
    let stages = plan_stages(
        batch,
        |item| matches!(item.change, RemoteChange::FileMeta { .. }) && item.action != SyncAction::Skip,
        |item| item.change.depth(),
    );

    let mut summary = BatchSummary::new(SyncDirection::Download);
    run_stages(&ctx, stages, &mut summary, |ctx, item| {
        let path = item.change.path().to_string();
        let result = execute_download(ctx, &item);
        (path, result)
    })
    .await;

    // A failed item will be redelivered when the cursor stays put; applying
    // it again is idempotent. Only a fully recorded batch moves the cursor.
    if summary.failed.is_empty() && !summary.needs_full_relist {
        match ctx.index.transaction(|txn| txn.set_cursor(cursor)) {
            Ok(()) => summary.cursor_committed = true,
            Err(e) => {
                log::warn!("Cursor commit failed: {e}");
                summary.failed.push(FailedItem {
                    path: String::new(),
                    kind: "storage_io".into(),
                    message: e.to_string(),
                    class: SyncError::from(e).class(),
                });
            }
        }
    }
    summary
}

/// Apply a resolved upload batch.
pub async fn apply_upload_batch(ctx: Arc<ApplyCtx>, batch: Vec<ResolvedUpload>) -> BatchSummary {
    let stages = plan_stages(
        batch,
        |item| {
            matches!(item.change.kind(), ItemKind::File)
                && !item.change.is_delete()
                && item.action != SyncAction::Skip
        },
        |item| item.change.depth(),
    );

    let mut summary = BatchSummary::new(SyncDirection::Upload);
    run_stages(&ctx, stages, &mut summary, |ctx, item| {
        let path = item.change.path().to_string();
        let result = execute_upload(ctx, &item);
        (path, result)
    })
    .await;
    summary
}

async fn run_stages<T: Send + 'static>(
    ctx: &Arc<ApplyCtx>,
    stages: Vec<Stage<T>>,
    summary: &mut BatchSummary,
    execute: fn(&ApplyCtx, T) -> (String, Result<TaskOutcome, SyncError>),
) where
    T: ClaimPaths,
{
    for stage in stages {
        // Stopping blocks new work; in-flight tasks have already finished
        // by the time we get here because stages are awaited in order.
        if ctx.cancel.load(Ordering::Relaxed) {
            break;
        }
        match stage {
            Stage::Serial(item) => {
                let (path, result) = run_claimed(ctx.clone(), item, execute).await;
                summary.record(&path, result);
            }
            Stage::Parallel(items) => {
                let semaphore = Arc::new(tokio::sync::Semaphore::new(ctx.parallelism));
                let mut join_set = JoinSet::new();
                for item in items {
                    let ctx = ctx.clone();
                    let semaphore = semaphore.clone();
                    join_set.spawn(async move {
                        // The semaphore lives for the whole stage; acquire
                        // only fails if it were closed, which never happens.
                        let _permit = semaphore.acquire_owned().await.ok();
                        run_claimed(ctx, item, execute).await
                    });
                }
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok((path, result)) => summary.record(&path, result),
                        Err(e) => log::warn!("Apply worker task failed: {e}"),
                    }
                }
            }
        }
    }
}

async fn run_claimed<T: Send + 'static>(
    ctx: Arc<ApplyCtx>,
    item: T,
    execute: fn(&ApplyCtx, T) -> (String, Result<TaskOutcome, SyncError>),
) -> (String, Result<TaskOutcome, SyncError>)
where
    T: ClaimPaths,
{
    let claim = PathClaim::acquire(ctx.inflight.clone(), item.claim_paths()).await;
    let result = tokio::task::spawn_blocking(move || {
        let out = execute(&ctx, item);
        drop(claim);
        out
    })
    .await;
    match result {
        Ok(out) => out,
        Err(e) => (
            String::new(),
            Err(SyncError::io("", std::io::Error::other(format!("worker panicked: {e}")))),
        ),
    }
}

/// Canonical paths a task must hold in the in-flight set.
trait ClaimPaths {
    fn claim_paths(&self) -> Vec<String>;
}

impl ClaimPaths for ResolvedDownload {
    fn claim_paths(&self) -> Vec<String> {
        let mut claim = vec![self.change.path().to_string()];
        if let SyncAction::CreateConflictCopy { copy_path } = &self.action {
            claim.push(copy_path.clone());
        }
        claim
    }
}

impl ClaimPaths for ResolvedUpload {
    fn claim_paths(&self) -> Vec<String> {
        let mut claim = vec![self.change.path().to_string()];
        if let LocalChange::Moved { src, .. } = &self.change {
            claim.push(src.clone());
        }
        match &self.action {
            SyncAction::RenameTarget { new_path } => claim.push(new_path.clone()),
            SyncAction::CreateConflictCopy { copy_path } => claim.push(copy_path.clone()),
            _ => {}
        }
        claim
    }
}

// ── Retry ────────────────────────────────────────────────────────────

/// Run a blocking operation with exponential backoff on transient errors.
fn with_retry<T>(
    ctx: &ApplyCtx,
    what: &str,
    mut op: impl FnMut() -> Result<T, SyncError>,
) -> Result<T, SyncError> {
    let policy = ctx.retry;
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.class() == ErrorClass::Transient && attempt + 1 < policy.max_attempts => {
                let mut delay = backoff_delay(&policy, attempt);
                if let SyncError::Remote(RemoteError::RateLimited { retry_after_ms }) = &e {
                    delay = delay.max(Duration::from_millis(*retry_after_ms));
                }
                attempt += 1;
                log::debug!("{what}: transient failure ({e}), retry {attempt} in {delay:?}");
                if !sleep_cancellable(ctx, delay) {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Backoff for the given 0-based attempt: base × factor^attempt, capped,
/// with ±jitter applied.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let raw = policy.base_delay_ms as f64 * policy.factor.powi(attempt as i32);
    let capped = raw.min(policy.max_delay_ms as f64);
    let jittered = capped * rand::rng().random_range(1.0 - policy.jitter..=1.0 + policy.jitter);
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Sleep in small slices, observing the cancellation flag. Returns `false`
/// if cancelled.
fn sleep_cancellable(ctx: &ApplyCtx, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if ctx.cancel.load(Ordering::Relaxed) {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    !ctx.cancel.load(Ordering::Relaxed)
}

// ── Download execution ───────────────────────────────────────────────

fn execute_download(ctx: &ApplyCtx, item: &ResolvedDownload) -> Result<TaskOutcome, SyncError> {
    let path = item.change.path();
    match &item.action {
        SyncAction::Skip => Ok(TaskOutcome::Skipped),
        SyncAction::SkipUpdateIndex { rev, content_hash } => {
            let entry = index_entry_for_remote(&item.change, rev.clone(), content_hash.clone());
            ctx.index.transaction(|txn| txn.put(&entry))?;
            Ok(TaskOutcome::Skipped)
        }
        SyncAction::Apply => {
            perform_remote_change(ctx, &item.change)?;
            Ok(TaskOutcome::Applied)
        }
        SyncAction::CreateConflictCopy { copy_path } => {
            preserve_as_copy(ctx, path, copy_path)?;
            perform_remote_change(ctx, &item.change)?;
            Ok(TaskOutcome::Conflict)
        }
        SyncAction::RenameTarget { .. } => {
            // Rename targets only arise in the upload direction.
            log::warn!("Unexpected RenameTarget in download apply for {path}");
            Ok(TaskOutcome::Skipped)
        }
    }
}

/// Materialize one remote change in the local tree and record it.
fn perform_remote_change(ctx: &ApplyCtx, change: &RemoteChange) -> Result<TaskOutcome, SyncError> {
    match change {
        RemoteChange::DeletedMeta { path } => {
            remove_local(&ctx.abs(path)).map_err(|e| SyncError::io(path, e))?;
            ctx.index.transaction(|txn| txn.delete_prefix(path))?;
        }
        RemoteChange::FolderMeta { path } => {
            std::fs::create_dir_all(ctx.abs(path)).map_err(|e| SyncError::io(path, e))?;
            let entry = IndexEntry::folder(path.clone(), now_ms());
            ctx.index.transaction(|txn| txn.put(&entry))?;
        }
        RemoteChange::FileMeta {
            path,
            rev,
            content_hash,
            ..
        } => {
            download_to(ctx, path, rev)?;
            let entry = IndexEntry::file(path.clone(), rev.clone(), content_hash.clone(), now_ms());
            ctx.index.transaction(|txn| txn.put(&entry))?;
        }
    }
    Ok(TaskOutcome::Applied)
}

/// Stream a remote file into a temp file in the cache directory, then move
/// it atomically into place.
fn download_to(ctx: &ApplyCtx, path: &str, rev: &str) -> Result<(), SyncError> {
    let abs = ctx.abs(path);
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SyncError::io(path, e))?;
    }
    // The in-flight claim on `path` makes this temp name unique.
    let temp = ctx
        .cache_dir
        .join(format!("dl-{}", paths::case_fold(path).replace('/', "_")));

    with_retry(ctx, path, || {
        let mut reader = ctx.client.download(path, rev)?;
        let mut file = std::fs::File::create(&temp).map_err(|e| SyncError::io(path, e))?;
        std::io::copy(&mut reader, &mut file).map_err(|e| SyncError::io(path, e))?;
        Ok(())
    })?;

    std::fs::rename(&temp, &abs).map_err(|e| SyncError::io(path, e))?;
    Ok(())
}

/// Rename an existing local item aside as a conflict copy.
fn preserve_as_copy(ctx: &ApplyCtx, path: &str, copy_path: &str) -> Result<(), SyncError> {
    match std::fs::rename(ctx.abs(path), ctx.abs(copy_path)) {
        Ok(()) => {
            log::info!("Preserved {path} as conflict copy {copy_path}");
            Ok(())
        }
        // Vanished between resolution and apply: nothing left to preserve.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

// ── Upload execution ─────────────────────────────────────────────────

fn execute_upload(ctx: &ApplyCtx, item: &ResolvedUpload) -> Result<TaskOutcome, SyncError> {
    match &item.action {
        SyncAction::Skip => Ok(TaskOutcome::Skipped),
        SyncAction::SkipUpdateIndex { rev, content_hash } => {
            let entry = IndexEntry {
                path: item.change.path().to_string(),
                kind: item.change.kind(),
                rev: rev.clone(),
                content_hash: content_hash.clone(),
                last_sync_ms: now_ms(),
            };
            ctx.index.transaction(|txn| txn.put(&entry))?;
            Ok(TaskOutcome::Skipped)
        }
        SyncAction::Apply => perform_local_change(ctx, &item.change),
        SyncAction::RenameTarget { new_path } => {
            let old_path = item.change.path();
            match std::fs::rename(ctx.abs(old_path), ctx.abs(new_path)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TaskOutcome::Skipped),
                Err(e) => return Err(SyncError::io(old_path, e)),
            }
            log::info!("Renamed {old_path} to {new_path} before upload");
            ctx.index.transaction(|txn| txn.delete(old_path))?;
            push_item(ctx, new_path, item.change.kind(), None)?;
            Ok(TaskOutcome::Conflict)
        }
        SyncAction::CreateConflictCopy { copy_path } => {
            // Type change racing a newer remote: keep the remote bytes as a
            // local sibling, then push the local item over the original.
            let path = item.change.path();
            if let Some(RemoteChange::FileMeta { rev, .. }) = ctx.client.get_metadata(path)? {
                download_conflict_copy(ctx, path, &rev, copy_path)?;
            }
            push_item(ctx, path, item.change.kind(), None)?;
            Ok(TaskOutcome::Conflict)
        }
    }
}

fn perform_local_change(ctx: &ApplyCtx, change: &LocalChange) -> Result<TaskOutcome, SyncError> {
    match change {
        LocalChange::Created { path, .. } | LocalChange::Modified { path } => {
            let if_match = ctx.index.get(path)?.and_then(|e| e.rev);
            push_item(ctx, path, change.kind(), if_match.as_deref())
        }
        LocalChange::Deleted { path, .. } => {
            let if_match = ctx.index.get(path)?.and_then(|e| e.rev);
            let result = with_retry(ctx, path, || {
                ctx.client.delete(path, if_match.as_deref()).map_err(SyncError::from)
            });
            match result {
                Ok(()) | Err(SyncError::Remote(RemoteError::NotFound)) => {
                    // Deleting something already gone is success.
                    ctx.index.transaction(|txn| txn.delete_prefix(path))?;
                    Ok(TaskOutcome::Applied)
                }
                Err(SyncError::Remote(RemoteError::Conflict { rev })) => {
                    // Remote moved past us; keep it and let the next
                    // download cycle bring the newer content back.
                    log::info!("Delete of {path} rejected, remote at {rev}");
                    Ok(TaskOutcome::Conflict)
                }
                Err(e) => Err(e),
            }
        }
        LocalChange::Moved {
            src,
            dst,
            kind,
            modified,
        } => {
            let if_match = ctx.index.get(src)?.and_then(|e| e.rev);
            let result = with_retry(ctx, dst, || {
                ctx.client.rename(src, dst, if_match.as_deref()).map_err(SyncError::from)
            });
            match result {
                Ok(()) => {
                    record_move(ctx, src, dst)?;
                    if *modified && matches!(kind, ItemKind::File) {
                        return push_item(ctx, dst, *kind, None);
                    }
                    Ok(TaskOutcome::Applied)
                }
                Err(SyncError::Remote(RemoteError::NotFound)) => {
                    // Source never made it remotely; treat as a fresh push.
                    ctx.index.transaction(|txn| txn.delete_prefix(src))?;
                    push_item(ctx, dst, *kind, None)
                }
                Err(SyncError::Remote(RemoteError::Conflict { rev })) => {
                    log::info!("Move {src} -> {dst} rejected, remote at {rev}");
                    Ok(TaskOutcome::Conflict)
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Upload a file's content or create a folder remotely, then record it.
fn push_item(ctx: &ApplyCtx, path: &str, kind: ItemKind, if_match: Option<&str>) -> Result<TaskOutcome, SyncError> {
    match kind {
        ItemKind::Folder => {
            let result = with_retry(ctx, path, || {
                ctx.client.create_folder(path).map_err(SyncError::from)
            });
            match result {
                Ok(()) | Err(SyncError::Remote(RemoteError::Conflict { .. })) => {
                    // An existing remote folder satisfies the intent.
                    let entry = IndexEntry::folder(path.to_string(), now_ms());
                    ctx.index.transaction(|txn| txn.put(&entry))?;
                    Ok(TaskOutcome::Applied)
                }
                Err(e) => Err(e),
            }
        }
        ItemKind::File => {
            let abs = ctx.abs(path);
            let result = with_retry(ctx, path, || {
                let mut file = match std::fs::File::open(&abs) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(SyncError::Remote(RemoteError::NotFound));
                    }
                    Err(e) => return Err(SyncError::io(path, e)),
                };
                ctx.client
                    .upload(path, &mut file as &mut dyn Read, if_match)
                    .map_err(SyncError::from)
            });
            match result {
                Ok(meta) => {
                    let entry = IndexEntry::file(path.to_string(), meta.rev, meta.content_hash, now_ms());
                    ctx.index.transaction(|txn| txn.put(&entry))?;
                    Ok(TaskOutcome::Applied)
                }
                // File vanished before the upload: drop the event.
                Err(SyncError::Remote(RemoteError::NotFound)) => Ok(TaskOutcome::Skipped),
                Err(SyncError::Remote(RemoteError::Conflict { rev })) => {
                    // The remote keeps our bytes as a server-side conflict
                    // copy; the next delta will surface it.
                    log::info!("Upload of {path} rejected, remote at {rev}");
                    Ok(TaskOutcome::Conflict)
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Re-key the index for a completed remote rename, children included.
fn record_move(ctx: &ApplyCtx, src: &str, dst: &str) -> Result<(), SyncError> {
    let moved = ctx.index.iter_prefix(src)?;
    let now = now_ms();
    ctx.index.transaction(|txn| {
        txn.delete_prefix(src)?;
        for mut entry in moved {
            let suffix = entry.path[src.len()..].to_string();
            entry.path = format!("{dst}{suffix}");
            // Revisions change server-side on move; the next delta refreshes
            // them, the re-keyed rows keep lookups coherent meanwhile.
            entry.last_sync_ms = now;
            txn.put(&entry)?;
        }
        Ok(())
    })?;
    Ok(())
}

/// Download the remote's current bytes for `path` to a conflict-copy
/// sibling before a type-change upload replaces them.
fn download_conflict_copy(ctx: &ApplyCtx, path: &str, rev: &str, copy_path: &str) -> Result<(), SyncError> {
    let abs_copy = ctx.abs(copy_path);
    if let Some(parent) = abs_copy.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SyncError::io(copy_path, e))?;
    }
    with_retry(ctx, copy_path, || {
        let mut reader = ctx.client.download(path, rev)?;
        let mut file = std::fs::File::create(&abs_copy).map_err(|e| SyncError::io(copy_path, e))?;
        std::io::copy(&mut reader, &mut file).map_err(|e| SyncError::io(copy_path, e))?;
        Ok(())
    })?;
    log::info!("Preserved remote content of {path} as {copy_path}");
    Ok(())
}

// ── Shared helpers ───────────────────────────────────────────────────

fn index_entry_for_remote(change: &RemoteChange, rev: Option<String>, content_hash: Option<String>) -> IndexEntry {
    IndexEntry {
        path: change.path().to_string(),
        kind: change.kind().unwrap_or(ItemKind::File),
        rev,
        content_hash,
        last_sync_ms: now_ms(),
    }
}

/// Delete a local file or directory tree; missing targets count as done.
fn remove_local(abs: &Path) -> std::io::Result<()> {
    let meta = match std::fs::symlink_metadata(abs) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(abs)
    } else {
        std::fs::remove_file(abs)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_claims_are_exclusive() {
        let inflight = InFlightPaths::new();
        assert!(inflight.try_claim(&["a.txt".into()]));
        assert!(!inflight.try_claim(&["a.txt".into()]));
        assert!(inflight.try_claim(&["b.txt".into()]));

        inflight.release(&["a.txt".into()]);
        assert!(inflight.try_claim(&["a.txt".into()]));
    }

    #[test]
    fn multi_path_claim_is_all_or_nothing() {
        let inflight = InFlightPaths::new();
        assert!(inflight.try_claim(&["a".into()]));

        // One of the two is taken: nothing is claimed.
        assert!(!inflight.try_claim(&["a".into(), "b".into()]));
        assert!(inflight.try_claim(&["b".into()]));
        assert_eq!(inflight.len(), 2);
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let inflight = Arc::new(InFlightPaths::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let inflight = inflight.clone();
                let counter = counter.clone();
                let max_seen = max_seen.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let claim_paths = vec!["shared.txt".to_string()];
                        while !inflight.try_claim(&claim_paths) {
                            std::hint::spin_loop();
                        }
                        let holders = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(holders, Ordering::SeqCst);
                        counter.fetch_sub(1, Ordering::SeqCst);
                        inflight.release(&claim_paths);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "two workers held one path");
        assert!(inflight.is_empty());
    }

    #[test]
    fn stage_planning_groups_same_depth_files() {
        #[derive(Debug, PartialEq)]
        struct Item(usize, bool); // (depth, parallel-eligible)

        let stages = plan_stages(
            vec![Item(2, true), Item(2, true), Item(1, false), Item(1, true), Item(2, true)],
            |i| i.1,
            |i| i.0,
        );

        assert_eq!(stages.len(), 4);
        assert!(matches!(&stages[0], Stage::Parallel(items) if items.len() == 2));
        assert!(matches!(&stages[1], Stage::Serial(Item(1, false))));
        assert!(matches!(&stages[2], Stage::Serial(Item(1, true))));
        assert!(matches!(&stages[3], Stage::Serial(Item(2, true))));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            factor: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.2,
            max_attempts: 5,
        };
        // Attempt 0: ~1s ± 20%.
        let d0 = backoff_delay(&policy, 0);
        assert!(d0 >= Duration::from_millis(800) && d0 <= Duration::from_millis(1200), "{d0:?}");
        // Attempt 10 would be ~1024s raw; capped at 60s ± 20%.
        let d10 = backoff_delay(&policy, 10);
        assert!(d10 <= Duration::from_millis(72_000), "{d10:?}");
        assert!(d10 >= Duration::from_millis(48_000), "{d10:?}");
    }

    #[test]
    fn remove_local_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"x").unwrap();

        remove_local(&file).unwrap();
        remove_local(&file).unwrap(); // second delete: NotFound is success

        let tree = dir.path().join("sub");
        std::fs::create_dir_all(tree.join("deep")).unwrap();
        std::fs::write(tree.join("deep/a.txt"), b"y").unwrap();
        remove_local(&tree).unwrap();
        assert!(!tree.exists());
    }

    #[test]
    fn summary_worst_class_ranks_severity() {
        let mut summary = BatchSummary::new(SyncDirection::Upload);
        summary.record("a", Err(SyncError::Remote(RemoteError::Server("x".into()))));
        summary.record("b", Err(SyncError::Remote(RemoteError::InsufficientQuota)));
        assert_eq!(summary.worst_class(), Some(ErrorClass::UploadHalting));

        summary.record("c", Err(SyncError::Remote(RemoteError::AuthExpired)));
        assert_eq!(summary.worst_class(), Some(ErrorClass::Auth));
    }

    #[test]
    fn download_not_found_requests_full_relist() {
        let mut summary = BatchSummary::new(SyncDirection::Download);
        summary.record("gone.txt", Err(SyncError::Remote(RemoteError::NotFound)));
        assert!(summary.needs_full_relist);

        // Upload direction does not trigger a re-list.
        let mut summary = BatchSummary::new(SyncDirection::Upload);
        summary.record("gone.txt", Err(SyncError::Remote(RemoteError::NotFound)));
        assert!(!summary.needs_full_relist);
    }
}
