//! The sync monitor: lifecycle supervisor for the engine.
//!
//! Owns the index, the remote client, the watcher pump, and the worker
//! pool, and schedules the three long-lived activities of the `Syncing`
//! state: the download loop (long-poll, fetch, normalize, resolve, apply,
//! advance cursor), the upload loop (debounced local batches through the
//! same stages), and periodic maintenance (reconcile scan, tombstone
//! purge, index compaction). There is no global state: the engine is a
//! value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::apply::{self, ApplyCtx, BatchSummary, InFlightPaths};
use crate::change::{LocalChange, ResolvedDownload, ResolvedUpload};
use crate::config::SyncConfig;
use crate::error::{ErrorClass, SyncError};
use crate::ignore::PathFilters;
use crate::index::IndexStore;
use crate::normalize;
use crate::reconcile;
use crate::remote::{ChangeFetcher, RemoteClient};
use crate::resolve::Resolver;
use crate::watcher::{FsEventHandler, LocalWatcher};

/// Tombstones older than this are purged by maintenance.
const TOMBSTONE_TTL_MS: i64 = 30 * 24 * 3600 * 1000;

// ── States and notifications ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// The user asked for a pause.
    Requested,
    /// Authentication expired; both loops halted until re-auth.
    AuthRequired,
    /// A persistent error stopped the engine from making progress.
    PersistentError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Stopped,
    Starting,
    Syncing,
    Paused(PauseReason),
    Stopping,
}

/// Outward notification hooks. All methods default to no-ops so sinks
/// implement only what they surface.
pub trait EventSink: Send + Sync {
    fn on_batch_applied(&self, _summary: &BatchSummary) {}
    fn on_error(&self, _kind: &str, _path: Option<&str>, _message: &str) {}
    fn on_state_change(&self, _old: SyncState, _new: SyncState) {}
}

/// Sink that swallows everything.
pub struct NullSink;

impl EventSink for NullSink {}

// ── Shared engine state ──────────────────────────────────────────────

struct Shared {
    config: SyncConfig,
    filters: PathFilters,
    index: Arc<IndexStore>,
    client: Arc<dyn RemoteClient>,
    sink: Arc<dyn EventSink>,
    inflight: Arc<InFlightPaths>,
    /// Stop signal: observed by every loop, the watcher pump, and retry
    /// backoff sleeps.
    cancel: Arc<AtomicBool>,
    /// Pause: no new batches start; in-flight work drains naturally.
    paused: AtomicBool,
    /// Quota/permission failures halt uploads while downloads continue.
    upload_halted: AtomicBool,
    state: Mutex<SyncState>,
    paused_since_ms: Mutex<Option<i64>>,
    case_insensitive: bool,
}

impl Shared {
    // State and pause bookkeeping are plain copyable values, so poisoned
    // locks are recovered rather than propagated.
    fn set_state(&self, new: SyncState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let old = *state;
        if old != new {
            *state = new;
            log::info!("Sync state: {old:?} -> {new:?}");
            self.sink.on_state_change(old, new);
        }
    }

    fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_ctx(&self) -> Arc<ApplyCtx> {
        Arc::new(ApplyCtx {
            root: self.config.local_root.clone(),
            cache_dir: self.config.cache_dir(),
            index: self.index.clone(),
            client: self.client.clone(),
            retry: self.config.retry,
            cancel: self.cancel.clone(),
            inflight: self.inflight.clone(),
            parallelism: self.config.worker_parallelism,
        })
    }

    fn resolver<'a>(&'a self) -> Resolver<'a> {
        Resolver::new(
            &self.index,
            &self.filters,
            &self.config.local_root,
            self.case_insensitive,
        )
    }

    /// Surface a batch's failures and apply the escalation policy.
    fn escalate(&self, summary: &BatchSummary) {
        for failure in &summary.failed {
            self.sink
                .on_error(&failure.kind, Some(&failure.path), &failure.message);
        }
        match summary.worst_class() {
            Some(ErrorClass::Fatal) => {
                log::warn!("Fatal failure; halting all sync activity");
                self.paused.store(true, Ordering::Relaxed);
                self.upload_halted.store(true, Ordering::Relaxed);
                self.set_state(SyncState::Paused(PauseReason::PersistentError));
            }
            Some(ErrorClass::Auth) => {
                log::warn!("Authentication expired; pausing both directions");
                self.paused.store(true, Ordering::Relaxed);
                self.set_state(SyncState::Paused(PauseReason::AuthRequired));
            }
            Some(ErrorClass::UploadHalting) => {
                log::warn!("Persistent upload failure; downloads continue");
                self.upload_halted.store(true, Ordering::Relaxed);
            }
            Some(ErrorClass::Transient) => {
                // Retries were already exhausted inside the workers.
                match summary.direction {
                    crate::change::SyncDirection::Upload => {
                        self.upload_halted.store(true, Ordering::Relaxed);
                    }
                    crate::change::SyncDirection::Download => {
                        self.paused.store(true, Ordering::Relaxed);
                        self.set_state(SyncState::Paused(PauseReason::PersistentError));
                    }
                }
            }
            Some(ErrorClass::Permanent) | None => {}
        }
    }

    /// Block until unpaused or stopping. Returns `false` on stop.
    async fn wait_while_paused(&self) -> bool {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return false;
            }
            if !self.paused.load(Ordering::Relaxed) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────

pub struct SyncEngine {
    shared: Arc<Shared>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    pump: Option<std::thread::JoinHandle<()>>,
}

impl SyncEngine {
    /// Create an engine instance. Opens (or creates) the cache directory
    /// and the index DB and probes filesystem case sensitivity unless the
    /// config pins it.
    pub fn new(
        config: SyncConfig,
        client: Arc<dyn RemoteClient>,
        filters: PathFilters,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, SyncError> {
        let cache_dir = config.cache_dir();
        std::fs::create_dir_all(&cache_dir).map_err(|e| SyncError::io(cache_dir.display().to_string(), e))?;

        let index = Arc::new(IndexStore::open(&config.index_db_path())?);
        let case_insensitive = match config.case_insensitive {
            Some(v) => v,
            None => probe_case_insensitive(&cache_dir),
        };
        log::info!(
            "Engine created for {} (case-insensitive host: {case_insensitive})",
            config.local_root.display(),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                filters,
                index,
                client,
                sink,
                inflight: Arc::new(InFlightPaths::new()),
                cancel: Arc::new(AtomicBool::new(false)),
                paused: AtomicBool::new(false),
                upload_halted: AtomicBool::new(false),
                state: Mutex::new(SyncState::Stopped),
                paused_since_ms: Mutex::new(None),
                case_insensitive,
            }),
            tasks: Vec::new(),
            pump: None,
        })
    }

    pub fn state(&self) -> SyncState {
        self.shared.state()
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.shared.index
    }

    /// Run startup reconciliation and launch the three loops.
    pub async fn start(&mut self, watcher: Box<dyn LocalWatcher>) -> Result<(), SyncError> {
        self.shared.set_state(SyncState::Starting);

        run_reconciliation(&self.shared).await;

        // Watcher pump: a plain thread blocks on the raw event queue and
        // feeds coalesced batches into the async upload loop.
        let (batch_tx, batch_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<LocalChange>>();
        let mut handler = FsEventHandler::new(
            watcher,
            self.shared.config.local_root.clone(),
            self.shared.filters.clone(),
            Duration::from_millis(self.shared.config.debounce_ms),
        );
        handler.start().map_err(|e| {
            SyncError::io(
                self.shared.config.local_root.display().to_string(),
                std::io::Error::other(e.to_string()),
            )
        })?;

        let cancel = self.shared.cancel.clone();
        let pump = std::thread::Builder::new()
            .name("driftsync-events".into())
            .spawn(move || {
                loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let batch = handler.next_batch(&cancel);
                    if !batch.is_empty() && batch_tx.send(batch).is_err() {
                        break;
                    }
                }
                handler.stop();
            })
            .map_err(|e| SyncError::io("event pump", e))?;
        self.pump = Some(pump);

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            run_download_loop(shared).await;
        }));

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            run_upload_loop(shared, batch_rx).await;
        }));

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            run_maintenance_loop(shared).await;
        }));

        self.shared.set_state(SyncState::Syncing);
        Ok(())
    }

    /// Stop initiating new batches; in-flight tasks complete.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        *self
            .shared
            .paused_since_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(apply::now_ms());
        self.shared.set_state(SyncState::Paused(PauseReason::Requested));
    }

    /// Resume from pause. A pause longer than the configured threshold
    /// triggers a fresh reconciliation first.
    pub async fn resume(&self) {
        let paused_since = self
            .shared
            .paused_since_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let threshold_ms = self.shared.config.reconcile_after_pause_secs as i64 * 1000;
        if paused_since.is_some_and(|t| apply::now_ms() - t > threshold_ms) {
            log::info!("Pause exceeded reconcile threshold; running reconciliation");
            run_reconciliation(&self.shared).await;
        }
        self.shared.upload_halted.store(false, Ordering::Relaxed);
        self.shared.paused.store(false, Ordering::Relaxed);
        self.shared.set_state(SyncState::Syncing);
    }

    /// Cancel waits, drain workers, and shut down.
    pub async fn stop(&mut self) {
        self.shared.set_state(SyncState::Stopping);
        self.shared.cancel.store(true, Ordering::Relaxed);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Engine task failed on shutdown: {e}");
            }
        }
        if let Some(pump) = self.pump.take() {
            let joined = tokio::task::spawn_blocking(move || pump.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                log::warn!("Event pump did not shut down cleanly");
            }
        }

        self.shared.set_state(SyncState::Stopped);
    }
}

/// Write a probe file and look it up in a different case.
fn probe_case_insensitive(cache_dir: &std::path::Path) -> bool {
    let probe = cache_dir.join("case-probe");
    if std::fs::write(&probe, b"probe").is_err() {
        return false;
    }
    let insensitive = cache_dir.join("CASE-PROBE").exists();
    let _ = std::fs::remove_file(&probe);
    insensitive
}

// ── Download loop ────────────────────────────────────────────────────

async fn run_download_loop(shared: Arc<Shared>) {
    log::info!("Download loop started");
    loop {
        if !shared.wait_while_paused().await {
            break;
        }

        let cursor = match shared.index.cursor() {
            Ok(c) => c,
            Err(e) => {
                let e = SyncError::from(e);
                shared.sink.on_error(e.kind(), None, &e.to_string());
                if e.class() == ErrorClass::Fatal {
                    shared.paused.store(true, Ordering::Relaxed);
                    shared.upload_halted.store(true, Ordering::Relaxed);
                    shared.set_state(SyncState::Paused(PauseReason::PersistentError));
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        // With a cursor in hand, block on the long-poll; without one (first
        // run or after a reset) fetch the full listing immediately.
        if let Some(ref cursor) = cursor {
            let shared_poll = shared.clone();
            let cursor_poll = cursor.clone();
            let timeout = Duration::from_secs(shared.config.long_poll_timeout_secs);
            let has_changes = tokio::task::spawn_blocking(move || {
                shared_poll.client.wait_for_changes(&cursor_poll, timeout)
            })
            .await;
            match has_changes {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => continue, // poll timeout, loop around
                Ok(Err(e)) => {
                    log::debug!("Long-poll failed: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                Err(e) => {
                    log::warn!("Long-poll task failed: {e}");
                    continue;
                }
            }
        }

        let shared_fetch = shared.clone();
        let cursor_fetch = cursor.clone();
        let fetched = tokio::task::spawn_blocking(move || {
            ChangeFetcher::new(shared_fetch.client.as_ref()).fetch(cursor_fetch.as_deref())
        })
        .await;

        let batch = match fetched {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                let e = SyncError::from(e);
                shared.sink.on_error(e.kind(), None, &e.to_string());
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            Err(e) => {
                log::warn!("Fetch task failed: {e}");
                continue;
            }
        };

        if batch.reset {
            // Invalid cursor: discard it and reconcile; the next iteration
            // fetches the full listing.
            log::warn!("Remote cursor reset; discarding cursor and reconciling");
            if let Err(e) = shared.index.clear_cursor() {
                log::warn!("Failed to clear cursor: {e}");
            }
            run_reconciliation(&shared).await;
            continue;
        }

        if batch.changes.is_empty() {
            // Nothing to do, but remember the new cursor position.
            if let Err(e) = shared.index.set_cursor(&batch.cursor) {
                log::warn!("Failed to persist cursor: {e}");
            }
            continue;
        }

        process_download_batch(&shared, batch.changes, batch.cursor).await;
    }
    log::info!("Download loop stopped");
}

async fn process_download_batch(
    shared: &Arc<Shared>,
    changes: Vec<crate::change::RemoteChange>,
    cursor: String,
) {
    let shared_resolve = shared.clone();
    let resolved = tokio::task::spawn_blocking(move || -> Result<Vec<ResolvedDownload>, SyncError> {
        let normalized = normalize::normalize_remote(changes, &shared_resolve.index, &shared_resolve.filters)?;
        let resolver = shared_resolve.resolver();
        let mut out = Vec::with_capacity(normalized.len());
        for change in &normalized {
            match resolver.resolve_download(change) {
                Ok(r) => out.push(r),
                Err(e) => {
                    shared_resolve
                        .sink
                        .on_error(e.kind(), Some(change.path()), &e.to_string());
                }
            }
        }
        Ok(out)
    })
    .await;

    let resolved = match resolved {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            shared.sink.on_error(e.kind(), None, &e.to_string());
            return;
        }
        Err(e) => {
            log::warn!("Download resolution task failed: {e}");
            return;
        }
    };

    let summary = apply::apply_download_batch(shared.apply_ctx(), resolved, &cursor).await;
    log::info!(
        "Download batch done: {} applied, {} skipped, {} conflicts, {} failed",
        summary.applied,
        summary.skipped,
        summary.conflicts,
        summary.failed.len(),
    );

    if summary.needs_full_relist {
        log::warn!("Download hit a vanished item; discarding cursor for a full re-list");
        if let Err(e) = shared.index.clear_cursor() {
            log::warn!("Failed to clear cursor: {e}");
        }
    }

    shared.sink.on_batch_applied(&summary);
    shared.escalate(&summary);
}

// ── Upload loop ──────────────────────────────────────────────────────

async fn run_upload_loop(
    shared: Arc<Shared>,
    mut batch_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<LocalChange>>,
) {
    log::info!("Upload loop started");
    while let Some(batch) = batch_rx.recv().await {
        if !shared.wait_while_paused().await {
            break;
        }
        process_upload_batch(&shared, batch).await;
    }
    log::info!("Upload loop stopped");
}

async fn process_upload_batch(shared: &Arc<Shared>, batch: Vec<LocalChange>) {
    if batch.is_empty() {
        return;
    }
    if shared.upload_halted.load(Ordering::Relaxed) {
        // Dropped batches are not lost: reconciliation resynthesizes them
        // once uploads resume.
        log::info!("Upload halted; dropping batch of {} changes", batch.len());
        return;
    }

    let shared_resolve = shared.clone();
    let resolved = tokio::task::spawn_blocking(move || -> Vec<ResolvedUpload> {
        let normalized = normalize::normalize_local(batch, &shared_resolve.filters);
        let resolver = shared_resolve.resolver();
        let mut out = Vec::with_capacity(normalized.len());
        for change in &normalized {
            match resolver.resolve_upload(change, shared_resolve.client.as_ref()) {
                Ok(r) => out.push(r),
                Err(e) => {
                    shared_resolve
                        .sink
                        .on_error(e.kind(), Some(change.path()), &e.to_string());
                }
            }
        }
        out
    })
    .await;

    let resolved = match resolved {
        Ok(r) => r,
        Err(e) => {
            log::warn!("Upload resolution task failed: {e}");
            return;
        }
    };
    if resolved.is_empty() {
        return;
    }

    let summary = apply::apply_upload_batch(shared.apply_ctx(), resolved).await;
    log::info!(
        "Upload batch done: {} applied, {} skipped, {} conflicts, {} failed",
        summary.applied,
        summary.skipped,
        summary.conflicts,
        summary.failed.len(),
    );
    shared.sink.on_batch_applied(&summary);
    shared.escalate(&summary);
}

// ── Reconciliation and maintenance ───────────────────────────────────

/// Scan the local tree, synthesize drift changes, and push them through
/// the normal upload pipeline.
async fn run_reconciliation(shared: &Arc<Shared>) {
    let shared_scan = shared.clone();
    let changes = tokio::task::spawn_blocking(move || {
        reconcile::reconcile(
            &shared_scan.config.local_root,
            &shared_scan.filters,
            &shared_scan.index,
        )
    })
    .await;

    match changes {
        Ok(Ok(changes)) => {
            if !changes.is_empty() {
                process_upload_batch(shared, changes).await;
            }
            if let Err(e) = shared.index.set_last_reconcile_ms(apply::now_ms()) {
                log::warn!("Failed to record reconciliation time: {e}");
            }
        }
        Ok(Err(e)) => {
            shared.sink.on_error(e.kind(), None, &e.to_string());
        }
        Err(e) => {
            log::warn!("Reconciliation task failed: {e}");
        }
    }
}

async fn run_maintenance_loop(shared: Arc<Shared>) {
    let interval = Duration::from_secs(shared.config.maintenance_interval_secs);
    log::info!("Maintenance loop started (interval {interval:?})");
    loop {
        // Sleep in one-second slices so shutdown is prompt.
        let mut slept = Duration::ZERO;
        while slept < interval {
            if shared.cancel.load(Ordering::Relaxed) {
                log::info!("Maintenance loop stopped");
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            slept += Duration::from_secs(1);
        }

        if shared.paused.load(Ordering::Relaxed) {
            continue;
        }

        log::info!("Maintenance pass starting");

        // Skip the reconcile scan if one ran recently (startup or resume).
        let recent_cutoff_ms = (interval.as_millis() / 2) as i64;
        let last = shared.index.last_reconcile_ms().ok().flatten();
        if last.is_none_or(|t| apply::now_ms() - t > recent_cutoff_ms) {
            run_reconciliation(&shared).await;
        }

        let index = shared.index.clone();
        let housekeeping = tokio::task::spawn_blocking(move || -> Result<usize, SyncError> {
            let purged = index.purge_tombstones(apply::now_ms() - TOMBSTONE_TTL_MS)?;
            index.vacuum()?;
            Ok(purged)
        })
        .await;
        match housekeeping {
            Ok(Ok(purged)) => log::info!("Maintenance pass done ({purged} tombstones purged)"),
            Ok(Err(e)) => log::warn!("Maintenance housekeeping failed: {e}"),
            Err(e) => log::warn!("Maintenance task failed: {e}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use crate::change::RemoteChange;
    use crate::remote::{ChangePage, RemoteError, UploadedMeta};

    /// Remote that has nothing and accepts nothing.
    struct NullRemote;

    impl RemoteClient for NullRemote {
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
            Ok(Vec::new())
        }

        fn get_metadata(&self, _path: &str) -> Result<Option<RemoteChange>, RemoteError> {
            Ok(None)
        }
    }

    #[test]
    fn state_transitions_notify_sink() {
        struct RecordingSink {
            transitions: Mutex<Vec<(SyncState, SyncState)>>,
        }
        impl EventSink for RecordingSink {
            fn on_state_change(&self, old: SyncState, new: SyncState) {
                self.transitions.lock().unwrap().push((old, new));
            }
        }

        let sink = Arc::new(RecordingSink {
            transitions: Mutex::new(Vec::new()),
        });
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(IndexStore::open(&dir.path().join("index.db")).unwrap());

        let shared = Shared {
            config: SyncConfig::new(dir.path()),
            filters: PathFilters::new(".driftsync"),
            index,
            client: Arc::new(NullRemote),
            sink: sink.clone(),
            inflight: Arc::new(InFlightPaths::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(false),
            upload_halted: AtomicBool::new(false),
            state: Mutex::new(SyncState::Stopped),
            paused_since_ms: Mutex::new(None),
            case_insensitive: false,
        };

        shared.set_state(SyncState::Starting);
        shared.set_state(SyncState::Syncing);
        shared.set_state(SyncState::Syncing); // no-op, no duplicate event

        let transitions = sink.transitions.lock().unwrap();
        assert_eq!(
            *transitions,
            vec![
                (SyncState::Stopped, SyncState::Starting),
                (SyncState::Starting, SyncState::Syncing),
            ]
        );
    }

    #[test]
    fn probe_detects_sensitivity_of_real_fs() {
        let dir = tempfile::tempdir().unwrap();
        let result = probe_case_insensitive(dir.path());
        // The answer is host-dependent; the probe must clean up after
        // itself either way.
        assert!(!dir.path().join("case-probe").exists());
        let _ = result;
    }
}
