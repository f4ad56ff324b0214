//! Local watcher capability and the debouncing event handler.
//!
//! A [`LocalWatcher`] delivers raw OS events. The [`FsEventHandler`] is the
//! only component that sees them: it blocks on the raw queue, collects
//! events until the debounce window goes quiet, suppresses the engine's own
//! artifacts and ignored names, and coalesces the rest into a batch of
//! [`LocalChange`] records for the upload pipeline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::change::{ItemKind, LocalChange};
use crate::ignore::PathFilters;
use crate::paths;

/// Poll interval while waiting for the first event of a batch. Short enough
/// that cancellation is observed promptly.
const IDLE_POLL: Duration = Duration::from_millis(250);

// ── Raw events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventKind {
    Create,
    Remove,
    Modify,
    Rename { from: PathBuf },
}

/// An OS-level filesystem event with absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
    pub is_dir: bool,
}

#[derive(Debug)]
pub enum WatchError {
    Init(String),
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Init(msg) => write!(f, "watcher init failed: {msg}"),
        }
    }
}

impl std::error::Error for WatchError {}

/// Capability consumed by the engine: a blocking source of raw events.
pub trait LocalWatcher: Send {
    fn start(&mut self) -> Result<(), WatchError>;
    fn stop(&mut self);
    /// Next raw event, or `None` when the timeout elapses with nothing new.
    fn next_event(&mut self, timeout: Duration) -> Option<RawEvent>;
}

// ── Event handler ────────────────────────────────────────────────────

/// Debounces and cleans the raw event stream into [`LocalChange`] batches.
pub struct FsEventHandler {
    watcher: Box<dyn LocalWatcher>,
    root: PathBuf,
    filters: PathFilters,
    debounce: Duration,
}

impl FsEventHandler {
    pub fn new(
        watcher: Box<dyn LocalWatcher>,
        root: PathBuf,
        filters: PathFilters,
        debounce: Duration,
    ) -> Self {
        Self {
            watcher,
            root,
            filters,
            debounce,
        }
    }

    pub fn start(&mut self) -> Result<(), WatchError> {
        self.watcher.start()
    }

    pub fn stop(&mut self) {
        self.watcher.stop();
    }

    /// Block until local changes accumulate, then return them coalesced.
    ///
    /// Waits for the first admissible event, keeps draining until the
    /// debounce window passes with no further events, and coalesces per
    /// path. Returns an empty batch when `cancel` is set.
    pub fn next_batch(&mut self, cancel: &AtomicBool) -> Vec<LocalChange> {
        let first = loop {
            if cancel.load(Ordering::Relaxed) {
                return Vec::new();
            }
            if let Some(raw) = self.watcher.next_event(IDLE_POLL) {
                if let Some(change) = self.admit(raw) {
                    break change;
                }
            }
        };

        let mut changes = vec![first];
        loop {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            match self.watcher.next_event(self.debounce) {
                Some(raw) => {
                    if let Some(change) = self.admit(raw) {
                        changes.push(change);
                    }
                }
                None => break, // window went quiet
            }
        }

        let batch = coalesce(changes);
        log::debug!("Local event batch: {} coalesced changes", batch.len());
        batch
    }

    /// Map a raw event into an engine change, or drop it.
    fn admit(&self, raw: RawEvent) -> Option<LocalChange> {
        let kind = if raw.is_dir { ItemKind::Folder } else { ItemKind::File };

        match raw.kind {
            RawEventKind::Rename { from } => {
                match (self.engine_path(&from), self.engine_path(&raw.path)) {
                    (Some(src), Some(dst)) => Some(LocalChange::Moved {
                        src,
                        dst,
                        kind,
                        modified: false,
                    }),
                    // Renamed in from outside the tree (or from a suppressed
                    // name, e.g. an editor temp file being moved into place).
                    (None, Some(dst)) => Some(LocalChange::Created { path: dst, kind }),
                    // Renamed away to a suppressed or external name.
                    (Some(src), None) => Some(LocalChange::Deleted { path: src, kind }),
                    (None, None) => None,
                }
            }
            RawEventKind::Create => {
                let path = self.engine_path(&raw.path)?;
                Some(LocalChange::Created { path, kind })
            }
            RawEventKind::Remove => {
                let path = self.engine_path(&raw.path)?;
                Some(LocalChange::Deleted { path, kind })
            }
            RawEventKind::Modify => {
                // Folder mtime churn carries no sync content; files only.
                if raw.is_dir {
                    return None;
                }
                let path = self.engine_path(&raw.path)?;
                Some(LocalChange::Modified { path })
            }
        }
    }

    /// Canonical engine path of an absolute event path, unless suppressed.
    fn engine_path(&self, abs: &std::path::Path) -> Option<String> {
        let rel = paths::relative_to_root(abs, &self.root)?;
        if self.filters.suppress_local_event(&rel) {
            return None;
        }
        Some(rel)
    }
}

// ── Coalescing ───────────────────────────────────────────────────────

/// Coalesce an ordered change sequence so each path retains the single
/// change (or `Deleted`+`Created` pair for a type change) that reproduces
/// the net effect.
pub fn coalesce(changes: Vec<LocalChange>) -> Vec<LocalChange> {
    // One slot per path, in first-seen order. A slot is a short vec: one
    // change normally, two for a type change.
    let mut order: Vec<String> = Vec::new();
    let mut slots: HashMap<String, Vec<LocalChange>> = HashMap::new();

    let push = |order: &mut Vec<String>, slots: &mut HashMap<String, Vec<LocalChange>>, key: String, change: LocalChange| {
        match slots.get_mut(&key) {
            Some(slot) => merge_into(slot, change),
            None => {
                order.push(key.clone());
                slots.insert(key, vec![change]);
            }
        }
    };

    for change in changes {
        match change {
            LocalChange::Moved {
                src,
                dst,
                kind,
                modified,
            } => {
                // A move is kept intact only when neither endpoint already
                // has pending changes; otherwise it degrades to the
                // delete + create pair so per-path merging stays local.
                if !slots.contains_key(&src) && !slots.contains_key(&dst) {
                    push(
                        &mut order,
                        &mut slots,
                        dst.clone(),
                        LocalChange::Moved {
                            src,
                            dst,
                            kind,
                            modified,
                        },
                    );
                } else {
                    push(
                        &mut order,
                        &mut slots,
                        src.clone(),
                        LocalChange::Deleted { path: src, kind },
                    );
                    push(
                        &mut order,
                        &mut slots,
                        dst.clone(),
                        LocalChange::Created { path: dst, kind },
                    );
                }
            }
            other => {
                let key = other.path().to_string();
                push(&mut order, &mut slots, key, other);
            }
        }
    }

    let mut out = Vec::new();
    for key in order {
        if let Some(slot) = slots.remove(&key) {
            out.extend(slot);
        }
    }
    out
}

/// Merge an incoming change into an existing slot for the same path.
fn merge_into(slot: &mut Vec<LocalChange>, incoming: LocalChange) {
    let last = match slot.pop() {
        Some(c) => c,
        None => {
            slot.push(incoming);
            return;
        }
    };

    use LocalChange::{Created, Deleted, Modified, Moved};
    match (last, incoming) {
        // Creation absorbs later content changes.
        (Created { path, kind }, Modified { .. }) => slot.push(Created { path, kind }),
        (Created { .. }, Deleted { .. }) => {
            // Created then deleted: the pair annuls. If this creation was
            // the second half of a type change, the original deletion
            // (still in the slot) stands.
        }
        (Created { path, kind }, Created { .. }) => slot.push(Created { path, kind }),

        (Modified { path }, Modified { .. }) => slot.push(Modified { path }),
        (Modified { .. }, Deleted { path, kind }) => slot.push(Deleted { path, kind }),
        // OS watchers often report replace-by-temp-file as modify + create.
        (Modified { path }, Created { .. }) => slot.push(Modified { path }),

        (Deleted { path, kind }, Created { kind: new_kind, .. }) => {
            if kind == new_kind {
                match kind {
                    // Same file deleted and recreated: net content change.
                    ItemKind::File => slot.push(Modified { path }),
                    // Folder cycled; creating it again is idempotent.
                    ItemKind::Folder => slot.push(Created { path, kind }),
                }
            } else {
                // Type change: keep both, deletion first.
                slot.push(Deleted { path: path.clone(), kind });
                slot.push(Created { path, kind: new_kind });
            }
        }
        (Deleted { path, kind }, Deleted { .. }) => slot.push(Deleted { path, kind }),
        (Deleted { .. }, Modified { path }) => slot.push(Modified { path }),

        (
            Moved {
                src, dst, kind, ..
            },
            Modified { .. },
        ) => slot.push(Moved {
            src,
            dst,
            kind,
            modified: true,
        }),
        (Moved { src, kind, .. }, Deleted { .. }) => {
            // Moved then deleted at the destination: net effect is that the
            // source is gone and the destination never settled.
            slot.push(Deleted { path: src, kind });
        }
        (
            Moved {
                src, dst, kind, ..
            },
            Created { .. },
        ) => slot.push(Moved {
            src,
            dst,
            kind,
            modified: true,
        }),

        // Moves never arrive here as `incoming` (coalesce() degrades them).
        (last, incoming) => {
            slot.push(last);
            slot.push(incoming);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
