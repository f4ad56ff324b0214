//! Production [`LocalWatcher`] backed by `notify`.
//!
//! Wraps `notify-debouncer-full`, which already merges event storms from
//! the OS backend; the engine's own debounce window in `FsEventHandler`
//! then shapes batches on top. Raw events are forwarded through a channel
//! so `next_event` is an ordinary blocking receive.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use notify_debouncer_full::{
    DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
    notify::{
        EventKind, RecommendedWatcher, RecursiveMode,
        event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    },
};

use crate::watcher::{LocalWatcher, RawEvent, RawEventKind, WatchError};

/// Debounce applied inside notify before events reach the engine. Short:
/// the engine's own window does the real batching.
const BACKEND_DEBOUNCE: Duration = Duration::from_millis(100);

pub struct NotifyWatcher {
    root: PathBuf,
    debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
    tx: mpsc::Sender<RawEvent>,
    rx: mpsc::Receiver<RawEvent>,
}

impl NotifyWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            root: root.into(),
            debouncer: None,
            tx,
            rx,
        }
    }
}

impl LocalWatcher for NotifyWatcher {
    fn start(&mut self) -> Result<(), WatchError> {
        let tx = self.tx.clone();
        let mut debouncer = new_debouncer(BACKEND_DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in &events {
                        for raw in map_event(event) {
                            // Receiver gone means the engine is stopping.
                            if tx.send(raw).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        log::warn!("Watcher backend error: {e}");
                    }
                }
            }
        })
        .map_err(|e| WatchError::Init(e.to_string()))?;

        debouncer
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::Init(e.to_string()))?;

        log::info!("NotifyWatcher started for {}", self.root.display());
        self.debouncer = Some(debouncer);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the debouncer stops the backend watcher thread.
        self.debouncer = None;
    }

    fn next_event(&mut self, timeout: Duration) -> Option<RawEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Translate a notify event into zero or more raw engine events.
fn map_event(event: &notify_debouncer_full::notify::Event) -> Vec<RawEvent> {
    match event.kind {
        EventKind::Create(create_kind) => single(event.paths.first(), |path| RawEvent {
            path: path.to_path_buf(),
            kind: RawEventKind::Create,
            is_dir: match create_kind {
                CreateKind::Folder => true,
                CreateKind::File => false,
                _ => path.is_dir(),
            },
        }),
        EventKind::Remove(remove_kind) => single(event.paths.first(), |path| RawEvent {
            path: path.to_path_buf(),
            kind: RawEventKind::Remove,
            is_dir: matches!(remove_kind, RemoveKind::Folder),
        }),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            match (event.paths.first(), event.paths.get(1)) {
                (Some(from), Some(to)) => vec![RawEvent {
                    path: to.clone(),
                    kind: RawEventKind::Rename { from: from.clone() },
                    is_dir: to.is_dir(),
                }],
                _ => Vec::new(),
            }
        }
        // Unpaired rename halves degrade to remove/create; the kind of a
        // vanished source is unknown and resolved against the index later.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(event.paths.first(), |path| RawEvent {
            path: path.to_path_buf(),
            kind: RawEventKind::Remove,
            is_dir: false,
        }),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(event.paths.first(), |path| RawEvent {
            path: path.to_path_buf(),
            kind: RawEventKind::Create,
            is_dir: path.is_dir(),
        }),
        EventKind::Modify(_) => single(event.paths.first(), |path| RawEvent {
            path: path.to_path_buf(),
            kind: RawEventKind::Modify,
            is_dir: path.is_dir(),
        }),
        _ => Vec::new(),
    }
}

fn single(path: Option<&PathBuf>, make: impl FnOnce(&Path) -> RawEvent) -> Vec<RawEvent> {
    match path {
        Some(p) => vec![make(p)],
        None => Vec::new(),
    }
}
