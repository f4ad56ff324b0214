//! Bidirectional sync engine between a local directory tree and a cloud
//! file store.
//!
//! The engine observes two independent event sources — debounced local
//! filesystem events and the remote delta stream — reconciles them against
//! a persistent last-known-good index, detects conflicts, and drives a
//! bounded pool of apply workers until both sides converge. The remote API
//! client and the OS watcher are injected capabilities ([`RemoteClient`],
//! [`LocalWatcher`]); everything else lives here.
//!
//! Pipeline, download direction:
//! remote deltas → [`normalize`] → [`resolve`] → [`apply`] → index commit.
//! Upload direction: watcher events → the same stages against the remote.
//! [`SyncEngine`] supervises the loops, pause/resume, and escalation.

// Deny unused code to catch dead code early
#![deny(unused)]
// Warn on unused dependencies to catch platform-specific cfg mismatches
#![warn(unused_crate_dependencies)]
// Warn on redundant path prefixes (e.g., std::path::Path when Path is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

// Silence false positives: notify is pinned for version alignment with
// notify-debouncer-full (which re-exports it), and serde_json backs the
// config round-trip tests only.
use notify as _;
use serde_json as _;

pub mod apply;
pub mod change;
pub mod config;
pub mod error;
pub mod hash;
pub mod ignore;
pub mod index;
pub mod monitor;
pub mod normalize;
pub mod notify_watcher;
pub mod paths;
pub mod reconcile;
pub mod remote;
pub mod resolve;
pub mod watcher;


pub use change::{ItemKind, LocalChange, RemoteChange, SyncAction, SyncDirection};
pub use config::{RetryPolicy, SyncConfig};
pub use error::{ErrorClass, SyncError};
pub use index::{IndexEntry, IndexStore, StoreError};
pub use monitor::{EventSink, NullSink, PauseReason, SyncEngine, SyncState};
pub use notify_watcher::NotifyWatcher;
pub use remote::{ChangePage, FetchedBatch, RemoteClient, RemoteError, UploadedMeta};
pub use watcher::{LocalWatcher, RawEvent, RawEventKind};
