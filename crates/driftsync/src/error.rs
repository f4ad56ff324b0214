//! Engine-level errors and escalation policy.
//!
//! Subsystems define their own error enums (`StoreError`, `RemoteError`,
//! `HashError`, `WatchError`); this module wraps them into the single
//! [`SyncError`] that apply workers package into batch outcomes. Workers
//! never throw across thread boundaries: the monitor inspects the
//! [`ErrorClass`] of each packaged error and decides what to halt.

use crate::hash::HashError;
use crate::index::StoreError;
use crate::remote::RemoteError;

/// How the monitor must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; after the retry cap, surface and pause the
    /// affected direction.
    Transient,
    /// No retry; surface the failure for this item and continue.
    Permanent,
    /// Halt both directions until the user re-authenticates.
    Auth,
    /// Halt the upload direction; downloads continue.
    UploadHalting,
    /// Halt everything; external recovery required.
    Fatal,
}

#[derive(Debug)]
pub enum SyncError {
    Store(StoreError),
    Remote(RemoteError),
    Hash(HashError),
    Io { path: String, source: std::io::Error },
}

impl SyncError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify per the escalation table: network and rate-limit failures
    /// (and interrupted-style I/O) retry; auth expiry pauses both loops;
    /// quota and permission failures halt upload only; index corruption
    /// halts everything.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Remote(e) => match e {
                RemoteError::Network(_) | RemoteError::RateLimited { .. } => ErrorClass::Transient,
                RemoteError::AuthExpired => ErrorClass::Auth,
                RemoteError::InsufficientQuota | RemoteError::PermissionDenied => ErrorClass::UploadHalting,
                RemoteError::NotFound | RemoteError::Conflict { .. } | RemoteError::Server(_) => {
                    ErrorClass::Permanent
                }
            },
            SyncError::Store(StoreError::Corrupt(_)) => ErrorClass::Fatal,
            SyncError::Store(_) => ErrorClass::Permanent,
            SyncError::Hash(_) => ErrorClass::Permanent,
            SyncError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
        }
    }

    /// Short machine-readable kind for `on_error` notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Store(StoreError::Corrupt(_)) => "storage_corrupt",
            SyncError::Store(_) => "storage_io",
            SyncError::Remote(RemoteError::Network(_)) => "network",
            SyncError::Remote(RemoteError::RateLimited { .. }) => "rate_limited",
            SyncError::Remote(RemoteError::AuthExpired) => "auth_expired",
            SyncError::Remote(RemoteError::NotFound) => "not_found",
            SyncError::Remote(RemoteError::Conflict { .. }) => "conflict",
            SyncError::Remote(RemoteError::InsufficientQuota) => "insufficient_quota",
            SyncError::Remote(RemoteError::PermissionDenied) => "permission_denied",
            SyncError::Remote(RemoteError::Server(_)) => "server_error",
            SyncError::Hash(_) => "unreadable",
            SyncError::Io { .. } => "local_io",
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Store(e) => write!(f, "index store: {e}"),
            SyncError::Remote(e) => write!(f, "remote: {e}"),
            SyncError::Hash(e) => write!(f, "hashing: {e}"),
            SyncError::Io { path, source } => write!(f, "local I/O on {path}: {source}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        SyncError::Remote(e)
    }
}

impl From<HashError> for SyncError {
    fn from(e: HashError) -> Self {
        SyncError::Hash(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_policy_table() {
        assert_eq!(
            SyncError::Remote(RemoteError::Network("down".into())).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SyncError::Remote(RemoteError::RateLimited { retry_after_ms: 100 }).class(),
            ErrorClass::Transient
        );
        assert_eq!(SyncError::Remote(RemoteError::AuthExpired).class(), ErrorClass::Auth);
        assert_eq!(
            SyncError::Remote(RemoteError::InsufficientQuota).class(),
            ErrorClass::UploadHalting
        );
        assert_eq!(
            SyncError::Remote(RemoteError::PermissionDenied).class(),
            ErrorClass::UploadHalting
        );
        assert_eq!(
            SyncError::Store(StoreError::Corrupt("bad page".into())).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SyncError::io("a.txt", std::io::Error::new(std::io::ErrorKind::TimedOut, "slow")).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SyncError::io("a.txt", std::io::Error::other("disk fell out")).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn kinds_are_stable_strings() {
        assert_eq!(SyncError::Remote(RemoteError::AuthExpired).kind(), "auth_expired");
        assert_eq!(
            SyncError::Store(StoreError::Corrupt("x".into())).kind(),
            "storage_corrupt"
        );
    }
}
