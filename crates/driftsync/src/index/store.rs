//! SQLite store for the sync index.
//!
//! One DB file per synced root, in WAL mode. A single write connection is
//! serialized behind a mutex; reads use their own connection (WAL allows
//! concurrent readers). Transactions group entry mutations with a cursor
//! advance so a download batch is crash-consistent: either the cursor and
//! the batch's mutations are all visible, or none are.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};

use super::IndexEntry;
use crate::change::ItemKind;
use crate::paths;

const SCHEMA_VERSION: &str = "1";

/// Reserved meta keys. Unknown keys in the table are ignored for forward
/// compatibility.
pub const CURSOR_KEY: &str = "__cursor__";
pub const SCHEMA_VERSION_KEY: &str = "__schema_version__";
pub const LAST_RECONCILE_KEY: &str = "__last_reconcile__";

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// Structural damage detected mid-run. The engine halts; recovery means
    /// rebuilding the index from a remote listing plus a local scan.
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref e, ref msg) = err {
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ) {
                return StoreError::Corrupt(msg.clone().unwrap_or_else(|| e.to_string()));
            }
        }
        StoreError::Sqlite(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::Corrupt(msg) => write!(f, "index corrupt: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ── Schema ───────────────────────────────────────────────────────────

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        path         TEXT PRIMARY KEY,
        path_fold    TEXT    NOT NULL,
        kind         INTEGER NOT NULL,
        rev          TEXT,
        content_hash TEXT,
        last_sync_ms INTEGER NOT NULL DEFAULT 0
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS idx_entries_fold ON entries (path_fold);

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CREATE_TABLES_SQL)?;
    Ok(())
}

fn stamp_schema_version(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![SCHEMA_VERSION_KEY, SCHEMA_VERSION],
    )?;
    Ok(())
}

// ── IndexStore ───────────────────────────────────────────────────────

/// Handle to the index database.
///
/// `Connection` is `Send` but not `Sync`, so both connections sit behind
/// std mutexes; the write mutex is also what serializes the single-writer
/// discipline.
pub struct IndexStore {
    db_path: PathBuf,
    read: Mutex<Connection>,
    write: Mutex<Connection>,
}

impl IndexStore {
    /// Open (or create) the index database at `db_path`.
    ///
    /// Runs WAL pragmas, creates tables if missing, and checks the schema
    /// version. An unreadable file or version mismatch at open time deletes
    /// the DB (and its WAL/SHM sidecars) and recreates it; the next
    /// reconciliation rebuilds the lost state.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        match Self::try_open(db_path) {
            Ok(store) => Ok(store),
            Err(e) => {
                log::warn!("Index DB open failed ({e}), deleting and recreating");
                Self::delete_and_recreate(db_path)
            }
        }
    }

    fn try_open(db_path: &Path) -> Result<Self, StoreError> {
        let write = Connection::open(db_path)?;
        apply_pragmas(&write)?;
        create_tables(&write)?;

        match read_meta(&write, SCHEMA_VERSION_KEY)? {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                log::warn!("Index schema mismatch (expected {SCHEMA_VERSION}, found {v})");
                return Err(StoreError::Corrupt(format!("schema version {v}")));
            }
            None => stamp_schema_version(&write)?,
        }

        let read = Connection::open(db_path)?;
        apply_pragmas(&read)?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            read: Mutex::new(read),
            write: Mutex::new(write),
        })
    }

    fn delete_and_recreate(db_path: &Path) -> Result<Self, StoreError> {
        if db_path.exists() {
            std::fs::remove_file(db_path)?;
        }
        // WAL/SHM sidecars can be stale even if the base DB is gone.
        for sidecar in ["db-wal", "db-shm"] {
            let path = db_path.with_extension(sidecar);
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
        }

        let write = Connection::open(db_path)?;
        apply_pragmas(&write)?;
        create_tables(&write)?;
        stamp_schema_version(&write)?;
        let read = Connection::open(db_path)?;
        apply_pragmas(&read)?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            read: Mutex::new(read),
            write: Mutex::new(write),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// A panicked lock holder cannot leave a half-applied write behind
    /// (every mutation commits through a SQLite transaction), so a
    /// poisoned mutex is safe to re-enter.
    fn reader(&self) -> MutexGuard<'_, Connection> {
        self.read.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.write.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Look up an entry by canonical path.
    pub fn get(&self, path: &str) -> Result<Option<IndexEntry>, StoreError> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT path, kind, rev, content_hash, last_sync_ms FROM entries WHERE path = ?1",
        )?;
        let entry = stmt.query_row(params![path], row_to_entry).optional()?;
        Ok(entry)
    }

    /// Look up an entry by case-folded path. Used for case-conflict checks:
    /// on case-insensitive hosts there is at most one entry per fold class.
    pub fn get_by_fold(&self, folded: &str) -> Result<Option<IndexEntry>, StoreError> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT path, kind, rev, content_hash, last_sync_ms FROM entries WHERE path_fold = ?1",
        )?;
        let entry = stmt.query_row(params![folded], row_to_entry).optional()?;
        Ok(entry)
    }

    /// All entries whose path equals `prefix` or lies under it, by path.
    pub fn iter_prefix(&self, prefix: &str) -> Result<Vec<IndexEntry>, StoreError> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT path, kind, rev, content_hash, last_sync_ms FROM entries
             WHERE path = ?1 OR path LIKE ?2 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![prefix, format!("{prefix}/%")], row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Every entry in the index, ordered by path.
    pub fn all_entries(&self) -> Result<Vec<IndexEntry>, StoreError> {
        let conn = self.reader();
        let mut stmt = conn
            .prepare_cached("SELECT path, kind, rev, content_hash, last_sync_ms FROM entries ORDER BY path")?;
        let rows = stmt.query_map([], row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn entry_count(&self) -> Result<u64, StoreError> {
        let conn = self.reader();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// The persisted remote cursor, if any.
    pub fn cursor(&self) -> Result<Option<String>, StoreError> {
        let conn = self.reader();
        read_meta(&conn, CURSOR_KEY)
    }

    /// Unix milliseconds of the last completed reconciliation.
    pub fn last_reconcile_ms(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.reader();
        Ok(read_meta(&conn, LAST_RECONCILE_KEY)?.and_then(|v| v.parse().ok()))
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Insert or replace a single entry outside any batch transaction.
    pub fn put(&self, entry: &IndexEntry) -> Result<(), StoreError> {
        let conn = self.writer();
        put_entry(&conn, entry)
    }

    /// Delete a single entry.
    pub fn delete(&self, path: &str) -> Result<(), StoreError> {
        let conn = self.writer();
        conn.execute("DELETE FROM entries WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Persist the remote cursor on its own. Batch commits use
    /// [`IndexTxn::set_cursor`] instead so the advance shares a transaction
    /// with the final entry mutation.
    pub fn set_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        let conn = self.writer();
        write_meta(&conn, CURSOR_KEY, cursor)
    }

    /// Drop the persisted cursor (remote signalled a reset).
    pub fn clear_cursor(&self) -> Result<(), StoreError> {
        let conn = self.writer();
        conn.execute("DELETE FROM meta WHERE key = ?1", params![CURSOR_KEY])?;
        Ok(())
    }

    pub fn set_last_reconcile_ms(&self, ms: i64) -> Result<(), StoreError> {
        let conn = self.writer();
        write_meta(&conn, LAST_RECONCILE_KEY, &ms.to_string())
    }

    /// Remove tombstones older than the given timestamp. Returns how many
    /// rows were purged. Run by maintenance.
    pub fn purge_tombstones(&self, older_than_ms: i64) -> Result<usize, StoreError> {
        let conn = self.writer();
        let purged = conn.execute(
            "DELETE FROM entries WHERE rev IS NULL AND last_sync_ms < ?1",
            params![older_than_ms],
        )?;
        Ok(purged)
    }

    /// Compact the database file. Run by maintenance.
    pub fn vacuum(&self) -> Result<(), StoreError> {
        let conn = self.writer();
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Run a write transaction. Entry mutations and the cursor advance made
    /// through the [`IndexTxn`] commit atomically; any error rolls back.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&IndexTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.writer();
        let tx = conn.unchecked_transaction()?;
        let result = f(&IndexTxn { tx: &tx })?;
        tx.commit()?;
        Ok(result)
    }
}

// ── Transactions ─────────────────────────────────────────────────────

/// Write handle passed to [`IndexStore::transaction`] closures.
pub struct IndexTxn<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl IndexTxn<'_> {
    pub fn put(&self, entry: &IndexEntry) -> Result<(), StoreError> {
        put_entry(self.tx, entry)
    }

    pub fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.tx.execute("DELETE FROM entries WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Delete an entry and everything under it (folder deletions).
    pub fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM entries WHERE path = ?1 OR path LIKE ?2",
            params![prefix, format!("{prefix}/%")],
        )?;
        Ok(())
    }

    pub fn set_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        write_meta(self.tx, CURSOR_KEY, cursor)
    }
}

// ── Row mapping and meta helpers ─────────────────────────────────────

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexEntry> {
    let kind: i64 = row.get(1)?;
    Ok(IndexEntry {
        path: row.get(0)?,
        kind: if kind == 1 { ItemKind::Folder } else { ItemKind::File },
        rev: row.get(2)?,
        content_hash: row.get(3)?,
        last_sync_ms: row.get(4)?,
    })
}

fn put_entry(conn: &Connection, entry: &IndexEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO entries (path, path_fold, kind, rev, content_hash, last_sync_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.path,
            paths::case_fold(&entry.path),
            matches!(entry.kind, ItemKind::Folder) as i64,
            entry.rev,
            entry.content_hash,
            entry.last_sync_ms,
        ],
    )?;
    Ok(())
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT value FROM meta WHERE key = ?1")?;
    let value = stmt.query_row(params![key], |row| row.get(0)).optional()?;
    Ok(value)
}

fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────
