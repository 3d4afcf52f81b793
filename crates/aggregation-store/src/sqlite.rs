//! Durable store backed by SQLite in WAL mode.
//!
//! Every write is appended to the write-ahead log and committed as its own
//! transaction; a [`WriteBatch`] is one `IMMEDIATE` transaction, so it is
//! either fully in the log or absent after a crash.
//!
//! # Sync policy
//!
//! With `sync = true` the connection runs `PRAGMA synchronous = FULL` and
//! every commit fsyncs the log before returning. With `sync = false` it runs
//! `synchronous = NORMAL`: commits survive a process crash but the most
//! recent ones can be lost if the machine itself loses power before the next
//! checkpoint. That trade-off is the caller's to make.
//!
//! A store file must have exactly one writer process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, trace};

use crate::batch::{BatchOp, WriteBatch};
use crate::scan::prefix_successor;
use crate::traits::{Entry, KeyValueStore};
use crate::{StoreError, StoreResult};

/// Options for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Fsync every commit (`synchronous = FULL`).
    pub sync: bool,
    /// How long a statement waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            sync: false,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Durable ordered store.
///
/// A single connection is shared behind a mutex; it is `None` while closed.
pub struct SqliteStore {
    path: Option<PathBuf>,
    options: SqliteOptions,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SqliteStore {
    /// Creates a store for the database file at `path`. Nothing is touched on
    /// disk until [`KeyValueStore::open`].
    pub fn new(path: impl AsRef<Path>, options: SqliteOptions) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            options,
            conn: Mutex::new(None),
        }
    }

    /// Creates a store over a private in-memory database.
    ///
    /// Useful for testing. Contents are lost on `close`.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            options: SqliteOptions::default(),
            conn: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    /// Returns the connection's `PRAGMA synchronous` level (1 = NORMAL, 2 = FULL).
    pub fn synchronous_level(&self) -> StoreResult<i64> {
        self.with_conn(|conn| conn.query_row("PRAGMA synchronous", [], |row| row.get(0)))
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };

        let synchronous = if self.options.sync { "FULL" } else { "NORMAL" };
        conn.busy_timeout(self.options.busy_timeout)?;
        conn.execute_batch(&format!(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = {synchronous};
            PRAGMA temp_store = MEMORY;
            "
        ))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY NOT NULL,
                value BLOB NOT NULL
            ) WITHOUT ROWID;
            ",
        )?;
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(f(conn)?)
    }
}

impl KeyValueStore for SqliteStore {
    fn open(&self) -> StoreResult<()> {
        let mut guard = self.conn.lock();
        if guard.is_some() {
            debug!(path = ?self.path, "sqlite store already open");
            return Ok(());
        }

        *guard = Some(self.connect()?);
        info!(path = ?self.path, sync = self.options.sync, "sqlite store opened");
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        info!(path = ?self.path, "sqlite store closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?
                .query_row(params![key], |row| row.get(0))
                .optional()
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?
                .execute(params![key, value])?;
            Ok(())
        })
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("DELETE FROM kv WHERE key = ?1")?
                .execute(params![key])?;
            Ok(())
        })
    }

    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        let count = batch.len();
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for op in batch {
                match op {
                    BatchOp::Put { key, value } => {
                        tx.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?
                            .execute(params![key, value])?;
                    }
                    BatchOp::Delete { key } => {
                        tx.prepare_cached("DELETE FROM kv WHERE key = ?1")?
                            .execute(params![key])?;
                    }
                }
            }
            tx.commit()
        })?;
        trace!(ops = count, "sqlite store committed batch");
        Ok(())
    }

    fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> StoreResult<Vec<Entry>> {
        let upper = prefix_successor(prefix);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(|conn| {
            let (sql, lower) = match after {
                Some(key) => (
                    "SELECT key, value FROM kv \
                     WHERE key > ?1 AND (?2 IS NULL OR key < ?2) ORDER BY key LIMIT ?3",
                    key,
                ),
                None => (
                    "SELECT key, value FROM kv \
                     WHERE key >= ?1 AND (?2 IS NULL OR key < ?2) ORDER BY key LIMIT ?3",
                    prefix,
                ),
            };

            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params![lower, upper, limit], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (key, value) = row?;
                // An all-0xFF prefix has no upper bound; stop at the first foreign key.
                if !key.starts_with(prefix) {
                    break;
                }
                entries.push((key, value));
            }
            Ok(entries)
        })
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            if let Err((_, e)) = conn.close() {
                debug!(error = %e, "sqlite store close on drop failed");
            }
        }
    }
}
