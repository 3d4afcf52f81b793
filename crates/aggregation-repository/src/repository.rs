//! The aggregation repository.
//!
//! # Key-spaces
//!
//! Each repository owns two prefixes in one shared store:
//!
//! - live: `name \0 correlation-key`, the in-progress snapshot per key
//! - completed: `name-completed \0 exchange-id`, snapshots handed off and
//!   awaiting `confirm`
//!
//! # Hand-off
//!
//! `remove` moves a snapshot from live to completed in one [`WriteBatch`], so
//! after a crash exactly one of the two entries exists.
//!
//! # Same-key ordering
//!
//! `add` and `remove` on the same correlation key are serialized by a
//! striped lock, so `add` always returns the value that existed immediately
//! before its own write and `remove` never races an `add` between its read
//! and its batch. `confirm` takes the stripe of its exchange id, so of several
//! concurrent confirms exactly one observes the entry. Different keys never
//! contend beyond hash collisions.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use aggregation_store::{
    KeyValueStore, MemoryStore, PrefixScan, ScanExt, SqliteOptions, SqliteStore, StoreError,
    WriteBatch,
};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::codec::{CodecError, ExchangeCodec, JsonExchangeCodec};
use crate::config::RepositoryConfig;
use crate::exchange::Exchange;
use crate::keys::KeySpace;
use crate::{RepositoryError, RepositoryResult};

const LOCK_STRIPES: usize = 64;

/// Key context used for errors raised by whole-namespace operations.
const ALL_KEYS: &str = "*";

struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[index].lock()
    }
}

/// Durable staging for in-flight aggregated exchanges.
///
/// Safe to share across threads behind an `Arc`; every operation blocks on
/// store I/O.
pub struct AggregationRepository {
    config: RepositoryConfig,
    keys: KeySpace,
    store: Arc<dyn KeyValueStore>,
    codec: Arc<dyn ExchangeCodec>,
    locks: KeyLocks,
}

impl std::fmt::Debug for AggregationRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationRepository")
            .field("name", &self.keys.name())
            .field("store_open", &self.store.is_open())
            .finish()
    }
}

impl AggregationRepository {
    /// Opens a repository over a durable SQLite store at
    /// `config.persistent_file_name`, honoring `config.sync`.
    pub fn open(config: RepositoryConfig) -> RepositoryResult<Self> {
        let store = Self::durable_store(&config)?;
        Self::with_store(config, Arc::new(store), Arc::new(JsonExchangeCodec))
    }

    /// The unopened SQLite store `open` builds for `config`.
    pub(crate) fn durable_store(config: &RepositoryConfig) -> RepositoryResult<SqliteStore> {
        let path = config.persistent_file_name.clone().ok_or_else(|| {
            RepositoryError::Config(
                "persistent_file_name is required to open a durable repository".to_string(),
            )
        })?;
        Ok(SqliteStore::new(
            path,
            SqliteOptions {
                sync: config.sync,
                ..SqliteOptions::default()
            },
        ))
    }

    /// Opens a repository over an unbounded volatile store.
    ///
    /// Useful for testing. Nothing survives the process.
    pub fn in_memory(config: RepositoryConfig) -> RepositoryResult<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()), Arc::new(JsonExchangeCodec))
    }

    /// Opens a repository over a pre-built store and codec.
    ///
    /// Validates `config`, opens the store (a no-op when already open) and
    /// logs the live/completed inventory. If the inventory scan fails the
    /// store is closed again before the error is returned.
    pub fn with_store(
        config: RepositoryConfig,
        store: Arc<dyn KeyValueStore>,
        codec: Arc<dyn ExchangeCodec>,
    ) -> RepositoryResult<Self> {
        config.validate()?;
        let keys = KeySpace::new(&config.repository_name).map_err(RepositoryError::Config)?;

        let repository = Self {
            config,
            keys,
            store,
            codec,
            locks: KeyLocks::new(),
        };

        repository
            .store
            .open()
            .map_err(|source| repository.store_error(ALL_KEYS, source))?;

        if let Err(e) = repository.log_inventory() {
            if let Err(close_err) = repository.store.close() {
                warn!(
                    repository = %repository.name(),
                    error = %close_err,
                    "failed to close store after startup failure"
                );
            }
            return Err(e);
        }

        Ok(repository)
    }

    fn log_inventory(&self) -> RepositoryResult<()> {
        let live = self.size()?;
        let completed = self.completed_size()?;
        if completed == 0 {
            info!(
                repository = %self.name(),
                live,
                "aggregation repository started with no completed exchanges awaiting confirmation"
            );
        } else {
            warn!(
                repository = %self.name(),
                live,
                completed,
                "aggregation repository started with completed exchanges awaiting confirmation; \
                 they will be recovered"
            );
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.keys.name()
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    /// The shared backing store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Stores `exchange` as the live snapshot for `key`.
    ///
    /// With `return_old_exchange` the snapshot it replaces is returned;
    /// otherwise the result is always `None` and no read is made. On error
    /// nothing was written.
    pub fn add(&self, key: &str, exchange: &Exchange) -> RepositoryResult<Option<Exchange>> {
        debug!(
            repository = %self.name(),
            key,
            exchange_id = %exchange.exchange_id,
            "adding exchange"
        );
        let live_key = self.keys.live_key(key);
        let bytes = self.marshal(key, exchange)?;

        let _guard = self.locks.lock(key);
        let previous = if self.config.return_old_exchange {
            self.read(&live_key, key)?
                .map(|old| self.unmarshal(key, &old))
                .transpose()?
        } else {
            None
        };

        self.store
            .put(&live_key, &bytes)
            .map_err(|source| self.store_error(key, source))?;
        Ok(previous)
    }

    /// Returns the live snapshot for `key`.
    pub fn get(&self, key: &str) -> RepositoryResult<Option<Exchange>> {
        debug!(repository = %self.name(), key, "getting exchange");
        self.read(&self.keys.live_key(key), key)?
            .map(|bytes| self.unmarshal(key, &bytes))
            .transpose()
    }

    /// Moves the live entry for `key` to the completed key-space under
    /// `exchange.exchange_id`, storing `exchange` as the completed snapshot.
    ///
    /// Both writes land in one atomic batch. Removing a key with no live
    /// entry writes nothing.
    pub fn remove(&self, key: &str, exchange: &Exchange) -> RepositoryResult<()> {
        debug!(
            repository = %self.name(),
            key,
            exchange_id = %exchange.exchange_id,
            "removing exchange"
        );
        let live_key = self.keys.live_key(key);
        let bytes = self.marshal(key, exchange)?;

        let _guard = self.locks.lock(key);
        if self.read(&live_key, key)?.is_none() {
            debug!(repository = %self.name(), key, "no live entry, nothing to remove");
            return Ok(());
        }

        let completed_key = self.keys.completed_key(&exchange.exchange_id);
        trace!(
            repository = %self.name(),
            key,
            completed = %self.keys.completed_name(),
            exchange_id = %exchange.exchange_id,
            "moving live entry to completed"
        );
        let mut batch = WriteBatch::new();
        batch.delete(live_key).put(completed_key, bytes);
        self.store
            .write_batch(batch)
            .map_err(|source| self.store_error(key, source))
    }

    /// Drops the completed entry for `exchange_id`.
    ///
    /// Returns whether an entry was present; confirming twice is not an error.
    pub fn confirm(&self, exchange_id: &str) -> RepositoryResult<bool> {
        debug!(repository = %self.name(), exchange_id, "confirming exchange");
        let completed_key = self.keys.completed_key(exchange_id);

        let _guard = self.locks.lock(exchange_id);
        if self.read(&completed_key, exchange_id)?.is_none() {
            trace!(repository = %self.name(), exchange_id, "nothing to confirm");
            return Ok(false);
        }
        self.store
            .delete(&completed_key)
            .map_err(|source| self.store_error(exchange_id, source))?;
        Ok(true)
    }

    /// Snapshot of the live correlation keys.
    pub fn keys(&self) -> RepositoryResult<BTreeSet<String>> {
        let keys = self.collect(self.keys.live_prefix(), |raw| self.keys.decode_live(raw))?;
        trace!(repository = %self.name(), count = keys.len(), "listed live keys");
        Ok(keys)
    }

    /// Snapshot of the exchange ids awaiting confirmation.
    pub fn scan_completed(&self) -> RepositoryResult<BTreeSet<String>> {
        let ids = self.collect(self.keys.completed_prefix(), |raw| {
            self.keys.decode_completed(raw)
        })?;
        trace!(repository = %self.name(), count = ids.len(), "scanned completed exchanges");
        Ok(ids)
    }

    /// Lazily enumerates completed exchange ids in ascending order.
    ///
    /// The cursor holds no store resources between pages, so it can be
    /// abandoned at any point.
    pub fn completed_ids(&self) -> CompletedIds<'_> {
        CompletedIds {
            repository: self,
            scan: self.store.scan_prefix(self.keys.completed_prefix()),
        }
    }

    /// Reads the completed snapshot for `exchange_id`.
    ///
    /// Always `None` when recovery is disabled.
    pub fn recover(&self, exchange_id: &str) -> RepositoryResult<Option<Exchange>> {
        if !self.config.use_recovery {
            trace!(repository = %self.name(), exchange_id, "recovery disabled");
            return Ok(None);
        }
        debug!(repository = %self.name(), exchange_id, "recovering exchange");
        self.read(&self.keys.completed_key(exchange_id), exchange_id)?
            .map(|bytes| self.unmarshal(exchange_id, &bytes))
            .transpose()
    }

    /// Number of live entries.
    pub fn size(&self) -> RepositoryResult<usize> {
        self.count(self.keys.live_prefix())
    }

    /// Number of completed entries awaiting confirmation.
    pub fn completed_size(&self) -> RepositoryResult<usize> {
        self.count(self.keys.completed_prefix())
    }

    /// Closes the backing store. Callers running a scanner must stop it
    /// first; [`crate::AggregationService`] does this in order.
    pub fn close(&self) -> RepositoryResult<()> {
        debug!(repository = %self.name(), "closing aggregation repository");
        self.store
            .close()
            .map_err(|source| self.store_error(ALL_KEYS, source))
    }

    fn read(&self, raw_key: &[u8], key: &str) -> RepositoryResult<Option<Vec<u8>>> {
        self.store
            .get(raw_key)
            .map_err(|source| self.store_error(key, source))
    }

    fn count(&self, prefix: &[u8]) -> RepositoryResult<usize> {
        let mut count = 0;
        for entry in self.store.scan_prefix(prefix) {
            entry.map_err(|source| self.store_error(ALL_KEYS, source))?;
            count += 1;
        }
        Ok(count)
    }

    fn collect<F>(&self, prefix: &[u8], decode: F) -> RepositoryResult<BTreeSet<String>>
    where
        F: Fn(&[u8]) -> Option<String>,
    {
        let mut out = BTreeSet::new();
        for entry in self.store.scan_prefix(prefix) {
            let (raw, _) = entry.map_err(|source| self.store_error(ALL_KEYS, source))?;
            if let Some(key) = decode(&raw) {
                out.insert(key);
            }
        }
        Ok(out)
    }

    fn marshal(&self, key: &str, exchange: &Exchange) -> RepositoryResult<Vec<u8>> {
        self.codec
            .marshal(exchange, self.config.allow_serialized_headers)
            .map_err(|source| self.codec_error(key, source))
    }

    fn unmarshal(&self, key: &str, bytes: &[u8]) -> RepositoryResult<Exchange> {
        self.codec
            .unmarshal(bytes)
            .map_err(|source| self.codec_error(key, source))
    }

    fn store_error(&self, key: &str, source: StoreError) -> RepositoryError {
        RepositoryError::Store {
            repository: self.name().to_string(),
            key: key.to_string(),
            source,
        }
    }

    fn codec_error(&self, key: &str, source: CodecError) -> RepositoryError {
        RepositoryError::Codec {
            repository: self.name().to_string(),
            key: key.to_string(),
            source,
        }
    }
}

/// Lazy iterator over completed exchange ids. See
/// [`AggregationRepository::completed_ids`].
pub struct CompletedIds<'a> {
    repository: &'a AggregationRepository,
    scan: PrefixScan<'a, dyn KeyValueStore>,
}

impl Iterator for CompletedIds<'_> {
    type Item = RepositoryResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.scan.next()? {
                Ok((raw, _)) => {
                    if let Some(id) = self.repository.keys.decode_completed(&raw) {
                        return Some(Ok(id));
                    }
                }
                Err(source) => {
                    return Some(Err(self.repository.store_error(ALL_KEYS, source)));
                }
            }
        }
    }
}
