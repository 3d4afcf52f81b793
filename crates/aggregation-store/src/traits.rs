//! The store contract shared by every backend.

use crate::batch::WriteBatch;
use crate::scan::PrefixScan;
use crate::StoreResult;

/// One key/value pair returned by a scan.
pub type Entry = (Vec<u8>, Vec<u8>);

/// An ordered byte-keyed store.
///
/// Keys compare as raw bytes (lexicographic). Implementations must be safe
/// to share across threads: single-key operations are atomic with respect to
/// each other, and a [`WriteBatch`] is never observed half-applied by a
/// concurrent read or scan page.
pub trait KeyValueStore: Send + Sync {
    /// Opens the backing engine. Opening an already open store is a no-op.
    fn open(&self) -> StoreResult<()>;

    /// Releases the backing engine. Closing a closed store is a no-op.
    fn close(&self) -> StoreResult<()>;

    /// Returns true between a successful `open` and the next `close`.
    fn is_open(&self) -> bool;

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Removes `key`. Removing an absent key succeeds.
    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Applies every operation in `batch` or none of them.
    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Returns up to `limit` entries whose key starts with `prefix`, in
    /// ascending key order, strictly after `after` when given.
    ///
    /// This is the paging primitive behind [`PrefixScan`]; callers normally
    /// go through [`ScanExt::scan_prefix`].
    fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> StoreResult<Vec<Entry>>;
}

/// Lazy prefix scans for any store, including `dyn KeyValueStore`.
pub trait ScanExt: KeyValueStore {
    /// Starts a lazy, restartable scan over every key starting with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> PrefixScan<'_, Self> {
        PrefixScan::new(self, prefix)
    }
}

impl<S: KeyValueStore + ?Sized> ScanExt for S {}
