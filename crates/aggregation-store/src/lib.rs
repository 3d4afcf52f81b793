//! # Aggregation Store
//!
//! The ordered key-value layer under the aggregation repository.
//!
//! One contract, [`KeyValueStore`], with two backends:
//!
//! - [`MemoryStore`] - volatile `BTreeMap`, optionally bounded with eviction.
//!   No crash recovery.
//! - [`SqliteStore`] - durable SQLite database in WAL mode with an explicit
//!   per-commit fsync policy.
//!
//! Both are safe to share across threads behind an `Arc`. The only
//! multi-key primitive is [`WriteBatch`]: an ordered list of puts and deletes
//! applied all-or-nothing.
//!
//! ## Example
//!
//! ```rust
//! use aggregation_store::{KeyValueStore, MemoryStore, ScanExt, WriteBatch};
//!
//! let store = MemoryStore::new();
//! store.open().unwrap();
//!
//! store.put(b"orders\0acct-7", b"snapshot").unwrap();
//!
//! let mut batch = WriteBatch::new();
//! batch
//!     .delete(b"orders\0acct-7".to_vec())
//!     .put(b"orders-completed\0ex-1".to_vec(), b"snapshot".to_vec());
//! store.write_batch(batch).unwrap();
//!
//! let completed: Vec<_> = store
//!     .scan_prefix(b"orders-completed\0")
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(completed.len(), 1);
//! ```

mod batch;
mod error;
mod memory;
mod scan;
mod sqlite;
mod traits;

pub use batch::{BatchOp, WriteBatch};
pub use error::{StoreError, StoreResult};
pub use memory::{Eviction, MemoryStore};
pub use scan::{PrefixScan, DEFAULT_PAGE_SIZE};
pub use sqlite::{SqliteOptions, SqliteStore};
pub use traits::{Entry, KeyValueStore, ScanExt};
