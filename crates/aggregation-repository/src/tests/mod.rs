//! Integration tests for the aggregation repository.
//!
//! - `durability.rs`  - persistence across reopen, crash consistency of the hand-off
//! - `recovery.rs`    - redelivery budget, escalation, halting, scanner lifecycle
//! - `concurrency.rs` - one repository shared by many threads
//! - `failures.rs`    - injected store, codec and collaborator failures


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aggregation_store::{Entry, KeyValueStore, MemoryStore, StoreError, StoreResult, WriteBatch};
use serde_json::json;

use crate::{AggregationRepository, Exchange, JsonExchangeCodec, RepositoryConfig};

pub(crate) const DEAD_LETTER: &str = "mock:dead";

/// A config with recovery fully set up.
pub(crate) fn config(name: &str, maximum_redeliveries: i32) -> RepositoryConfig {
    RepositoryConfig {
        maximum_redeliveries,
        dead_letter_uri: Some(DEAD_LETTER.to_string()),
        ..RepositoryConfig::new(name)
    }
}

/// Adds then removes `key`, leaving one completed entry with id `id`.
pub(crate) fn stage(repo: &AggregationRepository, key: &str, id: &str) -> Exchange {
    let exchange = Exchange::with_id(id, json!({ "key": key }));
    repo.add(key, &exchange).unwrap();
    repo.remove(key, &exchange).unwrap();
    exchange
}

/// Polls `condition` until it holds or `timeout` passes.
pub(crate) fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A memory store whose primitives can be made to fail, or reads to stall,
/// on demand.
#[derive(Debug, Default)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    fail_get: AtomicBool,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
    fail_batch: AtomicBool,
    fail_scan: AtomicBool,
    get_delay_ms: AtomicU64,
}

impl FailingStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_batch(&self, fail: bool) {
        self.fail_batch.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_scan(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::SeqCst);
    }

    /// Makes every `get` sleep for `delay` before reading.
    pub(crate) fn slow_gets(&self, delay: Duration) {
        self.get_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, primitive: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Backend(format!("injected {} failure", primitive)))
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for FailingStore {
    fn open(&self) -> StoreResult<()> {
        self.inner.open()
    }

    fn close(&self) -> StoreResult<()> {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Self::check(&self.fail_get, "get")?;
        let delay = self.get_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        Self::check(&self.fail_put, "put")?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        Self::check(&self.fail_delete, "delete")?;
        self.inner.delete(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        Self::check(&self.fail_batch, "batch")?;
        self.inner.write_batch(batch)
    }

    fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> StoreResult<Vec<Entry>> {
        Self::check(&self.fail_scan, "scan")?;
        self.inner.scan_page(prefix, after, limit)
    }
}

/// Opens a repository over `store` with the default codec.
pub(crate) fn repository_over(
    store: Arc<FailingStore>,
    config: RepositoryConfig,
) -> AggregationRepository {
    AggregationRepository::with_store(config, store, Arc::new(JsonExchangeCodec)).unwrap()
}

/// Basic workflow: add, replace, complete, confirm.
#[test]
fn basic_workflow() {
    let config = RepositoryConfig {
        return_old_exchange: true,
        ..config("orders", 3)
    };
    let repo = AggregationRepository::in_memory(config).unwrap();

    let first = Exchange::new(json!({"lines": 1}));
    let second = Exchange::new(json!({"lines": 2})).with_header("source", "web");

    assert!(repo.add("acct-7", &first).unwrap().is_none());
    assert_eq!(repo.add("acct-7", &second).unwrap(), Some(first));
    assert_eq!(repo.get("acct-7").unwrap(), Some(second.clone()));
    assert_eq!(repo.keys().unwrap().len(), 1);

    repo.remove("acct-7", &second).unwrap();
    assert!(repo.keys().unwrap().is_empty());
    assert_eq!(repo.recover(&second.exchange_id).unwrap(), Some(second.clone()));

    assert!(repo.confirm(&second.exchange_id).unwrap());
    assert_eq!(repo.completed_size().unwrap(), 0);
}
