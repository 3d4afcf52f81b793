//! Lazy prefix scan cursor.
//!
//! A [`PrefixScan`] pulls entries from its store one page at a time. No engine
//! lock, statement or transaction is held between pages, so a cursor that is
//! dropped early (break, `?`, panic unwind) leaks nothing, and writers are
//! never blocked by a slow consumer. Each page is read atomically, which is
//! what keeps a half-applied batch invisible to scanners.

use std::collections::VecDeque;

use crate::traits::{Entry, KeyValueStore};
use crate::StoreResult;

/// Default number of entries fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Iterator over `(key, value)` pairs under one prefix, in ascending key order.
pub struct PrefixScan<'a, S: KeyValueStore + ?Sized> {
    store: &'a S,
    prefix: Vec<u8>,
    page_size: usize,
    buffer: VecDeque<Entry>,
    last_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl<'a, S: KeyValueStore + ?Sized> PrefixScan<'a, S> {
    pub fn new(store: &'a S, prefix: &[u8]) -> Self {
        Self {
            store,
            prefix: prefix.to_vec(),
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            last_key: None,
            exhausted: false,
        }
    }

    /// Sets the page size. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// The last key handed out, if any.
    pub fn position(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    /// Rewinds the cursor to the start of the prefix.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.last_key = None;
        self.exhausted = false;
    }

    /// Repositions the cursor to continue strictly after `key`.
    pub fn resume_after(&mut self, key: &[u8]) {
        self.buffer.clear();
        self.last_key = Some(key.to_vec());
        self.exhausted = false;
    }

    fn fill(&mut self) -> StoreResult<()> {
        let page = self
            .store
            .scan_page(&self.prefix, self.last_key.as_deref(), self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S: KeyValueStore + ?Sized> Iterator for PrefixScan<'_, S> {
    type Item = StoreResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let (key, value) = self.buffer.pop_front()?;
        self.last_key = Some(key.clone());
        Some(Ok((key, value)))
    }
}

/// Smallest byte string greater than every key starting with `prefix`.
///
/// Returns `None` when no such bound exists (empty prefix or all `0xFF`).
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
