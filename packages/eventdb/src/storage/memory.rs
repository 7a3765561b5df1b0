//! In-process blob backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{txn_size, BlobStore};
use crate::error::{EngineError, Result};

/// `BTreeMap`-backed store with a transaction size limit and injectable
/// busy failures.
#[derive(Debug)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    max_txn_bytes: usize,
    fail_next: AtomicU32,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_txn_bytes(usize::MAX)
    }

    pub fn with_max_txn_bytes(max_txn_bytes: usize) -> Self {
        Self {
            blobs: RwLock::new(BTreeMap::new()),
            max_txn_bytes,
            fail_next: AtomicU32::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` commits fail with `StorageBusy`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Overwrite a blob outside of any transaction (corruption tests).
    pub fn put_raw(&self, key: &str, value: Vec<u8>) {
        self.write().insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.write().remove(key)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read().get(key).cloned())
    }

    fn commit(&self, writes: &[(String, Vec<u8>)]) -> Result<()> {
        let busy = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Err(EngineError::StorageBusy);
        }

        let size = txn_size(writes);
        if size > self.max_txn_bytes {
            return Err(EngineError::TransactionTooLarge {
                size,
                limit: self.max_txn_bytes,
            });
        }

        let mut blobs = self.write();
        for (key, value) in writes {
            blobs.insert(key.clone(), value.clone());
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn max_txn_bytes(&self) -> usize {
        self.max_txn_bytes
    }
}
