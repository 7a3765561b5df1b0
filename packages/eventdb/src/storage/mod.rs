//! Durable key/blob backends.
//!
//! Provides:
//! - `BlobStore` -- transactional key/blob interface the granule store and
//!   primary index write through
//! - `memory` -- in-process backend with fault injection, for tests
//! - `fs` -- directory-backed backend
//! - `commit_split` -- size-aware, retrying commit of a write set

pub mod fs;
pub mod memory;

use std::collections::VecDeque;
use std::thread;

use tracing::warn;

use crate::config::StorageConfig;
use crate::error::{EngineError, Result};

pub use fs::FsStore;
pub use memory::MemoryStore;

/// Ordered `(key, blob)` pairs committed together.
pub type WriteSet = Vec<(String, Vec<u8>)>;

/// Transactional blob backend.
///
/// `commit` is all-or-nothing for the keys it is given. Backends refuse
/// write sets larger than [`BlobStore::max_txn_bytes`] with
/// `TransactionTooLarge` and may report contention with `StorageBusy`.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn commit(&self, writes: &[(String, Vec<u8>)]) -> Result<()>;

    fn max_txn_bytes(&self) -> usize;
}

/// Bytes a write set counts against a transaction limit.
pub fn txn_size(writes: &[(String, Vec<u8>)]) -> usize {
    writes.iter().map(|(k, v)| k.len() + v.len()).sum()
}

/// Commit `writes`, splitting into as many transactions as the size limit
/// requires and retrying busy commits with linear backoff.
///
/// Returns the number of transactions committed. On error some leading
/// transactions may already be durable; callers only reference the keys
/// after a successful return, so those blobs are simply unreachable.
pub fn commit_split(
    store: &dyn BlobStore,
    writes: WriteSet,
    config: &StorageConfig,
) -> Result<usize> {
    let limit = store.max_txn_bytes().min(config.max_txn_bytes);
    let mut pending: VecDeque<WriteSet> = VecDeque::new();
    pending.push_back(writes);
    let mut committed = 0;

    while let Some(set) = pending.pop_front() {
        if set.is_empty() {
            continue;
        }
        let size = txn_size(&set);
        if size > limit {
            split_front(&mut pending, set, size, limit)?;
            continue;
        }

        match commit_with_retry(store, &set, config) {
            Ok(()) => committed += 1,
            // The backend may enforce a tighter limit than it advertises.
            Err(EngineError::TransactionTooLarge { .. }) if set.len() > 1 => {
                let backend_limit = size.saturating_sub(1);
                split_front(&mut pending, set, size, backend_limit)?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(committed)
}

fn split_front(
    pending: &mut VecDeque<WriteSet>,
    mut set: WriteSet,
    size: usize,
    limit: usize,
) -> Result<()> {
    if set.len() == 1 {
        return Err(EngineError::TransactionTooLarge { size, limit });
    }
    let tail = set.split_off(set.len() / 2);
    pending.push_front(tail);
    pending.push_front(set);
    Ok(())
}

fn commit_with_retry(
    store: &dyn BlobStore,
    set: &[(String, Vec<u8>)],
    config: &StorageConfig,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        match store.commit(set) {
            Err(EngineError::StorageBusy) if attempt < config.max_attempts => {
                warn!(
                    attempt,
                    keys = set.len(),
                    bytes = txn_size(set),
                    "Storage busy, retrying commit"
                );
                thread::sleep(config.backoff(attempt));
                attempt += 1;
            }
            other => return other,
        }
    }
}
