//! Directory-backed blob backend.
//!
//! One file per key in a flat directory. Keys are percent-escaped so that
//! `{resource}/{id}` and `{resource}/{id}/data` can coexist as siblings.
//! Each blob is written to a temp file, synced, then renamed into place.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{txn_size, BlobStore};
use crate::error::{EngineError, Result};

const TMP_PREFIX: &str = ".tmp-";

#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    max_txn_bytes: usize,
    tmp_counter: AtomicU64,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`. Temp files left
    /// behind by an interrupted commit are removed.
    pub fn open(root: &Path, max_txn_bytes: usize) -> Result<Self> {
        fs::create_dir_all(root)?;
        let mut removed = 0usize;
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(root = %root.display(), removed, "Removed stale temp files");
        }
        Ok(Self {
            root: root.to_path_buf(),
            max_txn_bytes,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(escape_key(key))
    }

    fn tmp_path(&self) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{}{}-{}", TMP_PREFIX, std::process::id(), n))
    }
}

impl BlobStore for FsStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage every blob first, then rename. A crash between renames leaves
    /// some keys visible, which callers tolerate because nothing references
    /// them until the commit returns.
    fn commit(&self, writes: &[(String, Vec<u8>)]) -> Result<()> {
        let size = txn_size(writes);
        if size > self.max_txn_bytes {
            return Err(EngineError::TransactionTooLarge {
                size,
                limit: self.max_txn_bytes,
            });
        }

        let mut staged = Vec::with_capacity(writes.len());
        for (key, value) in writes {
            let tmp = self.tmp_path();
            let result = File::create(&tmp).and_then(|mut f| {
                f.write_all(value)?;
                f.sync_all()
            });
            if let Err(e) = result {
                let _ = fs::remove_file(&tmp);
                for (path, _) in &staged {
                    let _ = fs::remove_file(path);
                }
                return Err(e.into());
            }
            staged.push((tmp, self.path_for(key)));
        }

        for (tmp, target) in &staged {
            fs::rename(tmp, target)?;
        }
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    fn max_txn_bytes(&self) -> usize {
        self.max_txn_bytes
    }
}

/// Keep `[A-Za-z0-9_-]` and non-leading `.`; everything else becomes `%XX`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, b) in key.bytes().enumerate() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => out.push(b as char),
            b'.' if i > 0 => out.push('.'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
