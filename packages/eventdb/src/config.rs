//! Engine configuration: compaction policy and storage limits.
//!
//! Stored as `engine_config.json` next to the data when a caller wants it
//! persisted; every field has a default so partial files are accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::part::Part;
use crate::tuning::ResourceManager;

/// File name used by [`EngineConfig::read_from`] / [`EngineConfig::write_to`].
pub const CONFIG_FILE: &str = "engine_config.json";

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub compaction: CompactionConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Read config from a directory. Returns None if the file doesn't exist.
    pub fn read_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.compaction.interval_ms == 0 {
            return Err(EngineError::Config("compaction.interval_ms must be > 0".into()));
        }
        if self.storage.max_txn_bytes == 0 {
            return Err(EngineError::Config("storage.max_txn_bytes must be > 0".into()));
        }
        if self.storage.max_attempts == 0 {
            return Err(EngineError::Config("storage.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// When to compact a tree and when the result goes to durable storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Period of the background compactor (default: 10s)
    pub interval_ms: u64,
    /// Persist a compacted part at or above this size (default: 64 MiB)
    pub persist_bytes: usize,
    /// Persist a compacted part once its oldest input is this old (default: 15 min)
    pub persist_age_ms: u64,
    /// Minimum live parts before an in-memory-only merge is worth it (default: 2)
    pub min_parts: usize,
    /// Threads for compacting many resources at once; `None` = auto-tune
    pub threads: Option<usize>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            persist_bytes: 64 * MIB,
            persist_age_ms: 15 * 60 * 1000,
            min_parts: 2,
            threads: None,
        }
    }
}

impl CompactionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Compaction thread count, probing the host when not configured.
    pub fn threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| ResourceManager::auto_tune().compaction_threads)
            .max(1)
    }

    pub fn persist_age(&self) -> Duration {
        Duration::from_millis(self.persist_age_ms)
    }

    /// Default persist predicate: large enough or old enough.
    pub fn should_persist(&self, part: &Part) -> bool {
        part.size() >= self.persist_bytes || part.age() >= self.persist_age()
    }

    /// Skip the cycle when there is too little to merge and nothing is due
    /// for persistence.
    pub fn should_compact(&self, parts: &[&Part]) -> bool {
        parts.len() >= self.min_parts.max(1) || parts.iter().any(|p| self.should_persist(p))
    }
}

/// Limits of the blob backend and the retry policy around it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Largest write set committed in one transaction (default: 64 MiB)
    pub max_txn_bytes: usize,
    /// Attempts per transaction before giving up on a busy backend (default: 5)
    pub max_attempts: u32,
    /// Linear backoff step between busy retries (default: 10ms)
    pub backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_txn_bytes: 64 * MIB,
            max_attempts: 5,
            backoff_ms: 10,
        }
    }
}

impl StorageConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.compaction.interval_ms, 10_000);
        assert_eq!(config.compaction.persist_bytes, 64 * MIB);
        assert_eq!(config.compaction.persist_age(), Duration::from_secs(900));
        assert_eq!(config.compaction.min_parts, 2);
        assert_eq!(config.compaction.threads, None);
        assert!(config.compaction.threads() >= 1);
        assert_eq!(config.storage.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"compaction":{"min_parts":8}}"#).unwrap();
        assert_eq!(config.compaction.min_parts, 8);
        assert_eq!(config.compaction.interval_ms, 10_000);
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_read_write() {
        let dir = TempDir::new().unwrap();
        assert!(EngineConfig::read_from(dir.path()).unwrap().is_none());

        let mut config = EngineConfig::default();
        config.storage.max_txn_bytes = 4096;
        config.write_to(dir.path()).unwrap();
        assert_eq!(EngineConfig::read_from(dir.path()).unwrap(), Some(config));
    }

    #[test]
    fn test_read_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"storage":{"max_attempts":0}}"#,
        )
        .unwrap();
        let err = EngineConfig::read_from(dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_backoff_is_linear() {
        let s = StorageConfig::default();
        assert_eq!(s.backoff(1), Duration::from_millis(10));
        assert_eq!(s.backoff(3), Duration::from_millis(30));
    }
}
