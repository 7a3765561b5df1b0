//! Host resource detection for compaction sizing.
//!
//! Stateless: each `ResourceManager::auto_tune()` call re-probes RAM and
//! CPU count and derives how wide parallel compaction may go.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const GB: u64 = 1024 * 1024 * 1024;

/// Upper bound on compaction threads, whatever the core count.
const MAX_COMPACTION_THREADS: usize = 8;

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// 0.0 = no pressure, 1.0 = critical.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

/// Compaction parameters derived from [`SystemResources`].
#[derive(Debug, Clone, PartialEq)]
pub struct TuningProfile {
    /// Threads for `Engine::compact_all`.
    pub compaction_threads: usize,
    /// Memory pressure at detection time.
    pub memory_pressure: f64,
}

impl TuningProfile {
    /// `compaction_threads`: RAM < 4 GB -> 1, else `clamp(cpu / 2, 1, 8)`.
    pub fn from_resources(res: &SystemResources) -> Self {
        let compaction_threads = if res.total_memory_bytes < 4 * GB {
            1
        } else {
            (res.cpu_count / 2).clamp(1, MAX_COMPACTION_THREADS)
        };

        Self {
            compaction_threads,
            memory_pressure: res.memory_pressure(),
        }
    }
}

impl Default for TuningProfile {
    /// Conservative values for tests and unknown hosts.
    fn default() -> Self {
        Self {
            compaction_threads: 1,
            memory_pressure: 0.0,
        }
    }
}

pub struct ResourceManager;

impl ResourceManager {
    pub fn auto_tune() -> TuningProfile {
        TuningProfile::from_resources(&SystemResources::detect())
    }
}
