//! Primary index: per-resource granule lists sorted by `min` timestamp.
//!
//! The whole structure is persisted as one bincode blob under the `index`
//! key after every registration. Readers take a shared lock; registration
//! takes the exclusive lock for the insert and the blob commit, so no reader
//! observes a granule whose registration later rolls back.
//!
//! Lookups use a running maximum of `max` ("reach") alongside the sorted
//! list. `reach` is non-decreasing, so the first granule that can overlap
//! `start` is found by binary search even when long granules make `max`
//! non-monotone in `min`. It is rebuilt on load and never persisted.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::error::{EngineError, Result};
use crate::granule::Granule;
use crate::storage::{commit_split, BlobStore};

/// Key holding the serialized primary index.
pub const PRIMARY_INDEX_KEY: &str = "index";

const PRIMARY_INDEX_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    resources: BTreeMap<String, Vec<Granule>>,
}

#[derive(Debug, Default)]
struct ResourceGranules {
    granules: Vec<Granule>,
    reach: Vec<i64>,
}

impl ResourceGranules {
    fn from_sorted(granules: Vec<Granule>) -> Self {
        let mut r = Self {
            granules,
            reach: Vec::new(),
        };
        r.rebuild_reach(0);
        r
    }

    fn rebuild_reach(&mut self, from: usize) {
        self.reach.truncate(from);
        let mut running = from
            .checked_sub(1)
            .and_then(|i| self.reach.get(i).copied())
            .unwrap_or(i64::MIN);
        for g in &self.granules[from..] {
            running = running.max(g.max);
            self.reach.push(running);
        }
    }

    fn insert(&mut self, granule: Granule) -> usize {
        // After any equal mins, so registration order is kept on ties.
        let pos = self.granules.partition_point(|g| g.min <= granule.min);
        self.granules.insert(pos, granule);
        self.rebuild_reach(pos);
        pos
    }

    fn remove(&mut self, pos: usize) {
        self.granules.remove(pos);
        self.rebuild_reach(pos);
    }

    fn find(&self, start: i64, end: i64) -> impl Iterator<Item = &Granule> {
        let first = self.reach.partition_point(|&r| r < start);
        self.granules[first..]
            .iter()
            .take_while(move |g| g.min <= end)
            .filter(move |g| g.max >= start)
    }
}

pub struct PrimaryIndex {
    store: Arc<dyn BlobStore>,
    config: StorageConfig,
    resources: RwLock<BTreeMap<String, ResourceGranules>>,
}

impl PrimaryIndex {
    /// Load the persisted index, or start empty when none exists yet.
    pub fn open(store: Arc<dyn BlobStore>, config: StorageConfig) -> Result<Self> {
        let mut resources = BTreeMap::new();
        if let Some(bytes) = store.get(PRIMARY_INDEX_KEY)? {
            let file: IndexFile = bincode::deserialize(&bytes)
                .map_err(|e| EngineError::corrupt(PRIMARY_INDEX_KEY, e))?;
            if file.version != PRIMARY_INDEX_VERSION {
                return Err(EngineError::corrupt(
                    PRIMARY_INDEX_KEY,
                    format!("unsupported primary index version {}", file.version),
                ));
            }
            for (resource, granules) in file.resources {
                if granules.windows(2).any(|w| w[0].min > w[1].min) {
                    return Err(EngineError::corrupt(
                        PRIMARY_INDEX_KEY,
                        format!("granules of '{}' not sorted by min", resource),
                    ));
                }
                resources.insert(resource, ResourceGranules::from_sorted(granules));
            }
        }
        Ok(Self {
            store,
            config,
            resources: RwLock::new(resources),
        })
    }

    /// Register a durably written granule and persist the whole index.
    ///
    /// On a failed commit the in-memory state is rolled back, so the
    /// granule stays unregistered.
    pub fn add(&self, resource: &str, granule: Granule) -> Result<()> {
        let mut resources = self.write();
        let pos = resources
            .entry(resource.to_string())
            .or_default()
            .insert(granule);

        if let Err(e) = self.persist(&resources) {
            if let Some(list) = resources.get_mut(resource) {
                list.remove(pos);
                if list.granules.is_empty() {
                    resources.remove(resource);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, resources: &BTreeMap<String, ResourceGranules>) -> Result<()> {
        let file = IndexFile {
            version: PRIMARY_INDEX_VERSION,
            resources: resources
                .iter()
                .map(|(name, r)| (name.clone(), r.granules.clone()))
                .collect(),
        };
        let bytes = bincode::serialize(&file)?;
        commit_split(
            self.store.as_ref(),
            vec![(PRIMARY_INDEX_KEY.to_string(), bytes)],
            &self.config,
        )?;
        Ok(())
    }

    /// Ids of every granule of `resource` with `min <= end && start <= max`,
    /// in `min` order.
    pub fn find_granules(&self, resource: &str, start: i64, end: i64) -> Vec<String> {
        self.granules(resource, start, end)
            .into_iter()
            .map(|g| g.id)
            .collect()
    }

    /// Like [`PrimaryIndex::find_granules`] but returns full metadata.
    pub fn granules(&self, resource: &str, start: i64, end: i64) -> Vec<Granule> {
        if start > end {
            return Vec::new();
        }
        self.read()
            .get(resource)
            .map(|r| r.find(start, end).cloned().collect())
            .unwrap_or_default()
    }

    pub fn resources(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn granule_count(&self, resource: &str) -> usize {
        self.read().get(resource).map_or(0, |r| r.granules.len())
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ResourceGranules>> {
        self.resources.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ResourceGranules>> {
        self.resources.write().unwrap_or_else(|e| e.into_inner())
    }
}
