//! Engine: per-resource part trees plus the durable granule layer.
//!
//! Owns all state explicitly (no globals), so several engines can live in
//! one process:
//!
//! - `trees` -- one lock-free [`Tree`] per resource, created on first write
//! - `durable` -- [`GranuleStore`] + [`PrimaryIndex`] over one [`BlobStore`]
//!
//! Reads come in two flavours: `scan` only looks at memory, `query` also
//! reads the persisted granules of the requested range.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, Weak};
use std::thread::{self, JoinHandle};

use arrow_array::RecordBatch;
use arrow_select::concat::concat_batches;
use crossbeam_channel::{select, tick, unbounded, Sender};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::bsi::Aggregate;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::filter::Filters;
use crate::granule::{Granule, GranuleStore};
use crate::part::Part;
use crate::primary::PrimaryIndex;
use crate::schema::SchemaDescriptor;
use crate::storage::{BlobStore, FsStore, MemoryStore};
use crate::tree::{check_metric, select_parts, CancelToken, CompactionResult, GranuleSink, Tree, TreeStats};

/// Sub-directory of [`Engine::open_dir`] holding the blobs.
pub const BLOB_DIR: &str = "blobs";

/// Granule store + primary index; a part counts as persisted only once
/// the primary index has registered its granule.
struct Durable {
    granules: GranuleStore,
    primary: PrimaryIndex,
}

impl GranuleSink for Durable {
    fn write(&self, resource: &str, part: &Part) -> Result<Granule> {
        self.granules.persist(resource, part)
    }

    fn register(&self, resource: &str, granule: &Granule) -> Result<()> {
        self.primary.add(resource, granule.clone())
    }
}

pub struct Engine {
    schema: Arc<SchemaDescriptor>,
    config: EngineConfig,
    trees: RwLock<HashMap<String, Arc<Tree>>>,
    durable: Durable,
    /// `None` when compaction runs on the calling thread.
    pool: Option<rayon::ThreadPool>,
    /// `true` once closed to writes. Writers hold the read side while
    /// adding so `close` waits for them before flushing.
    closed: RwLock<bool>,
}

impl Engine {
    pub fn open(
        schema: SchemaDescriptor,
        config: EngineConfig,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        config.validate()?;
        let primary = PrimaryIndex::open(store.clone(), config.storage.clone())?;
        let granules = GranuleStore::new(store, config.storage.clone());

        let threads = config.compaction.threads();
        let pool = if threads > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("eventdb-compact-{}", i))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "Compaction pool unavailable, compacting sequentially");
                    None
                }
            }
        } else {
            None
        };

        info!(
            resources = primary.resources().len(),
            schema_version = schema.version(),
            compaction_threads = pool.as_ref().map_or(1, |p| p.current_num_threads()),
            "Opened engine"
        );
        Ok(Self {
            schema: Arc::new(schema),
            config,
            trees: RwLock::new(HashMap::new()),
            durable: Durable { granules, primary },
            pool,
            closed: RwLock::new(false),
        })
    }

    /// Engine over a [`MemoryStore`] with default config.
    pub fn in_memory(schema: SchemaDescriptor) -> Result<Self> {
        Self::open(schema, EngineConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Engine over a directory: `engine_config.json` (optional) plus an
    /// [`FsStore`] in `blobs/`.
    pub fn open_dir(dir: &Path, schema: SchemaDescriptor) -> Result<Self> {
        let config = EngineConfig::read_from(dir)?.unwrap_or_default();
        let store = FsStore::open(&dir.join(BLOB_DIR), config.storage.max_txn_bytes)?;
        Self::open(schema, config, Arc::new(store))
    }

    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn granule_store(&self) -> &GranuleStore {
        &self.durable.granules
    }

    pub fn primary_index(&self) -> &PrimaryIndex {
        &self.durable.primary
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(|e| e.into_inner())
    }

    fn get_tree(&self, resource: &str) -> Option<Arc<Tree>> {
        self.trees
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(resource)
            .cloned()
    }

    fn tree(&self, resource: &str) -> Arc<Tree> {
        if let Some(tree) = self.get_tree(resource) {
            return tree;
        }
        let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
        trees
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Tree::new(resource, self.schema.clone())))
            .clone()
    }

    fn all_trees(&self) -> Vec<Arc<Tree>> {
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Arc<Tree>> = trees.values().cloned().collect();
        list.sort_by(|a, b| a.resource().cmp(b.resource()));
        list
    }

    /// Resources with an in-memory tree.
    pub fn resources(&self) -> Vec<String> {
        self.all_trees()
            .iter()
            .map(|t| t.resource().to_string())
            .collect()
    }

    /// Ingest one batch for `resource`.
    pub fn add(&self, resource: &str, batch: RecordBatch) -> Result<()> {
        let closed = self.closed.read().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return Err(EngineError::Closed);
        }
        self.tree(resource).add(batch)
    }

    /// In-memory rows only.
    pub fn scan(
        &self,
        resource: &str,
        start: i64,
        end: i64,
        filters: &Filters,
        projection: &[String],
    ) -> Result<RecordBatch> {
        match self.get_tree(resource) {
            Some(tree) => tree.scan(start, end, filters, projection),
            None => {
                let columns = self.schema.projection(projection)?;
                Ok(RecordBatch::new_empty(Arc::new(
                    self.schema.arrow().project(&columns)?,
                )))
            }
        }
    }

    /// In-memory rows followed by rows from persisted granules.
    ///
    /// Granules that fail to decode are logged and skipped.
    pub fn query(
        &self,
        resource: &str,
        start: i64,
        end: i64,
        filters: &Filters,
        projection: &[String],
        cancel: &CancelToken,
    ) -> Result<RecordBatch> {
        let columns = self.schema.projection(projection)?;
        let schema = Arc::new(self.schema.arrow().project(&columns)?);

        let (memory, granules) = self.read_both(resource, cancel, |tree| {
            let granules = self.durable.primary.granules(resource, start, end);
            let memory = match tree {
                Some(tree) => Some(tree.scan_cancellable(start, end, filters, projection, cancel)?),
                None => None,
            };
            Ok((memory, granules))
        })?;

        let parts = self.load_granules(resource, &granules, cancel)?;
        let mut batches: Vec<RecordBatch> = memory.into_iter().collect();
        batches.extend(select_parts(&parts, start, end, filters, &columns, cancel)?);

        let out = concat_batches(&schema, &batches)?;
        debug!(
            resource,
            granules = granules.len(),
            rows = out.num_rows(),
            "Queried resource"
        );
        Ok(out)
    }

    /// Sum/count of an `int64` column across memory and persisted granules.
    pub fn aggregate(
        &self,
        resource: &str,
        start: i64,
        end: i64,
        filters: &Filters,
        column: &str,
    ) -> Result<Aggregate> {
        check_metric(&self.schema, column)?;
        let cancel = CancelToken::new();
        let (mut total, granules) = self.read_both(resource, &cancel, |tree| {
            let granules = self.durable.primary.granules(resource, start, end);
            let memory = match tree {
                Some(tree) => tree.aggregate(start, end, filters, column)?,
                None => Aggregate::default(),
            };
            Ok((memory, granules))
        })?;
        for part in self.load_granules(resource, &granules, &cancel)? {
            total.merge(part.aggregate(start, end, filters, column));
        }
        Ok(total)
    }

    fn read_both<T>(
        &self,
        resource: &str,
        cancel: &CancelToken,
        mut read: impl FnMut(Option<&Tree>) -> Result<T>,
    ) -> Result<T> {
        match self.get_tree(resource) {
            Some(tree) => tree.read_stable(cancel, || read(Some(tree.as_ref()))),
            None => read(None),
        }
    }

    fn load_granules(
        &self,
        resource: &str,
        granules: &[Granule],
        cancel: &CancelToken,
    ) -> Result<Vec<Arc<Part>>> {
        let mut parts = Vec::with_capacity(granules.len());
        for granule in granules {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.durable.granules.load(resource, &granule.id, &self.schema) {
                Ok(part) => parts.push(Arc::new(part)),
                Err(e) if e.kind() == ErrorKind::CorruptData => {
                    warn!(
                        resource,
                        granule = %granule.id,
                        error = %e,
                        "Skipping unreadable granule"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(parts)
    }

    /// Ids of persisted granules overlapping `[start, end]`.
    pub fn find_granules(&self, resource: &str, start: i64, end: i64) -> Vec<String> {
        self.durable.primary.find_granules(resource, start, end)
    }

    pub fn stats(&self, resource: &str) -> TreeStats {
        self.get_tree(resource)
            .map(|t| t.stats())
            .unwrap_or_default()
    }

    /// One compaction cycle for `resource`. Still runs after `close`, so
    /// parts a failed close left behind can be persisted.
    pub fn compact(&self, resource: &str) -> Result<CompactionResult> {
        match self.get_tree(resource) {
            Some(tree) => tree.compact(&self.config.compaction, &self.durable),
            None => Ok(CompactionResult::default()),
        }
    }

    /// One compaction cycle for every resource, in parallel.
    ///
    /// A failing resource does not stop the others; its tree is left as it
    /// was and the next cycle retries it.
    pub fn compact_all(&self) -> Vec<(String, Result<CompactionResult>)> {
        let trees = self.all_trees();
        let run = |tree: &Arc<Tree>| {
            (
                tree.resource().to_string(),
                tree.compact(&self.config.compaction, &self.durable),
            )
        };

        let results: Vec<(String, Result<CompactionResult>)> = match &self.pool {
            Some(pool) if trees.len() > 1 => pool.install(|| trees.par_iter().map(run).collect()),
            _ => trees.iter().map(run).collect(),
        };

        for (resource, result) in &results {
            if let Err(e) = result {
                warn!(resource = %resource, error = %e, "Compaction failed; will retry next cycle");
            }
        }
        results
    }

    /// Refuse further writes and persist every live part.
    ///
    /// Waits for in-flight `add` calls. Every tree is flushed even if one
    /// fails; the first error is returned and writes stay refused. Calling
    /// `close` again retries the flush, and `Ok` means no rows are left
    /// only in memory.
    pub fn close(&self) -> Result<()> {
        *self.closed.write().unwrap_or_else(|e| e.into_inner()) = true;

        let mut first_err = None;
        for tree in self.all_trees() {
            match tree.flush(&self.durable) {
                Ok(result) if !result.is_noop() => {
                    info!(resource = tree.resource(), rows = result.rows, "Flushed on close");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(resource = tree.resource(), error = %e, "Flush on close failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start a background thread running [`Engine::compact_all`] every
    /// `compaction.interval_ms`. It stops when the returned handle is
    /// stopped or dropped, or when the engine is dropped.
    pub fn spawn_compactor(self: &Arc<Self>) -> Result<Compactor> {
        let engine: Weak<Engine> = Arc::downgrade(self);
        let ticker = tick(self.config.compaction.interval());
        let (shutdown, stop) = unbounded::<()>();

        let handle = thread::Builder::new()
            .name("eventdb-compactor".into())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => {
                        let Some(engine) = engine.upgrade() else { break };
                        let results = engine.compact_all();
                        let merged: usize = results
                            .iter()
                            .filter_map(|(_, r)| r.as_ref().ok())
                            .map(|r| r.parts_merged)
                            .sum();
                        debug!(resources = results.len(), parts = merged, "Compactor tick");
                    }
                    recv(stop) -> _ => break,
                }
            })?;

        Ok(Compactor {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }
}

/// Handle to the background compactor thread.
pub struct Compactor {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Compactor {
    /// Signal the thread and wait for the current cycle to finish.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Compactor thread panicked");
            }
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
