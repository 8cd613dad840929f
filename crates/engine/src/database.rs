//! Table registry
//!
//! A `Database` owns a data directory:
//!
//! ```text
//! <dir>/tessera.toml
//! <dir>/tables/<name>/schema.json
//! <dir>/tables/<name>/segments/...   (SegmentStore)
//! <dir>/tables/<name>/wal/...        (append logs)
//! ```
//!
//! Every table gets its own `EngineCore`; all tables share one segment
//! cache and one maintenance scheduler. Opening the same directory twice
//! in a process returns the same instance.

use crate::background::{MaintenanceScheduler, SchedulerStats, TaskHandle, TaskKind};
use crate::cache::{CacheStats, SegmentCache};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::engine::{EngineCore, EngineOptions, PreloadReport, SegmentInfo};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tessera_core::{
    BackendKind, DistanceMetric, Error, IdRange, IndexDescriptor, Neighbor, Result, SearchParams,
    SegmentLocation, VectorId,
};
use tessera_storage::SegmentStore;
use tracing::{error, info, warn};

/// Directory holding one subdirectory per table
pub const TABLES_DIR: &str = "tables";

/// Per-table manifest file
pub const SCHEMA_FILE: &str = "schema.json";

/// Open databases by canonical path
static OPEN_DATABASES: Lazy<Mutex<HashMap<PathBuf, Weak<Database>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Table definition supplied at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name, also its directory name
    pub name: String,
    /// Vector dimension
    pub dimension: usize,
    /// Active segment size that triggers sealing, in MiB; 0 uses the config default
    #[serde(default)]
    pub index_file_size_mb: usize,
    /// Distance metric
    #[serde(default)]
    pub metric: DistanceMetric,
}

impl TableSchema {
    /// Schema with the default segment size
    pub fn new(name: impl Into<String>, dimension: usize, metric: DistanceMetric) -> Self {
        TableSchema {
            name: name.into(),
            dimension,
            index_file_size_mb: 0,
            metric,
        }
    }

    /// Override the seal threshold
    pub fn with_index_file_size_mb(mut self, mb: usize) -> Self {
        self.index_file_size_mb = mb;
        self
    }
}

/// Index request; `nlist: None` uses the configured default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParam {
    /// Backend variant
    pub backend: BackendKind,
    /// Cluster count for IVF
    pub nlist: Option<usize>,
}

impl IndexParam {
    /// Exhaustive index
    pub fn flat() -> Self {
        IndexParam {
            backend: BackendKind::Flat,
            nlist: None,
        }
    }

    /// IVF-Flat with `nlist` clusters
    pub fn ivf_flat(nlist: usize) -> Self {
        IndexParam {
            backend: BackendKind::IvfFlat,
            nlist: Some(nlist),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableManifest {
    schema: TableSchema,
    index: IndexDescriptor,
    created_at: DateTime<Utc>,
}

/// Table statistics
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Schema as created
    pub schema: TableSchema,
    /// Current index descriptor
    pub index: IndexDescriptor,
    /// Live vectors
    pub count: usize,
    /// Nominal bytes of live vectors
    pub size: usize,
    /// Bytes on disk or in memory
    pub physical_size: usize,
    /// Visible segment versions
    pub segments: Vec<SegmentInfo>,
    /// Segments excluded at open
    pub corrupted: Vec<(SegmentLocation, String)>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the whole database
#[derive(Debug, Clone)]
pub struct DatabaseStatus {
    /// Data directory
    pub data_dir: PathBuf,
    /// Number of tables
    pub tables: usize,
    /// Live vectors over all tables
    pub vectors: usize,
    /// Shared cache counters
    pub cache: CacheStats,
    /// Maintenance scheduler counters
    pub scheduler: SchedulerStats,
    /// Time the database was opened
    pub started_at: DateTime<Utc>,
}

struct Table {
    dir: PathBuf,
    manifest: RwLock<TableManifest>,
    engine: Arc<EngineCore>,
}

impl Table {
    fn persist_index(&self, index: IndexDescriptor) -> Result<()> {
        let mut manifest = self.manifest.write();
        let mut next = manifest.clone();
        next.index = index;
        write_manifest(&self.dir, &next)?;
        *manifest = next;
        Ok(())
    }

    /// Put back the descriptor a cancelled build was moving away from
    fn restore_index(&self, previous: IndexDescriptor) {
        let restored = self
            .engine
            .set_descriptor(previous)
            .and_then(|_| self.persist_index(previous));
        match restored {
            Ok(()) => info!(
                target: "tessera::db",
                table = %self.engine.name(),
                backend = %previous.backend,
                "Restored index after cancelled build"
            ),
            Err(e) => warn!(
                target: "tessera::db",
                table = %self.engine.name(),
                error = %e,
                "Could not restore index after cancelled build"
            ),
        }
    }
}

/// Registry of tables under one data directory
pub struct Database {
    dir: PathBuf,
    config: EngineConfig,
    cache: Arc<SegmentCache>,
    scheduler: MaintenanceScheduler,
    tables: RwLock<BTreeMap<String, Arc<Table>>>,
    started_at: DateTime<Utc>,
}

/// Reject names that cannot be used as a table directory.
///
/// Names must be non-empty, at most 256 bytes, free of path separators and
/// null bytes, and must not start with `_` (reserved) or `.`.
pub fn validate_table_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("Table name cannot be empty")
    } else if name.len() > 256 {
        Some("Table name cannot exceed 256 characters")
    } else if name.contains('/') || name.contains('\\') {
        Some("Table name cannot contain path separators")
    } else if name.contains('\0') {
        Some("Table name cannot contain null bytes")
    } else if name.starts_with('_') {
        Some("Table names starting with '_' are reserved")
    } else if name.starts_with('.') {
        Some("Table name cannot start with '.'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::invalid_input(format!("{}: {:?}", reason, name))),
        None => Ok(()),
    }
}

impl Database {
    /// Open (or create) the database in `dir`.
    ///
    /// Loads `tessera.toml`, reopens every table and queues builds for
    /// segments recovered from append logs.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir.join(TABLES_DIR))
            .map_err(|e| Error::io(format!("create data directory '{}'", dir.display()), e))?;
        let canonical = dir
            .canonicalize()
            .map_err(|e| Error::io("canonicalize data directory", e))?;

        let mut registry = OPEN_DATABASES.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        if let Some(db) = registry.get(&canonical).and_then(Weak::upgrade) {
            info!(target: "tessera::db", path = ?canonical, "Returning existing database instance");
            return Ok(db);
        }

        let config = EngineConfig::load_or_create(&canonical)?;
        let db = Arc::new(Database {
            cache: Arc::new(SegmentCache::new(config.cache_capacity_bytes())),
            scheduler: MaintenanceScheduler::new(
                config.background_threads,
                config.max_queue_depth,
            )?,
            dir: canonical.clone(),
            config,
            tables: RwLock::new(BTreeMap::new()),
            started_at: Utc::now(),
        });
        db.load_tables()?;
        registry.insert(canonical.clone(), Arc::downgrade(&db));
        drop(registry);

        info!(
            target: "tessera::db",
            path = ?canonical,
            tables = db.tables.read().len(),
            "Opened database"
        );
        if db.config.auto_build {
            let tables: Vec<Arc<Table>> = db.tables.read().values().cloned().collect();
            for table in tables {
                db.schedule_build(&table);
            }
        }
        Ok(db)
    }

    fn load_tables(&self) -> Result<()> {
        let root = self.dir.join(TABLES_DIR);
        let entries = fs::read_dir(&root).map_err(|e| Error::io("list tables", e))?;
        let mut tables = self.tables.write();
        for entry in entries {
            let path = entry.map_err(|e| Error::io("list tables", e))?.path();
            if !path.is_dir() {
                continue;
            }
            match self.open_table(&path) {
                Ok(table) => {
                    let name = table.manifest.read().schema.name.clone();
                    tables.insert(name, table);
                }
                Err(e) => {
                    error!(
                        target: "tessera::db",
                        path = %path.display(),
                        error = %e,
                        "Failed to open table; skipped"
                    );
                }
            }
        }
        Ok(())
    }

    fn open_table(&self, dir: &Path) -> Result<Arc<Table>> {
        let manifest = read_manifest(dir)?;
        let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if manifest.schema.name != dir_name {
            return Err(Error::invalid_input(format!(
                "schema names table {:?} but lives in {:?}",
                manifest.schema.name, dir_name
            )));
        }
        let store = Arc::new(SegmentStore::open(dir)?);
        let engine = EngineCore::open(
            manifest.schema.name.clone(),
            store,
            Arc::clone(&self.cache),
            manifest.index,
            self.engine_options(&manifest.schema)?,
        )?;
        Ok(Arc::new(Table {
            dir: dir.to_path_buf(),
            manifest: RwLock::new(manifest),
            engine: Arc::new(engine),
        }))
    }

    fn engine_options(&self, schema: &TableSchema) -> Result<EngineOptions> {
        let mb = match schema.index_file_size_mb {
            0 => self.config.index_file_size_mb,
            mb => mb,
        };
        Ok(EngineOptions {
            durability: self.config.durability_mode()?,
            index_file_size: mb.saturating_mul(1 << 20),
        })
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    /// Loaded configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared segment cache
    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    /// Maintenance scheduler
    pub fn scheduler(&self) -> &MaintenanceScheduler {
        &self.scheduler
    }

    fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound {
                name: name.to_string(),
            })
    }

    /// Engine of `name`, for direct segment-level access
    pub fn engine(&self, name: &str) -> Result<Arc<EngineCore>> {
        Ok(Arc::clone(&self.table(name)?.engine))
    }

    /// Create an empty table
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        validate_table_name(&schema.name)?;
        let index = IndexDescriptor::new(
            BackendKind::Flat,
            schema.dimension,
            schema.metric,
            self.config.default_nlist,
        )?;

        let mut tables = self.tables.write();
        let dir = self.dir.join(TABLES_DIR).join(&schema.name);
        if tables.contains_key(&schema.name) || dir.exists() {
            return Err(Error::TableAlreadyExists { name: schema.name });
        }
        fs::create_dir_all(&dir).map_err(|e| Error::io("create table directory", e))?;
        let manifest = TableManifest {
            schema,
            index,
            created_at: Utc::now(),
        };
        write_manifest(&dir, &manifest)?;
        let table = match self.open_table(&dir) {
            Ok(table) => table,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!(target: "tessera::db", error = %cleanup, "Failed to remove partial table");
                }
                return Err(e);
            }
        };
        info!(
            target: "tessera::db",
            table = %manifest.schema.name,
            dimension = manifest.schema.dimension,
            metric = manifest.schema.metric.name(),
            "Created table"
        );
        tables.insert(manifest.schema.name, table);
        Ok(())
    }

    /// Check if a table exists
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Schema of a table
    pub fn describe_table(&self, name: &str) -> Result<TableSchema> {
        Ok(self.table(name)?.manifest.read().schema.clone())
    }

    /// Schema, index and segment statistics of a table
    pub fn table_info(&self, name: &str) -> Result<TableInfo> {
        let table = self.table(name)?;
        let manifest = table.manifest.read().clone();
        Ok(TableInfo {
            schema: manifest.schema,
            index: table.engine.describe_index(),
            count: table.engine.count(),
            size: table.engine.size(),
            physical_size: table.engine.physical_size(),
            segments: table.engine.segments(),
            corrupted: table.engine.corrupted_segments(),
            created_at: manifest.created_at,
        })
    }

    /// Names of all tables, sorted
    pub fn show_tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Live vectors in a table
    pub fn count_table(&self, name: &str) -> Result<usize> {
        Ok(self.table(name)?.engine.count())
    }

    /// Drop a table with every segment and file it owns
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| Error::TableNotFound {
                name: name.to_string(),
            })?;
        self.scheduler.cancel_table(name);
        table.engine.drop_all()?;
        match fs::remove_dir_all(&table.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("remove table directory", e)),
        }
        info!(target: "tessera::db", table = name, "Dropped table");
        Ok(())
    }

    /// Insert vectors; `ids` empty assigns them. Returns the stored ids.
    pub fn insert(&self, name: &str, vectors: Vec<Vec<f32>>, ids: &[u64]) -> Result<Vec<VectorId>> {
        let table = self.table(name)?;
        let assigned = table.engine.add_with_ids(vectors, ids)?;
        if self.config.auto_build {
            self.schedule_build(&table);
        }
        Ok(assigned)
    }

    fn schedule_build(&self, table: &Arc<Table>) {
        if !table.engine.has_pending_build() {
            return;
        }
        let engine = Arc::clone(&table.engine);
        let submitted = self
            .scheduler
            .submit(table.engine.name(), TaskKind::Build, move |cancel| {
                engine.build_sealed(cancel).map(|_| ())
            });
        if let Err(e) = submitted {
            // The next insert or open retries.
            warn!(
                target: "tessera::db",
                table = table.engine.name(),
                error = %e,
                "Could not queue segment build"
            );
        }
    }

    /// Top-`top_k` neighbors per query.
    ///
    /// `ranges` restricts results to ids in any of the ranges (empty means
    /// all ids). `nprobe: None` uses the configured default.
    pub fn search(
        &self,
        name: &str,
        queries: &[Vec<f32>],
        ranges: &[IdRange],
        top_k: usize,
        nprobe: Option<usize>,
    ) -> Result<Vec<Vec<Neighbor>>> {
        let params = match nprobe {
            Some(0) => return Err(Error::invalid_input("nprobe must be > 0")),
            Some(nprobe) => SearchParams { nprobe },
            None => self.config.search_params(),
        };
        self.table(name)?
            .engine
            .search(queries, top_k, &params, ranges)
    }

    fn resolve_index(&self, table: &Table, param: IndexParam) -> Result<IndexDescriptor> {
        let schema = table.manifest.read().schema.clone();
        IndexDescriptor::new(
            param.backend,
            schema.dimension,
            schema.metric,
            param.nlist.unwrap_or(self.config.default_nlist),
        )
    }

    /// Rebuild every segment of a table to `param` and wait for it
    pub fn create_index(&self, name: &str, param: IndexParam) -> Result<()> {
        let table = self.table(name)?;
        let index = self.resolve_index(&table, param)?;
        table.engine.set_descriptor(index)?;
        table.persist_index(index)?;
        table.engine.build_index(None, &CancelToken::new())?;
        info!(target: "tessera::db", table = name, backend = %index.backend, "Created index");
        Ok(())
    }

    /// Queue the rebuild of `create_index` on the maintenance scheduler.
    ///
    /// Returns `None` when a queued index build of the table will pick up
    /// the new descriptor.
    pub fn create_index_in_background(
        &self,
        name: &str,
        param: IndexParam,
    ) -> Result<Option<TaskHandle>> {
        let table = self.table(name)?;
        let index = self.resolve_index(&table, param)?;
        let previous = table.engine.describe_index();
        table.engine.set_descriptor(index)?;
        table.persist_index(index)?;
        Ok(self
            .scheduler
            .submit(name, TaskKind::CreateIndex, move |cancel| {
                match table.engine.build_index(None, cancel) {
                    Err(Error::Cancelled) => {
                        table.restore_index(previous);
                        Err(Error::Cancelled)
                    }
                    other => other.map(|_| ()),
                }
            })?)
    }

    /// Current index descriptor of a table
    pub fn describe_index(&self, name: &str) -> Result<IndexDescriptor> {
        Ok(self.table(name)?.engine.describe_index())
    }

    /// Reset a table to the exhaustive index
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let table = self.table(name)?;
        table.engine.drop_index(&CancelToken::new())?;
        table.persist_index(table.engine.describe_index())?;
        info!(target: "tessera::db", table = name, "Dropped index");
        Ok(())
    }

    /// Load every persisted segment of a table into the cache.
    ///
    /// Going over the cache's soft limit is not an error: everything that
    /// was loaded stays loaded and the report carries `pressure`.
    pub fn preload_table(&self, name: &str) -> Result<PreloadReport> {
        self.table(name)?.engine.preload()
    }

    /// Delete ids in `range`; returns how many live vectors were removed
    pub fn delete_by_range(&self, name: &str, range: IdRange) -> Result<usize> {
        self.table(name)?.engine.delete_by_range(range)
    }

    /// Merge small persisted segments of a table
    pub fn compact_table(&self, name: &str) -> Result<Option<SegmentLocation>> {
        self.table(name)?.engine.compact(&CancelToken::new())
    }

    /// Queue `compact_table` on the maintenance scheduler
    pub fn compact_table_in_background(&self, name: &str) -> Result<Option<TaskHandle>> {
        let engine = self.engine(name)?;
        Ok(self
            .scheduler
            .submit(name, TaskKind::Compact, move |cancel| {
                engine.compact(cancel).map(|_| ())
            })?)
    }

    /// Block until queued maintenance work has finished
    pub fn wait_for_maintenance(&self) {
        self.scheduler.drain();
    }

    /// Database-wide snapshot
    pub fn status(&self) -> DatabaseStatus {
        let tables = self.tables.read();
        DatabaseStatus {
            data_dir: self.dir.clone(),
            tables: tables.len(),
            vectors: tables.values().map(|t| t.engine.count()).sum(),
            cache: self.cache.stats(),
            scheduler: self.scheduler.stats(),
            started_at: self.started_at,
        }
    }
}

fn read_manifest(dir: &Path) -> Result<TableManifest> {
    let path = dir.join(SCHEMA_FILE);
    let bytes = fs::read(&path)
        .map_err(|e| Error::io(format!("read table schema '{}'", path.display()), e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Serialization {
        message: format!("table schema '{}': {}", path.display(), e),
    })
}

fn write_manifest(dir: &Path, manifest: &TableManifest) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest).map_err(|e| Error::Serialization {
        message: format!("table schema: {}", e),
    })?;
    let temp = dir.join(format!("{}.tmp", SCHEMA_FILE));
    let write = || -> io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp, dir.join(SCHEMA_FILE))
    };
    write().map_err(|e| Error::io("write table schema", e))
}
