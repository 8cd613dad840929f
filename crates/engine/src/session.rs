//! In-process call surface
//!
//! A `Session` is a handle on a shared `Database` with an explicit
//! connect/disconnect lifecycle. Every call on a disconnected session fails
//! with `NotConnected`; the database itself is unaffected.

use crate::background::{TaskHandle, TaskTableDump};
use crate::database::{Database, DatabaseStatus, IndexParam, TableInfo, TableSchema};
use crate::engine::PreloadReport;
use std::path::Path;
use std::sync::Arc;
use tessera_core::{Error, IdRange, IndexDescriptor, Neighbor, Result, SegmentLocation, VectorId};
use tracing::debug;

/// Connection to a `Database`
#[derive(Default)]
pub struct Session {
    db: Option<Arc<Database>>,
}

impl Session {
    /// Disconnected session
    pub fn new() -> Self {
        Session::default()
    }

    /// Open the database in `dir` and connect to it
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let mut session = Session::new();
        session.connect(Database::open(dir)?)?;
        Ok(session)
    }

    /// Attach to `db`; fails if already connected
    pub fn connect(&mut self, db: Arc<Database>) -> Result<()> {
        if self.db.is_some() {
            return Err(Error::invalid_input("session is already connected"));
        }
        debug!(target: "tessera::session", path = %db.data_dir().display(), "Connected");
        self.db = Some(db);
        Ok(())
    }

    /// Check if the session is attached
    pub fn is_connected(&self) -> bool {
        self.db.is_some()
    }

    /// Detach from the database
    pub fn disconnect(&mut self) -> Result<()> {
        match self.db.take() {
            Some(db) => {
                debug!(target: "tessera::session", path = %db.data_dir().display(), "Disconnected");
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    fn db(&self) -> Result<&Database> {
        self.db.as_deref().ok_or(Error::NotConnected)
    }

    /// Version of this client library; needs no connection
    pub fn client_version(&self) -> String {
        version_string()
    }

    /// Engine version string
    pub fn server_version(&self) -> Result<String> {
        self.db()?;
        Ok(version_string())
    }

    /// Queued and running maintenance tasks with scheduler counters
    pub fn dump_task_tables(&self) -> Result<TaskTableDump> {
        let dump = self.db()?.scheduler().dump();
        debug!(
            target: "tessera::session",
            tasks = dump.tasks.len(),
            queue_depth = dump.stats.queue_depth,
            "Dumped task tables"
        );
        Ok(dump)
    }

    /// Database-wide status
    pub fn server_status(&self) -> Result<DatabaseStatus> {
        Ok(self.db()?.status())
    }

    /// See [`Database::create_table`]
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.db()?.create_table(schema)
    }

    /// See [`Database::has_table`]
    pub fn has_table(&self, name: &str) -> Result<bool> {
        Ok(self.db()?.has_table(name))
    }

    /// See [`Database::describe_table`]
    pub fn describe_table(&self, name: &str) -> Result<TableSchema> {
        self.db()?.describe_table(name)
    }

    /// See [`Database::table_info`]
    pub fn table_info(&self, name: &str) -> Result<TableInfo> {
        self.db()?.table_info(name)
    }

    /// See [`Database::drop_table`]
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.db()?.drop_table(name)
    }

    /// See [`Database::show_tables`]
    pub fn show_tables(&self) -> Result<Vec<String>> {
        Ok(self.db()?.show_tables())
    }

    /// See [`Database::count_table`]
    pub fn count_table(&self, name: &str) -> Result<usize> {
        self.db()?.count_table(name)
    }

    /// See [`Database::insert`]
    pub fn insert(&self, name: &str, vectors: Vec<Vec<f32>>, ids: &[u64]) -> Result<Vec<VectorId>> {
        self.db()?.insert(name, vectors, ids)
    }

    /// See [`Database::search`]
    pub fn search(
        &self,
        name: &str,
        queries: &[Vec<f32>],
        ranges: &[IdRange],
        top_k: usize,
        nprobe: Option<usize>,
    ) -> Result<Vec<Vec<Neighbor>>> {
        self.db()?.search(name, queries, ranges, top_k, nprobe)
    }

    /// See [`Database::create_index`]
    pub fn create_index(&self, name: &str, param: IndexParam) -> Result<()> {
        self.db()?.create_index(name, param)
    }

    /// See [`Database::create_index_in_background`]
    pub fn create_index_in_background(
        &self,
        name: &str,
        param: IndexParam,
    ) -> Result<Option<TaskHandle>> {
        self.db()?.create_index_in_background(name, param)
    }

    /// See [`Database::describe_index`]
    pub fn describe_index(&self, name: &str) -> Result<IndexDescriptor> {
        self.db()?.describe_index(name)
    }

    /// See [`Database::drop_index`]
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.db()?.drop_index(name)
    }

    /// See [`Database::preload_table`]
    pub fn preload_table(&self, name: &str) -> Result<PreloadReport> {
        self.db()?.preload_table(name)
    }

    /// See [`Database::delete_by_range`]
    pub fn delete_by_range(&self, name: &str, range: IdRange) -> Result<usize> {
        self.db()?.delete_by_range(name, range)
    }

    /// See [`Database::compact_table`]
    pub fn compact_table(&self, name: &str) -> Result<Option<SegmentLocation>> {
        self.db()?.compact_table(name)
    }
}

fn version_string() -> String {
    format!("tessera {}", env!("CARGO_PKG_VERSION"))
}
