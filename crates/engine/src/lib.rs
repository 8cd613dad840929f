//! Segment engine for Tessera
//!
//! This crate orchestrates the lower layers:
//! - Backends: Flat and IVF-Flat k-NN indexes behind `IndexBackend`
//! - Segment: raw / built / persisted versions of one shard of a table
//! - SegmentCache: byte-bounded LRU of loaded backends
//! - EngineCore: per-table segment set, search fan-out, build, merge
//! - Database / Session: table registry and the in-process call surface
//! - Background maintenance (auto builds, compaction)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod backend;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod database;
pub mod distance;
pub mod engine;
pub mod raw;
pub mod segment;
pub mod session;

pub use background::{
    BackpressureError, MaintenanceScheduler, SchedulerStats, TaskEntry, TaskHandle, TaskKind,
    TaskPriority, TaskState, TaskTableDump,
};
pub use backend::{BackendError, IndexBackend, IndexBackendFactory};
pub use cache::{CacheStats, SegmentCache};
pub use cancel::CancelToken;
pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use database::{
    validate_table_name, Database, DatabaseStatus, IndexParam, TableInfo, TableSchema,
};
pub use engine::{CacheOutcome, EngineCore, EngineOptions, PreloadReport, SegmentInfo};
pub use segment::Segment;
pub use session::Session;
