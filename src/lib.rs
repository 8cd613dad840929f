//! Tessera - segment storage and indexing core for a vector database
//!
//! Tables hold fixed-dimension `f32` vectors keyed by 64-bit ids. Each table
//! is split into segments: an append-only raw segment takes inserts, sealed
//! segments are indexed (exhaustive Flat or clustered IVF-Flat) and
//! persisted, and small segments are merged in the background.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{Database, DistanceMetric, IndexParam, TableSchema};
//!
//! let db = Database::open("./data")?;
//! db.create_table(TableSchema::new("docs", 128, DistanceMetric::L2))?;
//! let ids = db.insert("docs", vectors, &[])?;
//! db.create_index("docs", IndexParam::ivf_flat(64))?;
//! let hits = db.search("docs", &queries, &[], 10, None)?;
//! ```
//!
//! [`Session`] wraps a shared [`Database`] with a connect / disconnect
//! lifecycle. [`EngineCore`] is the per-table segment engine for callers
//! that manage their own storage directories.

pub use tessera_core::{
    BackendKind, DistanceMetric, Error, IdRange, IndexDescriptor, Neighbor, Result, SearchParams,
    SegmentLocation, SegmentState, VectorId, VectorRecord,
};
pub use tessera_engine::{
    CacheOutcome, CancelToken, Database, DatabaseStatus, EngineConfig, EngineCore, EngineOptions,
    IndexParam, PreloadReport, SegmentInfo, Session, TableInfo, TableSchema, TaskEntry, TaskHandle,
    TaskKind, TaskState, TaskTableDump,
};
pub use tessera_storage::DurabilityMode;
