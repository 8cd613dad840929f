//! Core types for Tessera
//!
//! This crate defines the foundational types used throughout the system:
//! - VectorId / VectorRecord: stored vectors
//! - DistanceMetric, BackendKind, IndexDescriptor: how a segment is indexed
//! - IdRange, Neighbor, SearchParams: query shapes
//! - SegmentLocation / SegmentState: segment identity and lifecycle
//! - Error: error hierarchy shared by storage and engine

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    rank_neighbors, BackendKind, DistanceMetric, IdRange, IndexDescriptor, Neighbor,
    SearchParams, SegmentLocation, SegmentState, VectorId, VectorRecord, DEFAULT_NLIST,
};
