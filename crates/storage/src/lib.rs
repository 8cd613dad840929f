//! Durable storage for Tessera segments
//!
//! This crate provides:
//! - SegmentStore: location -> metadata blob + payload blobs, atomic commit,
//!   idempotent delete
//! - SegmentMeta: CRC-protected metadata blob format
//! - AppendLog: per-segment log of raw inserts and tombstones

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod log;
pub mod meta;
pub mod store;

pub use log::{AppendLog, DurabilityMode, LogEntry, LogReplay};
pub use meta::{PayloadEntry, SegmentMeta, SEGMENT_META_MAGIC, SEGMENT_META_VERSION};
pub use store::{SegmentStore, SEGMENT_META_FILE};
