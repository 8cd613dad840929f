//! Segment metadata blob
//!
//! One `segment.meta` file per committed segment location. It describes the
//! backend payload files and carries the tombstone set, so tombstones survive
//! restarts until the next build/merge physically drops them.
//!
//! # Binary Format
//!
//! ```text
//! magic("TSEG", 4) + version(u32 LE) + body_len(u32 LE) + body(MessagePack) + crc32(u32 LE)
//! ```
//!
//! The CRC covers everything before it. Any mismatch is reported as
//! `CorruptedSegment`; the file is never repaired in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tessera_core::{Error, IndexDescriptor, Result, SegmentLocation, VectorId};

/// Magic bytes for segment metadata files.
pub const SEGMENT_META_MAGIC: &[u8; 4] = b"TSEG";

/// Current format version for segment metadata.
pub const SEGMENT_META_VERSION: u32 = 1;

/// Fixed bytes around the body: magic + version + body_len + crc
const FRAME_OVERHEAD: usize = 4 + 4 + 4 + 4;

/// One backend payload file belonging to a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadEntry {
    /// File name inside the segment directory
    pub file: String,
    /// Exact byte length
    pub len: u64,
    /// CRC32 of the file contents
    pub crc32: u32,
}

/// Metadata describing one committed segment version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Location this blob belongs to
    pub location: SegmentLocation,
    /// How the payload was built
    pub descriptor: IndexDescriptor,
    /// Records physically present in the payload (tombstoned included)
    pub count: u64,
    /// Smallest id in the payload
    pub min_id: Option<VectorId>,
    /// Largest id in the payload
    pub max_id: Option<VectorId>,
    /// Logically deleted ids, all present in the payload
    pub tombstones: BTreeSet<VectorId>,
    /// Commit time of this version
    pub created_at: DateTime<Utc>,
    /// Locations this version replaced (merge sources or pre-rebuild version)
    #[serde(default)]
    pub supersedes: Vec<SegmentLocation>,
    /// Backend payload files, filled in by `SegmentStore::commit`
    #[serde(default)]
    pub payloads: Vec<PayloadEntry>,
}

impl SegmentMeta {
    /// Metadata for a new version; payload entries are added at commit time
    pub fn new(
        location: SegmentLocation,
        descriptor: IndexDescriptor,
        count: u64,
        min_id: Option<VectorId>,
        max_id: Option<VectorId>,
    ) -> Self {
        SegmentMeta {
            location,
            descriptor,
            count,
            min_id,
            max_id,
            tombstones: BTreeSet::new(),
            created_at: Utc::now(),
            supersedes: Vec::new(),
            payloads: Vec::new(),
        }
    }

    /// Live (non-tombstoned) records
    pub fn live_count(&self) -> u64 {
        self.count.saturating_sub(self.tombstones.len() as u64)
    }

    /// Total payload bytes on disk
    pub fn payload_bytes(&self) -> u64 {
        self.payloads.iter().map(|p| p.len).sum()
    }

    /// Serialize to the framed binary format with CRC.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec_named(self)?;

        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + body.len());
        buf.extend_from_slice(SEGMENT_META_MAGIC);
        buf.extend_from_slice(&SEGMENT_META_VERSION.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Deserialize from bytes, validating magic, version, length and CRC.
    ///
    /// `location` is only used for error reporting.
    pub fn from_bytes(location: &SegmentLocation, data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_OVERHEAD {
            return Err(Error::corrupted(
                location,
                format!("metadata too short: {} bytes", data.len()),
            ));
        }
        if &data[0..4] != SEGMENT_META_MAGIC {
            return Err(Error::corrupted(location, "invalid metadata magic"));
        }
        let version = read_u32(&data[4..8]);
        if version != SEGMENT_META_VERSION {
            return Err(Error::corrupted(
                location,
                format!("unsupported metadata version: {}", version),
            ));
        }
        let body_len = read_u32(&data[8..12]) as usize;
        let crc_offset = 12 + body_len;
        if data.len() != crc_offset + 4 {
            return Err(Error::corrupted(
                location,
                format!(
                    "metadata length mismatch: body {} bytes, file {} bytes",
                    body_len,
                    data.len()
                ),
            ));
        }

        let stored_crc = read_u32(&data[crc_offset..]);
        let computed_crc = crc32fast::hash(&data[..crc_offset]);
        if stored_crc != computed_crc {
            return Err(Error::corrupted(
                location,
                format!(
                    "metadata checksum mismatch: stored {:08x}, computed {:08x}",
                    stored_crc, computed_crc
                ),
            ));
        }

        let meta: SegmentMeta = rmp_serde::from_slice(&data[12..crc_offset])
            .map_err(|e| Error::corrupted(location, format!("metadata decode: {}", e)))?;
        if &meta.location != location {
            return Err(Error::corrupted(
                location,
                format!("metadata names location {}", meta.location),
            ));
        }
        Ok(meta)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}
