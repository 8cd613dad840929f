//! Core value types shared by storage and engine
//!
//! These types describe vectors, index descriptors and segment identity.
//! Distance computation and index structures live in the engine crate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 64-bit vector identifier, unique within a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VectorId(pub u64);

impl VectorId {
    /// Create a new VectorId
    pub fn new(id: u64) -> Self {
        VectorId(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for VectorId {
    fn from(id: u64) -> Self {
        VectorId(id)
    }
}

/// A single stored vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Identifier
    pub id: VectorId,
    /// Embedding, length == descriptor dimension
    pub vector: Vec<f32>,
}

impl VectorRecord {
    /// Create a record
    pub fn new(id: impl Into<VectorId>, vector: Vec<f32>) -> Self {
        VectorRecord {
            id: id.into(),
            vector,
        }
    }
}

/// Distance metric
///
/// L2 ranks ascending (smaller is closer); InnerProduct ranks descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Squared Euclidean distance
    #[default]
    L2,
    /// Raw dot product (higher = more similar)
    InnerProduct,
}

impl DistanceMetric {
    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::InnerProduct => "inner_product",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "l2" | "euclidean" => Some(DistanceMetric::L2),
            "ip" | "inner_product" | "dot" => Some(DistanceMetric::InnerProduct),
            _ => None,
        }
    }

    /// Serialization value for metadata blobs
    pub fn to_byte(&self) -> u8 {
        match self {
            DistanceMetric::L2 => 1,
            DistanceMetric::InnerProduct => 2,
        }
    }

    /// Deserialization from metadata blobs
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(DistanceMetric::L2),
            2 => Some(DistanceMetric::InnerProduct),
            _ => None,
        }
    }

    /// Order two distances so that the better match sorts first.
    ///
    /// Uses `f32::total_cmp`, so NaN distances sort last under L2.
    pub fn compare(&self, a: f32, b: f32) -> Ordering {
        let ord = a.total_cmp(&b);
        match self {
            DistanceMetric::L2 => ord,
            DistanceMetric::InnerProduct => ord.reverse(),
        }
    }
}

/// Backend variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Exhaustive scan over a contiguous matrix
    #[default]
    Flat,
    /// Inverted file over k-means clusters, full vectors per list
    IvfFlat,
}

impl BackendKind {
    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Flat => "flat",
            BackendKind::IvfFlat => "ivf_flat",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "flat" | "idmap" => Some(BackendKind::Flat),
            "ivf" | "ivf_flat" | "ivfflat" => Some(BackendKind::IvfFlat),
            _ => None,
        }
    }

    /// Serialization value for metadata blobs
    pub fn to_byte(&self) -> u8 {
        match self {
            BackendKind::Flat => 1,
            BackendKind::IvfFlat => 2,
        }
    }

    /// Deserialization from metadata blobs
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(BackendKind::Flat),
            2 => Some(BackendKind::IvfFlat),
            _ => None,
        }
    }

    /// Whether built structures of this kind can be combined without a rebuild
    pub fn supports_structural_merge(&self) -> bool {
        matches!(self, BackendKind::Flat)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Default IVF cluster count
pub const DEFAULT_NLIST: usize = 64;

/// Index descriptor - immutable once a segment is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Backend variant
    pub backend: BackendKind,
    /// Vector dimension (> 0)
    pub dimension: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Cluster count for clustered backends; ignored by Flat
    pub nlist: usize,
}

impl IndexDescriptor {
    /// Create a validated descriptor
    pub fn new(
        backend: BackendKind,
        dimension: usize,
        metric: DistanceMetric,
        nlist: usize,
    ) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::invalid_input(format!(
                "Invalid dimension: {} (must be > 0)",
                dimension
            )));
        }
        if nlist == 0 {
            return Err(Error::invalid_input("nlist must be > 0"));
        }
        Ok(IndexDescriptor {
            backend,
            dimension,
            metric,
            nlist,
        })
    }

    /// Exhaustive descriptor for a raw segment
    pub fn flat(dimension: usize, metric: DistanceMetric) -> Self {
        IndexDescriptor {
            backend: BackendKind::Flat,
            dimension,
            metric,
            nlist: DEFAULT_NLIST,
        }
    }

    /// Same dimension and metric, different backend parameters
    pub fn with_backend(&self, backend: BackendKind, nlist: usize) -> Self {
        IndexDescriptor {
            backend,
            nlist,
            ..*self
        }
    }

    /// Two descriptors describe vectors that can live in the same segment
    pub fn is_compatible(&self, other: &IndexDescriptor) -> bool {
        self.dimension == other.dimension && self.metric == other.metric
    }

    /// Per-record nominal footprint: id + f32 payload
    pub fn record_bytes(&self) -> usize {
        std::mem::size_of::<u64>() + self.dimension * std::mem::size_of::<f32>()
    }
}

/// Backend query parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Number of inverted lists probed by clustered backends
    pub nprobe: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams { nprobe: 8 }
    }
}

/// Inclusive id range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    /// First id in the range
    pub start: VectorId,
    /// Last id in the range
    pub end: VectorId,
}

impl IdRange {
    /// Create a range; `start > end` yields an empty range
    pub fn new(start: u64, end: u64) -> Self {
        IdRange {
            start: VectorId(start),
            end: VectorId(end),
        }
    }

    /// Check membership
    pub fn contains(&self, id: VectorId) -> bool {
        self.start <= id && id <= self.end
    }

    /// Check if no id can fall inside
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Whether `[min, max]` intersects this range
    pub fn overlaps(&self, min: VectorId, max: VectorId) -> bool {
        !self.is_empty() && self.start <= max && min <= self.end
    }
}

/// One ranked search hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Matched id
    pub id: VectorId,
    /// Metric distance (squared L2 or inner product)
    pub distance: f32,
}

impl Neighbor {
    /// Create a hit
    pub fn new(id: VectorId, distance: f32) -> Self {
        Neighbor { id, distance }
    }
}

/// Sort hits best-first with lower-id tie-break
pub fn rank_neighbors(metric: DistanceMetric, hits: &mut [Neighbor]) {
    hits.sort_by(|a, b| {
        metric
            .compare(a.distance, b.distance)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Opaque persistent key of a segment version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentLocation(String);

impl SegmentLocation {
    /// Wrap an existing key
    pub fn new(key: impl Into<String>) -> Self {
        SegmentLocation(key.into())
    }

    /// Fresh unique location
    pub fn generate() -> Self {
        SegmentLocation(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Key as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a segment version
///
/// `Raw -> Built -> Persisted -> Resident`, merged-away versions become
/// `Stale`, explicit drop is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    /// Raw append buffer only
    Raw,
    /// Backend built in memory, not yet persisted
    Built,
    /// Committed to the segment store
    Persisted,
    /// Persisted and loaded into the cache
    Resident,
    /// Replaced by a merge/rebuild; deleted once unreferenced
    Stale,
    /// Explicitly dropped
    Dropped,
}

impl SegmentState {
    /// Encoding for atomic state cells
    pub fn to_byte(&self) -> u8 {
        match self {
            SegmentState::Raw => 0,
            SegmentState::Built => 1,
            SegmentState::Persisted => 2,
            SegmentState::Resident => 3,
            SegmentState::Stale => 4,
            SegmentState::Dropped => 5,
        }
    }

    /// Decoding for atomic state cells
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SegmentState::Raw),
            1 => Some(SegmentState::Built),
            2 => Some(SegmentState::Persisted),
            3 => Some(SegmentState::Resident),
            4 => Some(SegmentState::Stale),
            5 => Some(SegmentState::Dropped),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_roundtrip() {
        for m in [DistanceMetric::L2, DistanceMetric::InnerProduct] {
            assert_eq!(DistanceMetric::from_byte(m.to_byte()), Some(m));
            assert_eq!(DistanceMetric::parse(m.name()), Some(m));
        }
        assert_eq!(DistanceMetric::from_byte(0), None);
        assert_eq!(DistanceMetric::parse("IP"), Some(DistanceMetric::InnerProduct));
    }

    #[test]
    fn test_metric_compare_direction() {
        assert_eq!(DistanceMetric::L2.compare(1.0, 2.0), Ordering::Less);
        assert_eq!(
            DistanceMetric::InnerProduct.compare(1.0, 2.0),
            Ordering::Greater
        );
        assert_eq!(DistanceMetric::L2.compare(f32::NAN, 1.0), Ordering::Equal);
    }

    #[test]
    fn test_backend_kind_roundtrip() {
        for k in [BackendKind::Flat, BackendKind::IvfFlat] {
            assert_eq!(BackendKind::from_byte(k.to_byte()), Some(k));
            assert_eq!(BackendKind::parse(k.name()), Some(k));
        }
        assert!(BackendKind::Flat.supports_structural_merge());
        assert!(!BackendKind::IvfFlat.supports_structural_merge());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(IndexDescriptor::new(BackendKind::Flat, 0, DistanceMetric::L2, 1).is_err());
        assert!(IndexDescriptor::new(BackendKind::IvfFlat, 4, DistanceMetric::L2, 0).is_err());
        let d = IndexDescriptor::new(BackendKind::IvfFlat, 4, DistanceMetric::L2, 8).unwrap();
        assert_eq!(d.record_bytes(), 8 + 16);
        assert!(d.is_compatible(&IndexDescriptor::flat(4, DistanceMetric::L2)));
        assert!(!d.is_compatible(&IndexDescriptor::flat(4, DistanceMetric::InnerProduct)));
    }

    #[test]
    fn test_id_range() {
        let r = IdRange::new(2, 5);
        assert!(r.contains(VectorId(2)));
        assert!(r.contains(VectorId(5)));
        assert!(!r.contains(VectorId(6)));
        assert!(r.overlaps(VectorId(5), VectorId(9)));
        assert!(!r.overlaps(VectorId(6), VectorId(9)));
        assert!(IdRange::new(5, 2).is_empty());
        assert!(!IdRange::new(5, 2).overlaps(VectorId(0), VectorId(10)));
    }

    #[test]
    fn test_rank_neighbors_tie_break() {
        let mut hits = vec![
            Neighbor::new(VectorId(3), 1.0),
            Neighbor::new(VectorId(1), 1.0),
            Neighbor::new(VectorId(2), 0.5),
        ];
        rank_neighbors(DistanceMetric::L2, &mut hits);
        let ids: Vec<u64> = hits.iter().map(|h| h.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);

        rank_neighbors(DistanceMetric::InnerProduct, &mut hits);
        let ids: Vec<u64> = hits.iter().map(|h| h.id.0).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn test_segment_state_roundtrip() {
        for s in [
            SegmentState::Raw,
            SegmentState::Built,
            SegmentState::Persisted,
            SegmentState::Resident,
            SegmentState::Stale,
            SegmentState::Dropped,
        ] {
            assert_eq!(SegmentState::from_byte(s.to_byte()), Some(s));
        }
    }

    #[test]
    fn test_generated_locations_are_unique() {
        let a = SegmentLocation::generate();
        let b = SegmentLocation::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
