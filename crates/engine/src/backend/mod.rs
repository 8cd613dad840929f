//! Index backends
//!
//! A backend owns the vectors of one built segment and answers k-NN queries
//! over them. Backends are immutable once built: inserts go to the raw
//! buffer of the active segment and tombstones live in the segment, so a
//! backend only needs an `accept` predicate at query time.
//!
//! Variants are selected through [`IndexBackendFactory`]:
//! - Flat: exhaustive scan over a contiguous matrix
//! - IvfFlat: k-means inverted lists, probing `nprobe` lists per query

mod codec;
pub mod flat;
pub mod ivf;

pub use flat::FlatBackend;
pub use ivf::IvfFlatBackend;

use crate::cancel::CancelToken;
use std::any::Any;
use std::collections::HashSet;
use tessera_core::{
    rank_neighbors, BackendKind, DistanceMetric, Error, IndexDescriptor, Neighbor,
    SearchParams, SegmentLocation, VectorId, VectorRecord,
};
use thiserror::Error;

/// Errors raised inside a backend.
///
/// Converted to the crate-wide [`Error`] at the engine boundary.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The variant cannot perform the operation
    #[error("{backend} backend does not support {operation}")]
    Unsupported {
        /// Backend variant
        backend: BackendKind,
        /// Operation name
        operation: &'static str,
    },

    /// Input vector has the wrong dimension
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Descriptor dimension
        expected: usize,
        /// Actual length
        got: usize,
    },

    /// The same id appeared twice in build or merge input
    #[error("duplicate id {0} in backend input")]
    DuplicateId(VectorId),

    /// Payload bytes could not be decoded
    #[error("malformed {backend} payload: {reason}")]
    Malformed {
        /// Backend variant
        backend: BackendKind,
        /// What was wrong
        reason: String,
    },

    /// Cancellation was observed between units of work
    #[error("backend build cancelled")]
    Cancelled,
}

impl BackendError {
    pub(crate) fn malformed(backend: BackendKind, reason: impl Into<String>) -> Self {
        BackendError::Malformed {
            backend,
            reason: reason.into(),
        }
    }

    /// Map a failure while decoding the payload of `location`.
    ///
    /// Anything wrong with stored bytes is a corrupted segment.
    pub fn into_load_error(self, location: &SegmentLocation) -> Error {
        match self {
            BackendError::Malformed { .. }
            | BackendError::DimensionMismatch { .. }
            | BackendError::DuplicateId(_) => Error::corrupted(location, self.to_string()),
            other => other.into(),
        }
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unsupported { backend, operation } => {
                Error::BackendUnsupportedOperation { backend, operation }
            }
            BackendError::DimensionMismatch { expected, got } => {
                Error::DimensionMismatch { expected, got }
            }
            BackendError::DuplicateId(id) => Error::DuplicateId { id },
            BackendError::Malformed { .. } => Error::Serialization {
                message: e.to_string(),
            },
            BackendError::Cancelled => Error::Cancelled,
        }
    }
}

/// Trait for swappable index implementations.
///
/// All distances follow [`DistanceMetric`] conventions. Results are ranked
/// best-first with ties broken by lower id.
pub trait IndexBackend: Send + Sync {
    /// Descriptor the backend was built with
    fn descriptor(&self) -> &IndexDescriptor;

    /// Backend variant
    fn kind(&self) -> BackendKind {
        self.descriptor().backend
    }

    /// Number of stored vectors (tombstoned ones included)
    fn len(&self) -> usize;

    /// Check if empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if an id is stored
    fn contains(&self, id: VectorId) -> bool;

    /// All stored ids in ascending order
    fn ids(&self) -> Vec<VectorId>;

    /// Smallest and largest stored id
    fn id_bounds(&self) -> Option<(VectorId, VectorId)> {
        let ids = self.ids();
        Some((*ids.first()?, *ids.last()?))
    }

    /// Top-`k` neighbors of `query` among ids for which `accept` holds.
    ///
    /// Returns fewer than `k` hits only when fewer accepted ids exist.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
        accept: &dyn Fn(VectorId) -> bool,
    ) -> Vec<Neighbor>;

    /// Every stored record in ascending id order
    fn records(&self) -> Vec<VectorRecord>;

    /// Serialize to the payload format of this variant
    fn encode(&self) -> Vec<u8>;

    /// Exact byte length of `encode()`
    fn physical_size(&self) -> usize;

    /// Combine with same-variant backends without retraining.
    ///
    /// Ids for which `dropped` holds are left out of the result.
    fn merge_with(
        &self,
        _others: &[&dyn IndexBackend],
        _dropped: &dyn Fn(VectorId) -> bool,
    ) -> Result<Box<dyn IndexBackend>, BackendError> {
        Err(BackendError::Unsupported {
            backend: self.kind(),
            operation: "structural merge",
        })
    }

    /// Downcast support for structural merge
    fn as_any(&self) -> &dyn Any;
}

/// Factory for creating index backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackendFactory {
    /// Exhaustive scan
    Flat,
    /// Inverted lists over k-means centroids
    IvfFlat,
}

impl IndexBackendFactory {
    /// Factory for a backend variant
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Flat => IndexBackendFactory::Flat,
            BackendKind::IvfFlat => IndexBackendFactory::IvfFlat,
        }
    }

    /// Variant produced by this factory
    pub fn kind(&self) -> BackendKind {
        match self {
            IndexBackendFactory::Flat => BackendKind::Flat,
            IndexBackendFactory::IvfFlat => BackendKind::IvfFlat,
        }
    }

    /// Build a backend from records (any order, unique ids)
    pub fn build(
        &self,
        descriptor: &IndexDescriptor,
        records: Vec<VectorRecord>,
        cancel: &CancelToken,
    ) -> Result<Box<dyn IndexBackend>, BackendError> {
        let descriptor = descriptor.with_backend(self.kind(), descriptor.nlist);
        Ok(match self {
            IndexBackendFactory::Flat => {
                Box::new(FlatBackend::build(descriptor, records, cancel)?)
            }
            IndexBackendFactory::IvfFlat => {
                Box::new(IvfFlatBackend::build(descriptor, records, cancel)?)
            }
        })
    }

    /// Decode a payload previously produced by `encode`
    pub fn load(
        &self,
        descriptor: &IndexDescriptor,
        bytes: &[u8],
    ) -> Result<Box<dyn IndexBackend>, BackendError> {
        let descriptor = descriptor.with_backend(self.kind(), descriptor.nlist);
        Ok(match self {
            IndexBackendFactory::Flat => Box::new(FlatBackend::decode(descriptor, bytes)?),
            IndexBackendFactory::IvfFlat => Box::new(IvfFlatBackend::decode(descriptor, bytes)?),
        })
    }
}

/// Validate build input and sort it by id
pub(crate) fn prepare_records(
    descriptor: &IndexDescriptor,
    mut records: Vec<VectorRecord>,
) -> Result<Vec<VectorRecord>, BackendError> {
    for record in &records {
        if record.vector.len() != descriptor.dimension {
            return Err(BackendError::DimensionMismatch {
                expected: descriptor.dimension,
                got: record.vector.len(),
            });
        }
    }
    records.sort_by_key(|r| r.id);
    if let Some(pair) = records.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(BackendError::DuplicateId(pair[0].id));
    }
    Ok(records)
}

/// Keep the best `k` hits, ranked
pub(crate) fn select_top_k(metric: DistanceMetric, mut hits: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    if k == 0 {
        return Vec::new();
    }
    if hits.len() > k {
        hits.select_nth_unstable_by(k - 1, |a, b| {
            metric
                .compare(a.distance, b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
    }
    rank_neighbors(metric, &mut hits);
    hits
}

/// Merge per-source result lists into one ranked top-`k`.
///
/// When the same id shows up twice the better hit wins.
pub fn merge_neighbors(
    metric: DistanceMetric,
    lists: impl IntoIterator<Item = Vec<Neighbor>>,
    k: usize,
) -> Vec<Neighbor> {
    let mut all: Vec<Neighbor> = lists.into_iter().flatten().collect();
    rank_neighbors(metric, &mut all);
    let mut seen = HashSet::with_capacity(all.len());
    all.retain(|n| seen.insert(n.id));
    all.truncate(k);
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::DistanceMetric;

    fn desc() -> IndexDescriptor {
        IndexDescriptor::flat(2, DistanceMetric::L2)
    }

    #[test]
    fn test_prepare_records_sorts_and_rejects_duplicates() {
        let sorted = prepare_records(
            &desc(),
            vec![
                VectorRecord::new(3u64, vec![0.0, 0.0]),
                VectorRecord::new(1u64, vec![0.0, 0.0]),
            ],
        )
        .unwrap();
        assert_eq!(sorted[0].id, VectorId(1));

        let dup = prepare_records(
            &desc(),
            vec![
                VectorRecord::new(1u64, vec![0.0, 0.0]),
                VectorRecord::new(1u64, vec![1.0, 0.0]),
            ],
        );
        assert!(matches!(dup, Err(BackendError::DuplicateId(VectorId(1)))));
    }

    #[test]
    fn test_prepare_records_rejects_wrong_dimension() {
        let err = prepare_records(&desc(), vec![VectorRecord::new(1u64, vec![0.0])]).unwrap_err();
        assert!(matches!(
            err,
            BackendError::DimensionMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_select_top_k_tie_breaks_by_id() {
        let hits = vec![
            Neighbor::new(VectorId(5), 1.0),
            Neighbor::new(VectorId(2), 1.0),
            Neighbor::new(VectorId(9), 0.5),
        ];
        let top = select_top_k(DistanceMetric::L2, hits, 2);
        assert_eq!(top[0].id, VectorId(9));
        assert_eq!(top[1].id, VectorId(2));
    }

    #[test]
    fn test_merge_neighbors_dedups_and_ranks() {
        let a = vec![Neighbor::new(VectorId(1), 3.0), Neighbor::new(VectorId(2), 1.0)];
        let b = vec![Neighbor::new(VectorId(1), 0.5)];
        let merged = merge_neighbors(DistanceMetric::L2, vec![a, b], 5);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], Neighbor::new(VectorId(1), 0.5));
    }

    #[test]
    fn test_inner_product_ranks_descending() {
        let a = vec![Neighbor::new(VectorId(1), 0.1), Neighbor::new(VectorId(2), 0.9)];
        let merged = merge_neighbors(DistanceMetric::InnerProduct, vec![a], 1);
        assert_eq!(merged[0].id, VectorId(2));
    }

    #[test]
    fn test_backend_error_conversion() {
        let e: Error = BackendError::Unsupported {
            backend: BackendKind::IvfFlat,
            operation: "structural merge",
        }
        .into();
        assert!(matches!(e, Error::BackendUnsupportedOperation { .. }));

        let loc = SegmentLocation::new("x");
        let e = BackendError::malformed(BackendKind::Flat, "short").into_load_error(&loc);
        assert!(matches!(e, Error::CorruptedSegment { .. }));
        let e = BackendError::Cancelled.into_load_error(&loc);
        assert!(matches!(e, Error::Cancelled));
    }
}
