//! Raw buffer of an active segment
//!
//! Inserted batches are stored as immutable `Arc` slices. Readers take a
//! snapshot (a clone of the batch list) and scan it without holding any
//! lock, so an exhaustive search never blocks the writer.

use crate::backend::select_top_k;
use crate::distance::distance;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tessera_core::{DistanceMetric, Error, Neighbor, Result, VectorId, VectorRecord};

#[derive(Default)]
struct RawInner {
    batches: Vec<Arc<[VectorRecord]>>,
    ids: HashSet<VectorId>,
    bounds: Option<(VectorId, VectorId)>,
}

/// Point-in-time view of the buffered records
#[derive(Clone, Default)]
pub struct RawSnapshot {
    batches: Vec<Arc<[VectorRecord]>>,
}

impl RawSnapshot {
    /// Records in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &VectorRecord> {
        self.batches.iter().flat_map(|b| b.iter())
    }

    /// Number of records in the snapshot
    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.len()).sum()
    }

    /// Check if the snapshot holds nothing
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.is_empty())
    }

    /// Exhaustive top-`k` over the snapshot
    pub fn search(
        &self,
        metric: DistanceMetric,
        query: &[f32],
        k: usize,
        accept: &dyn Fn(VectorId) -> bool,
    ) -> Vec<Neighbor> {
        let hits = self
            .iter()
            .filter(|r| accept(r.id))
            .map(|r| Neighbor::new(r.id, distance(metric, query, &r.vector)))
            .collect();
        select_top_k(metric, hits, k)
    }
}

/// Append-only in-memory vector buffer
pub struct RawBuffer {
    dimension: usize,
    inner: RwLock<RawInner>,
}

impl RawBuffer {
    /// Empty buffer for vectors of `dimension`
    pub fn new(dimension: usize) -> Self {
        RawBuffer {
            dimension,
            inner: RwLock::new(RawInner::default()),
        }
    }

    /// Check a batch against the dimension and against ids already buffered.
    ///
    /// Callers serialize `validate` + `push` so the check stays valid.
    pub fn validate(&self, records: &[VectorRecord]) -> Result<()> {
        let inner = self.inner.read();
        let mut batch = HashSet::with_capacity(records.len());
        for record in records {
            if record.vector.len() != self.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    got: record.vector.len(),
                });
            }
            if inner.ids.contains(&record.id) || !batch.insert(record.id) {
                return Err(Error::DuplicateId { id: record.id });
            }
        }
        Ok(())
    }

    /// Append a validated batch
    pub fn push(&self, records: Vec<VectorRecord>) {
        if records.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for record in &records {
            inner.ids.insert(record.id);
            inner.bounds = Some(match inner.bounds {
                Some((lo, hi)) => (lo.min(record.id), hi.max(record.id)),
                None => (record.id, record.id),
            });
        }
        inner.batches.push(Arc::from(records));
    }

    /// Current contents
    pub fn snapshot(&self) -> RawSnapshot {
        RawSnapshot {
            batches: self.inner.read().batches.clone(),
        }
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.inner.read().ids.len()
    }

    /// Check if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if an id is buffered
    pub fn contains(&self, id: VectorId) -> bool {
        self.inner.read().ids.contains(&id)
    }

    /// Smallest and largest buffered id
    pub fn id_bounds(&self) -> Option<(VectorId, VectorId)> {
        self.inner.read().bounds
    }

    /// Nominal in-memory footprint: id + vector per record
    pub fn byte_size(&self) -> usize {
        self.len() * (8 + self.dimension * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u64, v: [f32; 2]) -> VectorRecord {
        VectorRecord::new(id, v.to_vec())
    }

    #[test]
    fn test_push_and_snapshot() {
        let raw = RawBuffer::new(2);
        raw.push(vec![rec(1, [0.0, 0.0]), rec(5, [1.0, 1.0])]);
        let snap = raw.snapshot();
        raw.push(vec![rec(3, [2.0, 2.0])]);

        assert_eq!(snap.len(), 2);
        assert_eq!(raw.len(), 3);
        assert_eq!(raw.id_bounds(), Some((VectorId(1), VectorId(5))));
        assert!(raw.contains(VectorId(3)));
        assert_eq!(raw.byte_size(), 3 * 16);
    }

    #[test]
    fn test_validate() {
        let raw = RawBuffer::new(2);
        raw.push(vec![rec(1, [0.0, 0.0])]);
        assert!(matches!(
            raw.validate(&[rec(1, [0.0, 0.0])]),
            Err(Error::DuplicateId { .. })
        ));
        assert!(matches!(
            raw.validate(&[rec(2, [0.0, 0.0]), rec(2, [1.0, 0.0])]),
            Err(Error::DuplicateId { .. })
        ));
        assert!(matches!(
            raw.validate(&[VectorRecord::new(3u64, vec![0.0])]),
            Err(Error::DimensionMismatch {
                expected: 2,
                got: 1
            })
        ));
        assert!(raw.validate(&[rec(2, [0.0, 0.0])]).is_ok());
    }

    #[test]
    fn test_snapshot_search() {
        let raw = RawBuffer::new(2);
        raw.push(vec![rec(1, [0.0, 0.0]), rec(2, [3.0, 4.0])]);
        let hits = raw
            .snapshot()
            .search(DistanceMetric::L2, &[3.0, 4.0], 1, &|_| true);
        assert_eq!(hits, vec![Neighbor::new(VectorId(2), 0.0)]);
    }
}
