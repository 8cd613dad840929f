//! Flat (exhaustive) backend
//!
//! Vectors are kept in one contiguous row-major matrix ordered by id, so a
//! search is a single linear scan and `contains` is a binary search.
//!
//! # Payload Format
//!
//! ```text
//! "TFLT" | version u32 | dimension u32 | metric u8 | count u64
//!        | ids: count x u64 | rows: count x dimension x f32
//! ```

use super::codec::{PayloadReader, PayloadWriter};
use super::{prepare_records, select_top_k, BackendError, IndexBackend};
use crate::cancel::CancelToken;
use crate::distance::distance;
use std::any::Any;
use tessera_core::{
    BackendKind, DistanceMetric, IndexDescriptor, Neighbor, SearchParams, VectorId, VectorRecord,
};

const FLAT_MAGIC: &[u8; 4] = b"TFLT";
const FLAT_VERSION: u32 = 1;
const HEADER_BYTES: usize = 4 + 4 + 4 + 1 + 8;

/// Exhaustive-scan backend
pub struct FlatBackend {
    descriptor: IndexDescriptor,
    /// Ascending ids; row `i` of `data` belongs to `ids[i]`
    ids: Vec<VectorId>,
    data: Vec<f32>,
}

impl FlatBackend {
    /// Build from records in any order
    pub fn build(
        descriptor: IndexDescriptor,
        records: Vec<VectorRecord>,
        cancel: &CancelToken,
    ) -> Result<Self, BackendError> {
        let records = prepare_records(&descriptor, records)?;
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let mut ids = Vec::with_capacity(records.len());
        let mut data = Vec::with_capacity(records.len() * descriptor.dimension);
        for record in records {
            ids.push(record.id);
            data.extend_from_slice(&record.vector);
        }
        Ok(FlatBackend {
            descriptor,
            ids,
            data,
        })
    }

    /// Decode a `TFLT` payload
    pub fn decode(descriptor: IndexDescriptor, bytes: &[u8]) -> Result<Self, BackendError> {
        let mut r = PayloadReader::new(bytes, BackendKind::Flat);
        r.expect_header(FLAT_MAGIC, FLAT_VERSION)?;
        let dimension = r.u32("dimension")? as usize;
        if dimension != descriptor.dimension {
            return Err(BackendError::DimensionMismatch {
                expected: descriptor.dimension,
                got: dimension,
            });
        }
        let metric = DistanceMetric::from_byte(r.u8("metric")?)
            .ok_or_else(|| BackendError::malformed(BackendKind::Flat, "unknown metric"))?;
        if metric != descriptor.metric {
            return Err(BackendError::malformed(
                BackendKind::Flat,
                format!("payload metric {} does not match descriptor", metric.name()),
            ));
        }
        let count = r.u64("count")? as usize;
        let ids = r.ids(count, "ids")?;
        let data = r.f32s(count.saturating_mul(dimension), "rows")?;
        r.finish()?;

        if ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BackendError::malformed(
                BackendKind::Flat,
                "ids are not strictly ascending",
            ));
        }
        Ok(FlatBackend {
            descriptor,
            ids,
            data,
        })
    }

    fn row(&self, index: usize) -> &[f32] {
        let dim = self.descriptor.dimension;
        &self.data[index * dim..(index + 1) * dim]
    }
}

impl IndexBackend for FlatBackend {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn contains(&self, id: VectorId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    fn ids(&self) -> Vec<VectorId> {
        self.ids.clone()
    }

    fn id_bounds(&self) -> Option<(VectorId, VectorId)> {
        Some((*self.ids.first()?, *self.ids.last()?))
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        _params: &SearchParams,
        accept: &dyn Fn(VectorId) -> bool,
    ) -> Vec<Neighbor> {
        if k == 0 || query.len() != self.descriptor.dimension {
            return Vec::new();
        }
        let metric = self.descriptor.metric;
        let hits = self
            .ids
            .iter()
            .enumerate()
            .filter(|(_, id)| accept(**id))
            .map(|(i, id)| Neighbor::new(*id, distance(metric, query, self.row(i))))
            .collect();
        select_top_k(metric, hits, k)
    }

    fn records(&self) -> Vec<VectorRecord> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, id)| VectorRecord::new(*id, self.row(i).to_vec()))
            .collect()
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::with_capacity(self.physical_size());
        w.header(FLAT_MAGIC, FLAT_VERSION);
        w.put_u32(self.descriptor.dimension as u32);
        w.put_u8(self.descriptor.metric.to_byte());
        w.put_u64(self.ids.len() as u64);
        w.put_ids(&self.ids);
        w.put_f32s(&self.data);
        w.finish()
    }

    fn physical_size(&self) -> usize {
        HEADER_BYTES + self.ids.len() * 8 + self.data.len() * 4
    }

    /// Concatenate the surviving rows of several flat backends.
    fn merge_with(
        &self,
        others: &[&dyn IndexBackend],
        dropped: &dyn Fn(VectorId) -> bool,
    ) -> Result<Box<dyn IndexBackend>, BackendError> {
        let mut sources: Vec<&FlatBackend> = vec![self];
        for other in others {
            let flat = other.as_any().downcast_ref::<FlatBackend>().ok_or(
                BackendError::Unsupported {
                    backend: other.kind(),
                    operation: "structural merge with flat",
                },
            )?;
            if !flat.descriptor.is_compatible(&self.descriptor) {
                return Err(BackendError::DimensionMismatch {
                    expected: self.descriptor.dimension,
                    got: flat.descriptor.dimension,
                });
            }
            sources.push(flat);
        }

        // (id, source, row) for every surviving row
        let mut rows: Vec<(VectorId, usize, usize)> = sources
            .iter()
            .enumerate()
            .flat_map(|(s, src)| src.ids.iter().enumerate().map(move |(i, id)| (*id, s, i)))
            .filter(|(id, _, _)| !dropped(*id))
            .collect();
        rows.sort_unstable_by_key(|(id, _, _)| *id);
        if let Some(pair) = rows.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(BackendError::DuplicateId(pair[0].0));
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut data = Vec::with_capacity(rows.len() * self.descriptor.dimension);
        for (id, s, i) in rows {
            ids.push(id);
            data.extend_from_slice(sources[s].row(i));
        }
        Ok(Box::new(FlatBackend {
            descriptor: self.descriptor,
            ids,
            data,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
