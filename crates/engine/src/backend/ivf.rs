//! IVF-Flat backend
//!
//! Vectors are partitioned into `nlist` inverted lists by nearest centroid.
//! A query ranks the centroids and scans the closest `nprobe` lists. When
//! those lists hold fewer than `k` accepted vectors, probing continues down
//! the centroid ranking, so a query never returns fewer hits than there are
//! accepted vectors.
//!
//! Training is deterministic: centroids are seeded from evenly strided
//! records in id order and refined by a fixed number of Lloyd iterations.
//!
//! # Payload Format
//!
//! ```text
//! "TIVF" | version u32 | dimension u32 | metric u8 | nlist u32 | count u64
//!        | centroids: nlist x dimension x f32
//!        | per list: len u64 | ids: len x u64 | rows: len x dimension x f32
//! ```

use super::codec::{PayloadReader, PayloadWriter};
use super::{prepare_records, select_top_k, BackendError, IndexBackend};
use crate::cancel::CancelToken;
use crate::distance::distance;
use rayon::prelude::*;
use std::any::Any;
use tessera_core::{
    BackendKind, DistanceMetric, IndexDescriptor, Neighbor, SearchParams, VectorId, VectorRecord,
};
use tracing::debug;

const IVF_MAGIC: &[u8; 4] = b"TIVF";
const IVF_VERSION: u32 = 1;
const HEADER_BYTES: usize = 4 + 4 + 4 + 1 + 4 + 8;

/// Lloyd iterations run after seeding
pub const KMEANS_ITERATIONS: usize = 10;

#[derive(Debug, Default)]
struct InvertedList {
    ids: Vec<VectorId>,
    data: Vec<f32>,
}

/// Inverted-file backend with exact distances inside each list
pub struct IvfFlatBackend {
    descriptor: IndexDescriptor,
    centroids: Vec<f32>,
    lists: Vec<InvertedList>,
    /// Every stored id, ascending
    ids: Vec<VectorId>,
}

impl IvfFlatBackend {
    /// Train centroids and assign records
    pub fn build(
        descriptor: IndexDescriptor,
        records: Vec<VectorRecord>,
        cancel: &CancelToken,
    ) -> Result<Self, BackendError> {
        let records = prepare_records(&descriptor, records)?;
        let dim = descriptor.dimension;
        let metric = descriptor.metric;
        let n = records.len();
        let nlist = descriptor.nlist.min(n);

        let mut centroids = Vec::with_capacity(nlist * dim);
        for c in 0..nlist {
            centroids.extend_from_slice(&records[c * n / nlist].vector);
        }

        let mut assignment = assign(metric, dim, &centroids, &records);
        for iteration in 0..KMEANS_ITERATIONS {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            recompute_centroids(dim, &mut centroids, &records, &assignment);
            let next = assign(metric, dim, &centroids, &records);
            let converged = next == assignment;
            assignment = next;
            if converged {
                debug!(
                    target: "tessera::backend",
                    iteration,
                    nlist,
                    "k-means converged"
                );
                break;
            }
        }
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let mut lists: Vec<InvertedList> = (0..nlist).map(|_| InvertedList::default()).collect();
        let mut ids = Vec::with_capacity(n);
        for (record, list) in records.into_iter().zip(assignment) {
            ids.push(record.id);
            lists[list].ids.push(record.id);
            lists[list].data.extend_from_slice(&record.vector);
        }

        Ok(IvfFlatBackend {
            descriptor,
            centroids,
            lists,
            ids,
        })
    }

    /// Decode a `TIVF` payload
    pub fn decode(descriptor: IndexDescriptor, bytes: &[u8]) -> Result<Self, BackendError> {
        let mut r = PayloadReader::new(bytes, BackendKind::IvfFlat);
        r.expect_header(IVF_MAGIC, IVF_VERSION)?;
        let dim = r.u32("dimension")? as usize;
        if dim != descriptor.dimension {
            return Err(BackendError::DimensionMismatch {
                expected: descriptor.dimension,
                got: dim,
            });
        }
        let metric = DistanceMetric::from_byte(r.u8("metric")?)
            .ok_or_else(|| BackendError::malformed(BackendKind::IvfFlat, "unknown metric"))?;
        if metric != descriptor.metric {
            return Err(BackendError::malformed(
                BackendKind::IvfFlat,
                format!("payload metric {} does not match descriptor", metric.name()),
            ));
        }
        let nlist = r.u32("nlist")? as usize;
        let count = r.u64("count")? as usize;
        let centroids = r.f32s(nlist.saturating_mul(dim), "centroids")?;

        let mut lists = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..nlist {
            let len = r.u64("list length")? as usize;
            let list_ids = r.ids(len, "list ids")?;
            let data = r.f32s(len.saturating_mul(dim), "list rows")?;
            ids.extend_from_slice(&list_ids);
            lists.push(InvertedList {
                ids: list_ids,
                data,
            });
        }
        r.finish()?;

        if ids.len() != count {
            return Err(BackendError::malformed(
                BackendKind::IvfFlat,
                format!("lists hold {} ids, header says {}", ids.len(), count),
            ));
        }
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(BackendError::malformed(
                BackendKind::IvfFlat,
                "id stored in more than one list",
            ));
        }
        Ok(IvfFlatBackend {
            descriptor,
            centroids,
            lists,
            ids,
        })
    }

    /// Number of inverted lists actually trained
    pub fn nlist(&self) -> usize {
        self.lists.len()
    }

    fn centroid(&self, list: usize) -> &[f32] {
        let dim = self.descriptor.dimension;
        &self.centroids[list * dim..(list + 1) * dim]
    }
}

fn nearest(metric: DistanceMetric, dim: usize, centroids: &[f32], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::NAN;
    for (c, centroid) in centroids.chunks_exact(dim).enumerate() {
        let d = distance(metric, v, centroid);
        if c == 0 || metric.compare(d, best_dist).is_lt() {
            best = c;
            best_dist = d;
        }
    }
    best
}

fn assign(
    metric: DistanceMetric,
    dim: usize,
    centroids: &[f32],
    records: &[VectorRecord],
) -> Vec<usize> {
    records
        .par_iter()
        .map(|r| nearest(metric, dim, centroids, &r.vector))
        .collect()
}

/// Move each centroid to the mean of its members; empty clusters stay put
fn recompute_centroids(
    dim: usize,
    centroids: &mut [f32],
    records: &[VectorRecord],
    assignment: &[usize],
) {
    let nlist = centroids.len() / dim;
    let mut sums = vec![0f64; nlist * dim];
    let mut counts = vec![0usize; nlist];
    for (record, &list) in records.iter().zip(assignment) {
        counts[list] += 1;
        for (s, v) in sums[list * dim..(list + 1) * dim].iter_mut().zip(&record.vector) {
            *s += *v as f64;
        }
    }
    for (list, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        for j in 0..dim {
            centroids[list * dim + j] = (sums[list * dim + j] / count as f64) as f32;
        }
    }
}

impl IndexBackend for IvfFlatBackend {
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
        params: &SearchParams,
        accept: &dyn Fn(VectorId) -> bool,
    ) -> Vec<Neighbor> {
        let dim = self.descriptor.dimension;
        if k == 0 || self.lists.is_empty() || query.len() != dim {
            return Vec::new();
        }
        let metric = self.descriptor.metric;

        let mut order: Vec<(usize, f32)> = (0..self.lists.len())
            .map(|c| (c, distance(metric, query, self.centroid(c))))
            .collect();
        order.sort_by(|a, b| metric.compare(a.1, b.1).then_with(|| a.0.cmp(&b.0)));

        let nprobe = params.nprobe.max(1);
        let mut hits = Vec::new();
        for (probed, (list, _)) in order.iter().enumerate() {
            if probed >= nprobe && hits.len() >= k {
                break;
            }
            let list = &self.lists[*list];
            for (i, id) in list.ids.iter().enumerate() {
                if accept(*id) {
                    let row = &list.data[i * dim..(i + 1) * dim];
                    hits.push(Neighbor::new(*id, distance(metric, query, row)));
                }
            }
        }
        select_top_k(metric, hits, k)
    }

    fn records(&self) -> Vec<VectorRecord> {
        let dim = self.descriptor.dimension;
        let mut records: Vec<VectorRecord> = self
            .lists
            .iter()
            .flat_map(|list| {
                list.ids
                    .iter()
                    .zip(list.data.chunks_exact(dim))
                    .map(|(id, row)| VectorRecord::new(*id, row.to_vec()))
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::with_capacity(self.physical_size());
        w.header(IVF_MAGIC, IVF_VERSION);
        w.put_u32(self.descriptor.dimension as u32);
        w.put_u8(self.descriptor.metric.to_byte());
        w.put_u32(self.lists.len() as u32);
        w.put_u64(self.ids.len() as u64);
        w.put_f32s(&self.centroids);
        for list in &self.lists {
            w.put_u64(list.ids.len() as u64);
            w.put_ids(&list.ids);
            w.put_f32s(&list.data);
        }
        w.finish()
    }

    fn physical_size(&self) -> usize {
        let dim = self.descriptor.dimension;
        HEADER_BYTES
            + self.centroids.len() * 4
            + self.lists.len() * 8
            + self.ids.len() * (8 + dim * 4)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
