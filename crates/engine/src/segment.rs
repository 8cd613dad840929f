//! Segment versions
//!
//! A `Segment` is one immutable-once-sealed shard of a table. Lifecycle:
//!
//! ```text
//! Raw --build_index--> Built --serialize--> Persisted <--> Resident (cache)
//!                                               |
//!                                  merge / rebuild supersedes
//!                                               v
//!                                        Stale --> Dropped
//! ```
//!
//! `build_index` and `serialize` never mutate the segment they are called
//! on; they return a new version. The engine swaps versions in atomically,
//! so a search always sees either the old or the new version, never a mix.
//!
//! Tombstones are the only mutable state of a sealed segment. They are made
//! durable before a delete is acknowledged: in the append log for raw
//! segments, in a metadata rewrite for persisted ones.

use crate::backend::{merge_neighbors, IndexBackend, IndexBackendFactory};
use crate::cache::{PinnedBackend, SegmentCache};
use crate::cancel::CancelToken;
use crate::raw::RawBuffer;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tessera_core::{
    Error, IdRange, IndexDescriptor, Neighbor, Result, SearchParams, SegmentLocation,
    SegmentState, VectorId, VectorRecord,
};
use tessera_storage::{AppendLog, LogEntry, LogReplay, SegmentMeta, SegmentStore};
use tracing::{debug, info};

/// Backend reachable from a segment: owned in memory or pinned in the cache
pub enum BackendRef<'a> {
    /// Built, not yet persisted
    Memory(Arc<dyn IndexBackend>),
    /// Persisted, pinned for the lifetime of the reference
    Pinned(PinnedBackend<'a>),
}

impl Deref for BackendRef<'_> {
    type Target = dyn IndexBackend;

    fn deref(&self) -> &Self::Target {
        match self {
            BackendRef::Memory(b) => b.as_ref(),
            BackendRef::Pinned(p) => &**p,
        }
    }
}

/// One version of a segment
pub struct Segment {
    location: SegmentLocation,
    descriptor: IndexDescriptor,
    state: AtomicU8,
    frozen: AtomicBool,
    raw: RawBuffer,
    log: Mutex<Option<AppendLog>>,
    backend: Option<Arc<dyn IndexBackend>>,
    meta: Mutex<Option<SegmentMeta>>,
    tombstones: RwLock<Arc<BTreeSet<VectorId>>>,
    delete_lock: Mutex<()>,
    supersedes: Vec<SegmentLocation>,
}

impl Segment {
    fn with_state(
        location: SegmentLocation,
        descriptor: IndexDescriptor,
        state: SegmentState,
    ) -> Self {
        Segment {
            location,
            descriptor,
            state: AtomicU8::new(state.to_byte()),
            frozen: AtomicBool::new(state != SegmentState::Raw),
            raw: RawBuffer::new(descriptor.dimension),
            log: Mutex::new(None),
            backend: None,
            meta: Mutex::new(None),
            tombstones: RwLock::new(Arc::new(BTreeSet::new())),
            delete_lock: Mutex::new(()),
            supersedes: Vec::new(),
        }
    }

    /// New empty raw segment accepting inserts
    pub fn raw(
        location: SegmentLocation,
        descriptor: IndexDescriptor,
        log: Option<AppendLog>,
    ) -> Self {
        let segment = Segment::with_state(location, descriptor, SegmentState::Raw);
        *segment.log.lock() = log;
        segment
    }

    /// Rebuild a raw segment from its append log
    pub fn recover(
        location: SegmentLocation,
        descriptor: IndexDescriptor,
        replay: LogReplay,
        log: Option<AppendLog>,
    ) -> Result<Self> {
        let segment = Segment::raw(location, descriptor, log);
        let mut tombstones = BTreeSet::new();
        for entry in replay.entries {
            match entry {
                LogEntry::Insert { records } => {
                    segment.raw.validate(&records).map_err(|e| {
                        Error::corrupted(&segment.location, format!("log replay: {}", e))
                    })?;
                    segment.raw.push(records);
                }
                LogEntry::Tombstone { ids } => {
                    tombstones.extend(ids.into_iter().filter(|id| segment.raw.contains(*id)));
                }
            }
        }
        *segment.tombstones.write() = Arc::new(tombstones);
        debug!(
            target: "tessera::segment",
            location = %segment.location,
            records = segment.raw.len(),
            "Recovered raw segment from log"
        );
        Ok(segment)
    }

    /// In-memory version holding a freshly built backend
    pub fn built(
        location: SegmentLocation,
        backend: Arc<dyn IndexBackend>,
        supersedes: Vec<SegmentLocation>,
    ) -> Self {
        let mut segment = Segment::with_state(location, *backend.descriptor(), SegmentState::Built);
        segment.backend = Some(backend);
        segment.supersedes = supersedes;
        segment
    }

    /// Version described by committed metadata; the backend loads lazily
    pub fn persisted(meta: SegmentMeta) -> Self {
        let mut segment =
            Segment::with_state(meta.location.clone(), meta.descriptor, SegmentState::Persisted);
        segment.supersedes = meta.supersedes.clone();
        *segment.tombstones.get_mut() = Arc::new(meta.tombstones.clone());
        *segment.meta.get_mut() = Some(meta);
        segment
    }

    /// Restore a persisted version from the store
    pub fn load(store: &SegmentStore, location: &SegmentLocation) -> Result<Self> {
        Ok(Segment::persisted(store.read_meta(location)?))
    }

    /// Persistent key of this version
    pub fn location(&self) -> &SegmentLocation {
        &self.location
    }

    /// Descriptor; raw segments are exhaustive
    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    /// Lifecycle state (never `Resident`; see `state_in`)
    pub fn state(&self) -> SegmentState {
        SegmentState::from_byte(self.state.load(Ordering::Acquire)).unwrap_or(SegmentState::Dropped)
    }

    /// Lifecycle state with cache residency folded in
    pub fn state_in(&self, cache: &SegmentCache) -> SegmentState {
        match self.state() {
            SegmentState::Persisted if cache.contains(&self.location) => SegmentState::Resident,
            other => other,
        }
    }

    /// Locations this version replaces
    pub fn supersedes(&self) -> &[SegmentLocation] {
        &self.supersedes
    }

    /// Committed metadata of a persisted version
    pub fn meta(&self) -> Option<SegmentMeta> {
        self.meta.lock().clone()
    }

    /// Check if inserts are closed
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Close the segment to inserts
    pub fn freeze(&self) {
        // Taking the log lock waits out an in-flight append.
        let _log = self.log.lock();
        self.frozen.store(true, Ordering::Release);
    }

    /// Retired by a merge or rebuild
    pub fn mark_stale(&self) {
        self.state
            .store(SegmentState::Stale.to_byte(), Ordering::Release);
    }

    /// Removed from the table
    pub fn mark_dropped(&self) {
        self.state
            .store(SegmentState::Dropped.to_byte(), Ordering::Release);
    }

    /// Append a batch with assigned ids, all-or-nothing.
    ///
    /// The batch is logged before it becomes visible to searches.
    pub fn add_with_ids(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut log = self.log.lock();
        if self.state() != SegmentState::Raw || self.is_frozen() {
            return Err(Error::not_ready(format!(
                "segment {} is sealed",
                self.location
            )));
        }
        if records.is_empty() {
            return Ok(());
        }
        self.raw.validate(&records)?;
        let entry = LogEntry::Insert { records };
        if let Some(log) = log.as_mut() {
            log.append(&entry)?;
        }
        if let LogEntry::Insert { records } = entry {
            self.raw.push(records);
        }
        Ok(())
    }

    /// Backend of this version, pinning it in the cache when persisted
    pub fn backend<'a>(
        &'a self,
        store: &SegmentStore,
        cache: &'a SegmentCache,
    ) -> Result<Option<BackendRef<'a>>> {
        if let Some(backend) = &self.backend {
            return Ok(Some(BackendRef::Memory(Arc::clone(backend))));
        }
        match self.state() {
            SegmentState::Dropped => Err(Error::not_ready(format!(
                "segment {} was dropped",
                self.location
            ))),
            _ if self.meta.lock().is_some() => {
                Ok(Some(BackendRef::Pinned(cache.pin(store, &self.location)?)))
            }
            _ => Ok(None),
        }
    }

    /// Current tombstone set
    pub fn tombstones(&self) -> Arc<BTreeSet<VectorId>> {
        Arc::clone(&self.tombstones.read())
    }

    /// Records physically present (tombstoned included)
    pub fn stored_len(&self) -> usize {
        let stored = match (&self.backend, self.meta.lock().as_ref()) {
            (Some(b), _) => b.len(),
            (None, Some(meta)) => meta.count as usize,
            (None, None) => 0,
        };
        self.raw.len() + stored
    }

    /// Live vectors
    pub fn count(&self) -> usize {
        self.stored_len()
            .saturating_sub(self.tombstones.read().len())
    }

    /// Nominal bytes of live vectors: count x (id + vector)
    pub fn size(&self) -> usize {
        self.count() * self.descriptor.record_bytes()
    }

    /// Bytes this version occupies in memory or on disk, tombstones included
    pub fn physical_size(&self) -> usize {
        let stored = match (&self.backend, self.meta.lock().as_ref()) {
            (Some(b), _) => b.physical_size(),
            (None, Some(meta)) => meta.payload_bytes() as usize,
            (None, None) => 0,
        };
        self.raw.byte_size() + stored
    }

    /// Smallest and largest stored id
    pub fn id_bounds(&self) -> Option<(VectorId, VectorId)> {
        let stored = match (&self.backend, self.meta.lock().as_ref()) {
            (Some(b), _) => b.id_bounds(),
            (None, Some(meta)) => meta.min_id.zip(meta.max_id),
            (None, None) => None,
        };
        match (self.raw.id_bounds(), stored) {
            (Some((a, b)), Some((c, d))) => Some((a.min(c), b.max(d))),
            (a, b) => a.or(b),
        }
    }

    /// Top-`k` per query, excluding tombstones and ids outside `ranges`.
    ///
    /// An empty `ranges` slice means no id filter; several ranges are unioned.
    pub fn search(
        &self,
        queries: &[Vec<f32>],
        k: usize,
        params: &SearchParams,
        ranges: &[IdRange],
        store: &SegmentStore,
        cache: &SegmentCache,
    ) -> Result<Vec<Vec<Neighbor>>> {
        if self.state() == SegmentState::Dropped {
            return Err(Error::not_ready(format!(
                "segment {} was dropped",
                self.location
            )));
        }
        for query in queries {
            if query.len() != self.descriptor.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.descriptor.dimension,
                    got: query.len(),
                });
            }
        }
        let nothing = || vec![Vec::new(); queries.len()];
        if k == 0 {
            return Ok(nothing());
        }
        if !ranges.is_empty() {
            match self.id_bounds() {
                Some((lo, hi)) if ranges.iter().any(|r| r.overlaps(lo, hi)) => {}
                _ => return Ok(nothing()),
            }
        }

        let tombstones = self.tombstones();
        let accept = |id: VectorId| {
            !tombstones.contains(&id) && (ranges.is_empty() || ranges.iter().any(|r| r.contains(id)))
        };
        let raw = self.raw.snapshot();
        let backend = self.backend(store, cache)?;
        let metric = self.descriptor.metric;

        Ok(queries
            .iter()
            .map(|query| {
                let mut lists = Vec::with_capacity(2);
                if !raw.is_empty() {
                    lists.push(raw.search(metric, query, k, &accept));
                }
                if let Some(backend) = &backend {
                    lists.push(backend.search(query, k, params, &accept));
                }
                merge_neighbors(metric, lists, k)
            })
            .collect())
    }

    /// Live records in ascending id order
    pub fn live_records(
        &self,
        store: &SegmentStore,
        cache: &SegmentCache,
    ) -> Result<Vec<VectorRecord>> {
        let tombstones = self.tombstones();
        let mut records: Vec<VectorRecord> = self
            .raw
            .snapshot()
            .iter()
            .filter(|r| !tombstones.contains(&r.id))
            .cloned()
            .collect();
        if let Some(backend) = self.backend(store, cache)? {
            records.extend(
                backend
                    .records()
                    .into_iter()
                    .filter(|r| !tombstones.contains(&r.id)),
            );
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Live ids in ascending order
    pub fn live_ids(&self, store: &SegmentStore, cache: &SegmentCache) -> Result<Vec<VectorId>> {
        let tombstones = self.tombstones();
        let mut ids: Vec<VectorId> = self.raw.snapshot().iter().map(|r| r.id).collect();
        if let Some(backend) = self.backend(store, cache)? {
            ids.extend(backend.ids());
        }
        ids.retain(|id| !tombstones.contains(id));
        ids.sort_unstable();
        Ok(ids)
    }

    /// Tombstone every stored id in `range`; returns how many were newly deleted.
    pub fn delete_range(
        &self,
        range: &IdRange,
        store: &SegmentStore,
        cache: &SegmentCache,
    ) -> Result<usize> {
        if self.state() == SegmentState::Dropped {
            return Err(Error::not_ready(format!(
                "segment {} was dropped",
                self.location
            )));
        }
        match self.id_bounds() {
            Some((lo, hi)) if range.overlaps(lo, hi) => {}
            _ => return Ok(0),
        }

        let _guard = self.delete_lock.lock();
        let current = self.tombstones();
        let mut hit: Vec<VectorId> = self.raw.snapshot().iter().map(|r| r.id).collect();
        if let Some(backend) = self.backend(store, cache)? {
            hit.extend(backend.ids());
        }
        hit.retain(|id| range.contains(*id) && !current.contains(id));
        if hit.is_empty() {
            return Ok(0);
        }
        hit.sort_unstable();

        if let Some(log) = self.log.lock().as_mut() {
            log.append(&LogEntry::Tombstone { ids: hit.clone() })?;
        }
        {
            let mut meta = self.meta.lock();
            if let Some(meta) = meta.as_mut() {
                let mut next = meta.clone();
                next.tombstones.extend(hit.iter().copied());
                store.update_meta(&next)?;
                *meta = next;
            }
        }

        let mut next = (*current).clone();
        next.extend(hit.iter().copied());
        *self.tombstones.write() = Arc::new(next);

        debug!(
            target: "tessera::segment",
            location = %self.location,
            deleted = hit.len(),
            "Tombstoned id range"
        );
        Ok(hit.len())
    }

    /// Build a new version indexed per `target`.
    ///
    /// Raw and built versions keep their location; a persisted version is
    /// rebuilt into a fresh location that supersedes it. Tombstoned records
    /// are physically dropped.
    pub fn build_index(
        &self,
        target: &IndexDescriptor,
        store: &SegmentStore,
        cache: &SegmentCache,
        cancel: &CancelToken,
    ) -> Result<Segment> {
        if !target.is_compatible(&self.descriptor) {
            return Err(Error::invalid_input(format!(
                "descriptor (dim {}, {}) is incompatible with segment {}",
                target.dimension,
                target.metric.name(),
                self.location
            )));
        }
        let state = self.state();
        match state {
            SegmentState::Stale | SegmentState::Dropped => {
                return Err(Error::not_ready(format!(
                    "segment {} is no longer live",
                    self.location
                )))
            }
            SegmentState::Raw if !self.is_frozen() => {
                return Err(Error::not_ready(format!(
                    "segment {} must be sealed before building",
                    self.location
                )))
            }
            _ => {}
        }

        cancel.check()?;
        let records = self.live_records(store, cache)?;
        let count = records.len();
        let backend = IndexBackendFactory::for_kind(target.backend).build(target, records, cancel)?;

        let (location, supersedes) = if state == SegmentState::Persisted {
            (SegmentLocation::generate(), vec![self.location.clone()])
        } else {
            (self.location.clone(), self.supersedes.clone())
        };
        info!(
            target: "tessera::segment",
            source = %self.location,
            location = %location,
            backend = %target.backend,
            count,
            "Built segment index"
        );
        Ok(Segment::built(location, Arc::from(backend), supersedes))
    }

    /// Persist a built version; returns the `Persisted` version.
    ///
    /// The metadata rename inside `SegmentStore::commit` is the commit
    /// point. Once it lands, the raw log of the same location is redundant
    /// and removed.
    pub fn serialize(&self, store: &SegmentStore, cancel: &CancelToken) -> Result<Segment> {
        let backend = match (self.state(), &self.backend) {
            (SegmentState::Built, Some(backend)) => Arc::clone(backend),
            (state, _) => {
                return Err(Error::not_ready(format!(
                    "segment {} is {:?}; only built segments can be serialized",
                    self.location, state
                )))
            }
        };
        cancel.check()?;
        let payload = backend.encode();
        let bounds = backend.id_bounds();
        let mut meta = SegmentMeta::new(
            self.location.clone(),
            *backend.descriptor(),
            backend.len() as u64,
            bounds.map(|b| b.0),
            bounds.map(|b| b.1),
        );
        meta.tombstones = self.tombstones().iter().copied().collect();
        meta.supersedes = self.supersedes.clone();

        cancel.check()?;
        let committed = store.commit(&meta, &[&payload])?;
        store.remove_log(&self.location)?;
        info!(
            target: "tessera::segment",
            location = %self.location,
            bytes = payload.len(),
            supersedes = self.supersedes.len(),
            "Persisted segment"
        );
        Ok(Segment::persisted(committed))
    }
}
