//! Per-table segment orchestration
//!
//! `EngineCore` owns one active (raw, writable) segment and a set of sealed
//! segment versions. The pair is published through one `ArcSwap`, so a
//! search snapshots a consistent view with a single atomic load and never
//! blocks on writers or maintenance.
//!
//! Locking:
//! - `writer` serializes appends to the active segment and sealing
//! - `maintenance` serializes build, serialize, merge, delete and drop
//!
//! Neither lock is taken by `search`. Versions replaced by a rebuild or
//! merge are retired and their files deleted by `collect_garbage` once no
//! snapshot references them any more.

use crate::backend::{merge_neighbors, BackendError, IndexBackend, IndexBackendFactory};
use crate::cache::SegmentCache;
use crate::cancel::CancelToken;
use crate::segment::{BackendRef, Segment};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{
    BackendKind, DistanceMetric, Error, IdRange, IndexDescriptor, Neighbor, Result, SearchParams,
    SegmentLocation, SegmentState, VectorId, VectorRecord,
};
use tessera_storage::{AppendLog, DurabilityMode, SegmentStore};
use tracing::{debug, error, info, warn};

/// Per-table engine settings
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Log sync policy for raw segments
    pub durability: DurabilityMode,
    /// Active segment physical size (bytes) that triggers sealing
    pub index_file_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            durability: DurabilityMode::Standard,
            index_file_size: 1024 << 20,
        }
    }
}

/// Summary of one visible segment version
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Persistent key
    pub location: SegmentLocation,
    /// Lifecycle state, cache residency folded in
    pub state: SegmentState,
    /// Backend variant
    pub backend: BackendKind,
    /// Live vectors
    pub count: usize,
    /// Bytes on disk or in memory
    pub physical_size: usize,
    /// Tombstoned ids not yet physically dropped
    pub tombstones: usize,
}

/// Result of a `cache` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Raw or built segment; already in memory
    InMemory,
    /// Backend was already in the cache
    AlreadyResident,
    /// Backend was loaded
    Loaded,
    /// Backend was loaded but the cache is over its soft limit
    LoadedUnderPressure,
}

/// Result of preloading a whole table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    /// Backends loaded by this call
    pub loaded: usize,
    /// Backends that were already resident
    pub already_resident: usize,
    /// The cache ended up over its soft limit
    pub pressure: bool,
}

struct SegmentView {
    active: Arc<Segment>,
    sealed: Vec<Arc<Segment>>,
}

impl SegmentView {
    fn all(&self) -> impl Iterator<Item = &Arc<Segment>> {
        std::iter::once(&self.active).chain(self.sealed.iter())
    }
}

/// Segment orchestration for one table
pub struct EngineCore {
    name: String,
    store: Arc<SegmentStore>,
    cache: Arc<SegmentCache>,
    options: EngineOptions,
    descriptor: RwLock<IndexDescriptor>,
    view: ArcSwap<SegmentView>,
    writer: Mutex<()>,
    maintenance: Mutex<()>,
    next_id: AtomicU64,
    /// Persisted versions replaced by a built version not yet committed
    superseded: Mutex<Vec<Arc<Segment>>>,
    /// Stale versions waiting for their last reader
    retired: Mutex<Vec<Arc<Segment>>>,
    corrupted: Mutex<Vec<(SegmentLocation, String)>>,
    dropped: AtomicBool,
}

impl EngineCore {
    /// Open the table stored in `store`, recovering whatever was committed.
    ///
    /// - uncommitted segment directories are swept
    /// - versions superseded by a committed merge or rebuild are deleted
    /// - append logs without a committed segment are replayed into sealed
    ///   raw segments
    /// - corrupted segments are reported by `corrupted_segments` and left
    ///   on disk untouched
    pub fn open(
        name: impl Into<String>,
        store: Arc<SegmentStore>,
        cache: Arc<SegmentCache>,
        descriptor: IndexDescriptor,
        options: EngineOptions,
    ) -> Result<Self> {
        let name = name.into();
        let swept = store.sweep_orphans()?;

        let mut metas = Vec::new();
        let mut corrupted = Vec::new();
        for location in store.list()? {
            match store.read_meta(&location) {
                Ok(meta) => metas.push(meta),
                Err(e @ Error::CorruptedSegment { .. }) => {
                    error!(
                        target: "tessera::engine",
                        table = %name,
                        location = %location,
                        error = %e,
                        "Segment metadata is corrupted; segment excluded"
                    );
                    corrupted.push((location, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        let superseded: HashSet<SegmentLocation> = metas
            .iter()
            .flat_map(|m| m.supersedes.iter().cloned())
            .collect();
        for (location, _) in corrupted.iter() {
            if superseded.contains(location) {
                store.delete(location)?;
            }
        }
        corrupted.retain(|(location, _)| !superseded.contains(location));

        let mut max_id = 0u64;
        let mut sealed = Vec::new();
        for meta in metas {
            if superseded.contains(&meta.location) {
                info!(
                    target: "tessera::engine",
                    table = %name,
                    location = %meta.location,
                    "Deleting superseded segment"
                );
                store.delete(&meta.location)?;
                continue;
            }
            if !meta.descriptor.is_compatible(&descriptor) {
                let reason = format!(
                    "segment dimension {} / {} does not match table",
                    meta.descriptor.dimension,
                    meta.descriptor.metric.name()
                );
                error!(target: "tessera::engine", table = %name, location = %meta.location, %reason);
                corrupted.push((meta.location.clone(), reason));
                continue;
            }
            if let Some(id) = meta.max_id {
                max_id = max_id.max(id.0);
            }
            sealed.push(Arc::new(Segment::persisted(meta)));
        }

        let raw_descriptor = IndexDescriptor::flat(descriptor.dimension, descriptor.metric);
        let mut recovered = 0;
        for location in store.list_logs()? {
            if store.exists(&location) {
                // Committed after the log was written; the payload covers it.
                store.remove_log(&location)?;
                continue;
            }
            let path = store.log_path(&location);
            let replay = AppendLog::replay(&path)?;
            let log = AppendLog::open(&path, options.durability)?;
            let segment = Segment::recover(location.clone(), raw_descriptor, replay, Some(log))?;
            if segment.stored_len() == 0 {
                drop(segment);
                store.remove_log(&location)?;
                continue;
            }
            segment.freeze();
            if let Some((_, hi)) = segment.id_bounds() {
                max_id = max_id.max(hi.0);
            }
            recovered += 1;
            sealed.push(Arc::new(segment));
        }

        let active = Arc::new(new_active(&store, raw_descriptor, options.durability)?);
        info!(
            target: "tessera::engine",
            table = %name,
            segments = sealed.len(),
            recovered,
            swept,
            corrupted = corrupted.len(),
            "Opened table engine"
        );

        Ok(EngineCore {
            name,
            store,
            cache,
            options,
            descriptor: RwLock::new(descriptor),
            view: ArcSwap::from_pointee(SegmentView { active, sealed }),
            writer: Mutex::new(()),
            maintenance: Mutex::new(()),
            next_id: AtomicU64::new(max_id.saturating_add(1)),
            superseded: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            corrupted: Mutex::new(corrupted),
            dropped: AtomicBool::new(false),
        })
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.descriptor.read().dimension
    }

    /// Distance metric
    pub fn metric(&self) -> DistanceMetric {
        self.descriptor.read().metric
    }

    /// Store holding this table's segments
    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    fn ensure_open(&self) -> Result<()> {
        if self.dropped.load(Ordering::Acquire) {
            Err(Error::not_ready(format!("table {} was dropped", self.name)))
        } else {
            Ok(())
        }
    }

    /// Append vectors; returns the ids they were stored under.
    ///
    /// With `ids` empty, ids are assigned sequentially above the largest id
    /// the table has seen. The batch is admitted all-or-nothing.
    pub fn add_with_ids(&self, vectors: Vec<Vec<f32>>, ids: &[u64]) -> Result<Vec<VectorId>> {
        self.ensure_open()?;
        if !ids.is_empty() && ids.len() != vectors.len() {
            return Err(Error::invalid_input(format!(
                "{} ids supplied for {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        let dimension = self.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                got: bad.len(),
            });
        }
        if vectors.is_empty() {
            return Ok(Vec::new());
        }

        let _writer = self.writer.lock();
        let assigned: Vec<VectorId> = if ids.is_empty() {
            let start = self.next_id.load(Ordering::Acquire);
            (0..vectors.len() as u64)
                .map(|i| VectorId(start.saturating_add(i)))
                .collect()
        } else {
            ids.iter().copied().map(VectorId).collect()
        };
        let records: Vec<VectorRecord> = assigned
            .iter()
            .zip(vectors)
            .map(|(id, vector)| VectorRecord { id: *id, vector })
            .collect();

        let active = Arc::clone(&self.view.load().active);
        active.add_with_ids(records)?;
        if let Some(max) = assigned.iter().max() {
            self.next_id
                .fetch_max(max.0.saturating_add(1), Ordering::AcqRel);
        }
        debug!(
            target: "tessera::engine",
            table = %self.name,
            count = assigned.len(),
            "Appended vectors"
        );

        if active.physical_size() >= self.options.index_file_size {
            self.seal_locked()?;
        }
        Ok(assigned)
    }

    /// Move a non-empty active segment into the sealed set.
    ///
    /// The sealed segment stays searchable as Raw until it is built.
    pub fn seal_active(&self) -> Result<Option<SegmentLocation>> {
        self.ensure_open()?;
        let _writer = self.writer.lock();
        self.seal_locked()
    }

    fn seal_locked(&self) -> Result<Option<SegmentLocation>> {
        let current = self.view.load_full();
        if current.active.stored_len() == 0 {
            return Ok(None);
        }
        let descriptor = *current.active.descriptor();
        let fresh = Arc::new(new_active(&self.store, descriptor, self.options.durability)?);
        let old = Arc::clone(&current.active);
        old.freeze();
        self.view.rcu(|view| {
            let mut sealed = view.sealed.clone();
            sealed.push(Arc::clone(&old));
            Arc::new(SegmentView {
                active: Arc::clone(&fresh),
                sealed,
            })
        });
        info!(
            target: "tessera::engine",
            table = %self.name,
            location = %old.location(),
            count = old.count(),
            "Sealed active segment"
        );
        Ok(Some(old.location().clone()))
    }

    /// Current index descriptor
    pub fn describe_index(&self) -> IndexDescriptor {
        *self.descriptor.read()
    }

    /// Seal the active segment and (re)build every segment to `descriptor`
    /// (or the current descriptor when `None`), persisting each one.
    ///
    /// Returns the locations that were committed.
    pub fn build_index(
        &self,
        descriptor: Option<IndexDescriptor>,
        cancel: &CancelToken,
    ) -> Result<Vec<SegmentLocation>> {
        self.ensure_open()?;
        let _maintenance = self.maintenance.lock();
        cancel.check()?;
        let previous = self.describe_index();
        if let Some(descriptor) = descriptor {
            self.set_descriptor(descriptor)?;
        }
        let target = self.describe_index();
        let result = self
            .seal_active()
            .and_then(|_| self.rebuild_locked(&target, cancel));
        if matches!(result, Err(Error::Cancelled)) && descriptor.is_some() {
            *self.descriptor.write() = previous;
            info!(
                target: "tessera::engine",
                table = %self.name,
                "Index build cancelled, descriptor restored"
            );
        }
        result
    }

    /// Build only segments that are already sealed, with the current descriptor
    pub fn build_sealed(&self, cancel: &CancelToken) -> Result<Vec<SegmentLocation>> {
        self.ensure_open()?;
        let _maintenance = self.maintenance.lock();
        let target = self.describe_index();
        self.rebuild_locked(&target, cancel)
    }

    /// Replace the descriptor used by the next build without building.
    ///
    /// Dimension and metric are fixed for the life of the table.
    pub fn set_descriptor(&self, descriptor: IndexDescriptor) -> Result<()> {
        self.ensure_open()?;
        let mut current = self.descriptor.write();
        if !descriptor.is_compatible(&current) {
            return Err(Error::invalid_input(format!(
                "index descriptor (dim {}, {}) does not match table {} (dim {}, {})",
                descriptor.dimension,
                descriptor.metric.name(),
                self.name,
                current.dimension,
                current.metric.name()
            )));
        }
        *current = descriptor;
        Ok(())
    }

    /// Check whether sealed segments are waiting for a build or commit
    pub fn has_pending_build(&self) -> bool {
        let target = self.describe_index();
        self.view.load().sealed.iter().any(|s| match s.state() {
            SegmentState::Raw | SegmentState::Built => true,
            SegmentState::Persisted => needs_rebuild(s.descriptor(), &target),
            _ => false,
        })
    }

    /// Reset the descriptor to Flat and rebuild every non-flat segment
    pub fn drop_index(&self, cancel: &CancelToken) -> Result<Vec<SegmentLocation>> {
        let current = self.describe_index();
        let flat = IndexDescriptor::flat(current.dimension, current.metric);
        self.build_index(Some(flat), cancel)
    }

    /// Builds every segment that needs it into a staging list, then swaps
    /// the whole batch into the view at once. Nothing is published if the
    /// build is cancelled or fails part way.
    fn rebuild_locked(
        &self,
        target: &IndexDescriptor,
        cancel: &CancelToken,
    ) -> Result<Vec<SegmentLocation>> {
        let current = self.view.load_full();
        let mut staged: Vec<(Arc<Segment>, Option<Arc<Segment>>)> = Vec::new();
        for segment in current.sealed.iter() {
            let needed = match segment.state() {
                SegmentState::Raw => true,
                SegmentState::Built | SegmentState::Persisted => {
                    needs_rebuild(segment.descriptor(), target)
                }
                _ => false,
            };
            if !needed {
                continue;
            }
            cancel.check()?;

            if segment.count() == 0 {
                // Nothing live to index; the version just goes away.
                staged.push((Arc::clone(segment), None));
                continue;
            }
            let built = segment.build_index(target, &self.store, &self.cache, cancel)?;
            staged.push((Arc::clone(segment), Some(Arc::new(built))));
        }
        drop(current);
        cancel.check()?;
        self.publish(staged);

        // Built versions are visible from here on; committing them is not
        // interruptible.
        self.serialize_locked(&CancelToken::new())
    }

    fn publish(&self, staged: Vec<(Arc<Segment>, Option<Arc<Segment>>)>) {
        if staged.is_empty() {
            return;
        }
        self.view.rcu(|view| {
            let sealed = view
                .sealed
                .iter()
                .filter_map(|segment| {
                    match staged.iter().find(|(old, _)| Arc::ptr_eq(old, segment)) {
                        Some((_, new)) => new.clone(),
                        None => Some(Arc::clone(segment)),
                    }
                })
                .collect();
            Arc::new(SegmentView {
                active: Arc::clone(&view.active),
                sealed,
            })
        });
        for (old, new) in staged {
            match new {
                None => self.retire(old),
                // The committed file stays until its replacement commits.
                Some(_) if old.state() == SegmentState::Persisted => {
                    self.superseded.lock().push(old)
                }
                Some(_) => {}
            }
        }
    }

    /// Persist every built segment that is not yet committed
    pub fn serialize(&self, cancel: &CancelToken) -> Result<Vec<SegmentLocation>> {
        self.ensure_open()?;
        let _maintenance = self.maintenance.lock();
        self.serialize_locked(cancel)
    }

    fn serialize_locked(&self, cancel: &CancelToken) -> Result<Vec<SegmentLocation>> {
        let current = self.view.load_full();
        let mut committed = Vec::new();
        for segment in current
            .sealed
            .iter()
            .filter(|s| s.state() == SegmentState::Built)
        {
            let persisted = Arc::new(segment.serialize(&self.store, cancel)?);
            self.replace_sealed(segment, Some(Arc::clone(&persisted)));
            self.retire_superseded(persisted.supersedes());
            committed.push(persisted.location().clone());
        }
        drop(current);
        if !committed.is_empty() {
            info!(
                target: "tessera::engine",
                table = %self.name,
                segments = committed.len(),
                "Committed built segments"
            );
        }
        self.collect_garbage();
        Ok(committed)
    }

    /// Fold persisted segments into one new segment.
    ///
    /// Uses the backend's structural merge when every source shares a
    /// variant that supports it, otherwise rebuilds from the live records.
    /// The sources stay untouched unless the merged version commits.
    pub fn merge(
        &self,
        sources: &[SegmentLocation],
        cancel: &CancelToken,
    ) -> Result<SegmentLocation> {
        self.ensure_open()?;
        let _maintenance = self.maintenance.lock();
        if sources.is_empty() {
            return Err(Error::invalid_input("merge needs at least one source"));
        }
        let unique: HashSet<&SegmentLocation> = sources.iter().collect();
        if unique.len() != sources.len() {
            return Err(Error::invalid_input("merge sources must be distinct"));
        }

        let current = self.view.load_full();
        let segments = sources
            .iter()
            .map(|location| {
                current
                    .sealed
                    .iter()
                    .find(|s| s.location() == location && s.state() == SegmentState::Persisted)
                    .cloned()
                    .ok_or_else(|| {
                        Error::invalid_input(format!(
                            "{} is not a persisted segment of table {}",
                            location, self.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let merged = Arc::new(self.merge_segments(&segments, cancel)?);
        let location = merged.location().clone();
        self.view.rcu(|view| {
            let mut sealed: Vec<Arc<Segment>> = view
                .sealed
                .iter()
                .filter(|s| !segments.iter().any(|m| Arc::ptr_eq(m, s)))
                .cloned()
                .collect();
            sealed.push(Arc::clone(&merged));
            Arc::new(SegmentView {
                active: Arc::clone(&view.active),
                sealed,
            })
        });
        drop(current);
        for segment in segments {
            self.retire(segment);
        }
        info!(
            target: "tessera::engine",
            table = %self.name,
            location = %location,
            sources = sources.len(),
            count = merged.count(),
            "Merged segments"
        );
        self.collect_garbage();
        Ok(location)
    }

    fn merge_segments(&self, segments: &[Arc<Segment>], cancel: &CancelToken) -> Result<Segment> {
        let mut live = HashSet::new();
        for segment in segments {
            for id in segment.live_ids(&self.store, &self.cache)? {
                if !live.insert(id) {
                    return Err(Error::MergeIdConflict { id });
                }
            }
        }
        cancel.check()?;

        let first = *segments[0].descriptor();
        let target = if segments.iter().all(|s| *s.descriptor() == first) {
            first
        } else {
            self.describe_index()
        };
        let tombstoned: HashSet<VectorId> = segments
            .iter()
            .flat_map(|s| s.tombstones().iter().copied().collect::<Vec<_>>())
            .collect();

        let mut merged: Option<Box<dyn IndexBackend>> = None;
        let structural = target.backend.supports_structural_merge()
            && segments.iter().all(|s| *s.descriptor() == target)
            && tombstoned.iter().all(|id| !live.contains(id));
        if structural {
            let backends = segments
                .iter()
                .map(|s| {
                    s.backend(&self.store, &self.cache)?.ok_or_else(|| {
                        Error::not_ready(format!("segment {} has no backend", s.location()))
                    })
                })
                .collect::<Result<Vec<BackendRef<'_>>>>()?;
            let others: Vec<&dyn IndexBackend> = backends[1..].iter().map(|b| &**b).collect();
            match backends[0].merge_with(&others, &|id| tombstoned.contains(&id)) {
                Ok(backend) => merged = Some(backend),
                Err(BackendError::Unsupported { backend, operation }) => {
                    debug!(
                        target: "tessera::engine",
                        %backend,
                        operation,
                        "Structural merge unavailable, rebuilding"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        let backend = match merged {
            Some(backend) => backend,
            None => {
                let mut records = Vec::with_capacity(live.len());
                for segment in segments {
                    cancel.check()?;
                    records.extend(segment.live_records(&self.store, &self.cache)?);
                }
                IndexBackendFactory::for_kind(target.backend).build(&target, records, cancel)?
            }
        };
        cancel.check()?;

        let sources = segments.iter().map(|s| s.location().clone()).collect();
        Segment::built(SegmentLocation::generate(), Arc::from(backend), sources)
            .serialize(&self.store, cancel)
    }

    /// Merge every persisted segment smaller than `index_file_size`.
    ///
    /// Returns the merged location, or `None` when fewer than two qualify.
    pub fn compact(&self, cancel: &CancelToken) -> Result<Option<SegmentLocation>> {
        self.ensure_open()?;
        let small: Vec<SegmentLocation> = self
            .view
            .load()
            .sealed
            .iter()
            .filter(|s| {
                s.state() == SegmentState::Persisted
                    && s.physical_size() < self.options.index_file_size
            })
            .map(|s| s.location().clone())
            .collect();
        if small.len() < 2 {
            return Ok(None);
        }
        self.merge(&small, cancel).map(Some)
    }

    /// Top-`k` neighbors per query across every live segment.
    ///
    /// `ranges` restricts results to ids inside any of the ranges; an empty
    /// slice means no restriction.
    pub fn search(
        &self,
        queries: &[Vec<f32>],
        k: usize,
        params: &SearchParams,
        ranges: &[IdRange],
    ) -> Result<Vec<Vec<Neighbor>>> {
        self.ensure_open()?;
        let dimension = self.dimension();
        if let Some(bad) = queries.iter().find(|q| q.len() != dimension) {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                got: bad.len(),
            });
        }
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let per_segment = {
            let current = self.view.load_full();
            let segments: Vec<&Arc<Segment>> = current.all().collect();
            segments
                .par_iter()
                .map(|s| s.search(queries, k, params, ranges, &self.store, &self.cache))
                .collect::<Result<Vec<_>>>()?
        };
        // This snapshot may have been the last holder of a retired version.
        if !self.retired.lock().is_empty() {
            self.collect_garbage();
        }

        let mut per_query: Vec<Vec<Vec<Neighbor>>> = vec![Vec::new(); queries.len()];
        for lists in per_segment {
            for (query, hits) in lists.into_iter().enumerate() {
                per_query[query].push(hits);
            }
        }
        let metric = self.metric();
        Ok(per_query
            .into_iter()
            .map(|lists| merge_neighbors(metric, lists, k))
            .collect())
    }

    /// Tombstone every id in `range` across all segments.
    ///
    /// Space is reclaimed by the next build or merge.
    pub fn delete_by_range(&self, range: IdRange) -> Result<usize> {
        self.ensure_open()?;
        if range.is_empty() {
            return Err(Error::invalid_input(format!(
                "invalid id range [{}, {}]",
                range.start, range.end
            )));
        }
        let _maintenance = self.maintenance.lock();
        // Built versions keep tombstones only in memory; commit them first.
        self.serialize_locked(&CancelToken::new())?;

        let current = self.view.load_full();
        let mut deleted = 0;
        for segment in current.all() {
            deleted += segment.delete_range(&range, &self.store, &self.cache)?;
        }
        info!(
            target: "tessera::engine",
            table = %self.name,
            start = %range.start,
            end = %range.end,
            deleted,
            "Deleted id range"
        );
        Ok(deleted)
    }

    /// Live vectors
    pub fn count(&self) -> usize {
        self.view.load().all().map(|s| s.count()).sum()
    }

    /// Nominal bytes of live vectors
    pub fn size(&self) -> usize {
        self.view.load().all().map(|s| s.size()).sum()
    }

    /// Bytes held on disk or in memory, tombstones included
    pub fn physical_size(&self) -> usize {
        self.view.load().all().map(|s| s.physical_size()).sum()
    }

    /// Visible segment versions
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.view
            .load()
            .all()
            .filter(|s| s.stored_len() > 0 || s.state() != SegmentState::Raw)
            .map(|s| SegmentInfo {
                location: s.location().clone(),
                state: s.state_in(&self.cache),
                backend: s.descriptor().backend,
                count: s.count(),
                physical_size: s.physical_size(),
                tombstones: s.tombstones().len(),
            })
            .collect()
    }

    /// Segments excluded at open because their metadata was unreadable
    pub fn corrupted_segments(&self) -> Vec<(SegmentLocation, String)> {
        self.corrupted.lock().clone()
    }

    /// Bring a persisted segment's backend into the cache
    pub fn cache(&self, location: &SegmentLocation) -> Result<CacheOutcome> {
        self.ensure_open()?;
        let segment = self
            .view
            .load()
            .all()
            .find(|s| s.location() == location)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "{} is not a segment of table {}",
                    location, self.name
                ))
            })?;
        if segment.state() != SegmentState::Persisted {
            return Ok(CacheOutcome::InMemory);
        }
        if self.cache.contains(location) {
            return Ok(CacheOutcome::AlreadyResident);
        }
        let lease = self.cache.get(&self.store, location)?;
        self.cache.release(location);
        Ok(if lease.pressure {
            CacheOutcome::LoadedUnderPressure
        } else {
            CacheOutcome::Loaded
        })
    }

    /// `cache` every persisted segment of the table
    pub fn preload(&self) -> Result<PreloadReport> {
        self.ensure_open()?;
        let locations: Vec<SegmentLocation> = self
            .view
            .load()
            .sealed
            .iter()
            .filter(|s| s.state() == SegmentState::Persisted)
            .map(|s| s.location().clone())
            .collect();
        let mut report = PreloadReport::default();
        for location in &locations {
            match self.cache(location)? {
                CacheOutcome::AlreadyResident => report.already_resident += 1,
                CacheOutcome::Loaded => report.loaded += 1,
                CacheOutcome::LoadedUnderPressure => {
                    report.loaded += 1;
                    report.pressure = true;
                }
                CacheOutcome::InMemory => {}
            }
        }
        if report.pressure {
            warn!(
                target: "tessera::engine",
                table = %self.name,
                "Preload exceeded the cache soft limit"
            );
        }
        Ok(report)
    }

    /// Delete retired versions nobody references any more
    pub fn collect_garbage(&self) -> usize {
        let mut retired = self.retired.lock();
        let mut removed = 0;
        retired.retain(|segment| {
            if Arc::strong_count(segment) > 1 {
                return true;
            }
            self.cache.remove(segment.location());
            match self.store.delete(segment.location()) {
                Ok(()) => {
                    segment.mark_dropped();
                    removed += 1;
                    false
                }
                Err(e) => {
                    warn!(
                        target: "tessera::engine",
                        location = %segment.location(),
                        error = %e,
                        "Failed to delete retired segment"
                    );
                    true
                }
            }
        });
        removed
    }

    /// Drop every segment of the table, deleting its files
    pub fn drop_all(&self) -> Result<()> {
        let _maintenance = self.maintenance.lock();
        let _writer = self.writer.lock();
        if self.dropped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let current = self.view.load_full();
        let mut doomed: Vec<Arc<Segment>> = current.all().cloned().collect();
        doomed.append(&mut self.superseded.lock());
        doomed.append(&mut self.retired.lock());
        for segment in &doomed {
            segment.mark_dropped();
            self.cache.remove(segment.location());
            self.store.delete(segment.location())?;
        }
        info!(
            target: "tessera::engine",
            table = %self.name,
            segments = doomed.len(),
            "Dropped all segments"
        );
        Ok(())
    }

    fn replace_sealed(&self, old: &Arc<Segment>, new: Option<Arc<Segment>>) {
        self.view.rcu(|view| {
            let mut sealed = Vec::with_capacity(view.sealed.len());
            for segment in view.sealed.iter() {
                if Arc::ptr_eq(segment, old) {
                    if let Some(new) = &new {
                        sealed.push(Arc::clone(new));
                    }
                } else {
                    sealed.push(Arc::clone(segment));
                }
            }
            Arc::new(SegmentView {
                active: Arc::clone(&view.active),
                sealed,
            })
        });
    }

    fn retire(&self, segment: Arc<Segment>) {
        segment.mark_stale();
        self.retired.lock().push(segment);
    }

    fn retire_superseded(&self, locations: &[SegmentLocation]) {
        if locations.is_empty() {
            return;
        }
        let mut superseded = self.superseded.lock();
        let (done, keep): (Vec<_>, Vec<_>) = superseded
            .drain(..)
            .partition(|s| locations.contains(s.location()));
        *superseded = keep;
        drop(superseded);
        for segment in done {
            self.retire(segment);
        }
    }
}

fn new_active(
    store: &SegmentStore,
    descriptor: IndexDescriptor,
    durability: DurabilityMode,
) -> Result<Segment> {
    let location = SegmentLocation::generate();
    let log = AppendLog::open(store.log_path(&location), durability)?;
    Ok(Segment::raw(location, descriptor, Some(log)))
}

fn needs_rebuild(current: &IndexDescriptor, target: &IndexDescriptor) -> bool {
    match (current.backend, target.backend) {
        (BackendKind::Flat, BackendKind::Flat) => false,
        (BackendKind::IvfFlat, BackendKind::IvfFlat) => current.nlist != target.nlist,
        _ => true,
    }
}
