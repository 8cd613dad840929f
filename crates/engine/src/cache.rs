//! Shared cache of loaded backends
//!
//! One cache serves every table of a database. Entries are keyed by segment
//! location and accounted by `physical_size()`. Loading happens outside the
//! cache lock, so a slow load never blocks hits on other segments.
//!
//! Capacity is a soft limit: pinned entries are never evicted. When the
//! resident set cannot be brought under capacity the load still succeeds and
//! the caller is told via `CacheLease::pressure`.

use crate::backend::{IndexBackend, IndexBackendFactory};
use lru::LruCache;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{Error, Result, SegmentLocation};
use tessera_storage::SegmentStore;
use tracing::{debug, warn};

struct CacheEntry {
    backend: Arc<dyn IndexBackend>,
    bytes: usize,
    pins: usize,
}

struct CacheInner {
    entries: LruCache<SegmentLocation, CacheEntry>,
    resident_bytes: usize,
}

/// A pinned backend handed out by `SegmentCache::get`.
///
/// The caller must hand the pin back with `release`; prefer `pin`, which
/// does that on drop.
pub struct CacheLease {
    /// The loaded backend
    pub backend: Arc<dyn IndexBackend>,
    /// Resident bytes exceed capacity and nothing more could be evicted
    pub pressure: bool,
}

/// Cache counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Resident entries
    pub entries: usize,
    /// Entries with at least one pin
    pub pinned: usize,
    /// Sum of resident physical sizes
    pub resident_bytes: usize,
    /// Configured soft limit
    pub capacity_bytes: usize,
    /// Lookups served from memory
    pub hits: u64,
    /// Lookups that loaded from the store
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Times the soft limit could not be honored
    pub pressure_events: u64,
}

/// Byte-bounded LRU of loaded segment backends
pub struct SegmentCache {
    capacity_bytes: usize,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    pressure_events: AtomicU64,
}

impl SegmentCache {
    /// Create a cache holding roughly `capacity_bytes` of backends
    pub fn new(capacity_bytes: usize) -> Self {
        SegmentCache {
            capacity_bytes,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                resident_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            pressure_events: AtomicU64::new(0),
        }
    }

    /// Configured soft limit
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Return the backend for `location`, loading it from `store` on a miss.
    ///
    /// The entry is pinned until `release` is called.
    pub fn get(&self, store: &SegmentStore, location: &SegmentLocation) -> Result<CacheLease> {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get_mut(location) {
                entry.pins += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheLease {
                    backend: Arc::clone(&entry.backend),
                    pressure: false,
                });
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let loaded = load_backend(store, location)?;

        let mut inner = self.inner.lock();
        // Another thread may have loaded it while we were reading.
        if let Some(entry) = inner.entries.get_mut(location) {
            entry.pins += 1;
            return Ok(CacheLease {
                backend: Arc::clone(&entry.backend),
                pressure: false,
            });
        }
        let bytes = loaded.physical_size();
        inner.entries.put(
            location.clone(),
            CacheEntry {
                backend: Arc::clone(&loaded),
                bytes,
                pins: 1,
            },
        );
        inner.resident_bytes += bytes;
        debug!(
            target: "tessera::cache",
            location = %location,
            bytes,
            resident = inner.resident_bytes,
            "Loaded segment backend"
        );
        let pressure = self.shrink(&mut inner);
        Ok(CacheLease {
            backend: loaded,
            pressure,
        })
    }

    /// `get` with an RAII guard that releases the pin on drop
    pub fn pin<'a>(
        &'a self,
        store: &SegmentStore,
        location: &SegmentLocation,
    ) -> Result<PinnedBackend<'a>> {
        let lease = self.get(store, location)?;
        Ok(PinnedBackend {
            cache: self,
            location: location.clone(),
            backend: lease.backend,
            pressure: lease.pressure,
        })
    }

    /// Drop one pin on `location`; unknown locations are ignored
    pub fn release(&self, location: &SegmentLocation) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.peek_mut(location) {
            entry.pins = entry.pins.saturating_sub(1);
        }
        if inner.resident_bytes > self.capacity_bytes {
            self.shrink(&mut inner);
        }
    }

    /// Seed an already-built backend without pinning it
    pub fn insert_loaded(&self, location: SegmentLocation, backend: Arc<dyn IndexBackend>) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains(&location) {
            return false;
        }
        let bytes = backend.physical_size();
        inner.entries.put(
            location,
            CacheEntry {
                backend,
                bytes,
                pins: 0,
            },
        );
        inner.resident_bytes += bytes;
        !self.shrink(&mut inner)
    }

    /// Evict the least recently used unpinned entry
    pub fn evict(&self) -> bool {
        let mut inner = self.inner.lock();
        self.evict_one(&mut inner)
    }

    /// Check if `location` is resident
    pub fn contains(&self, location: &SegmentLocation) -> bool {
        self.inner.lock().entries.contains(location)
    }

    /// Forget `location` even if pinned; outstanding pins keep their `Arc`
    pub fn remove(&self, location: &SegmentLocation) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(location) {
            Some(entry) => {
                inner.resident_bytes -= entry.bytes;
                true
            }
            None => false,
        }
    }

    /// `CacheCapacityPressure` if the resident set is over the soft limit
    pub fn pressure(&self) -> Option<Error> {
        let inner = self.inner.lock();
        (inner.resident_bytes > self.capacity_bytes).then(|| Error::CacheCapacityPressure {
            resident_bytes: inner.resident_bytes,
            capacity_bytes: self.capacity_bytes,
        })
    }

    /// Counters snapshot
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            pinned: inner.entries.iter().filter(|(_, e)| e.pins > 0).count(),
            resident_bytes: inner.resident_bytes,
            capacity_bytes: self.capacity_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pressure_events: self.pressure_events.load(Ordering::Relaxed),
        }
    }

    fn evict_one(&self, inner: &mut CacheInner) -> bool {
        // iter() runs most- to least-recently used
        let victim = inner
            .entries
            .iter()
            .rev()
            .find(|(_, e)| e.pins == 0)
            .map(|(loc, _)| loc.clone());
        let Some(victim) = victim else {
            return false;
        };
        if let Some(entry) = inner.entries.pop(&victim) {
            inner.resident_bytes -= entry.bytes;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "tessera::cache",
                location = %victim,
                bytes = entry.bytes,
                "Evicted segment backend"
            );
        }
        true
    }

    /// Evict until under capacity; `true` if that was impossible
    fn shrink(&self, inner: &mut CacheInner) -> bool {
        while inner.resident_bytes > self.capacity_bytes {
            if !self.evict_one(inner) {
                self.pressure_events.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "tessera::cache",
                    resident = inner.resident_bytes,
                    capacity = self.capacity_bytes,
                    "Segment cache over capacity with every entry pinned"
                );
                return true;
            }
        }
        false
    }
}

/// Backend pinned in the cache for the lifetime of the guard
pub struct PinnedBackend<'a> {
    cache: &'a SegmentCache,
    location: SegmentLocation,
    backend: Arc<dyn IndexBackend>,
    pressure: bool,
}

impl PinnedBackend<'_> {
    /// Whether the load that produced this pin hit capacity pressure
    pub fn under_pressure(&self) -> bool {
        self.pressure
    }
}

impl Deref for PinnedBackend<'_> {
    type Target = dyn IndexBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl Drop for PinnedBackend<'_> {
    fn drop(&mut self) {
        self.cache.release(&self.location);
    }
}

/// Read metadata + payload and decode the backend
fn load_backend(store: &SegmentStore, location: &SegmentLocation) -> Result<Arc<dyn IndexBackend>> {
    let meta = store.read_meta(location)?;
    let entry = meta
        .payloads
        .first()
        .ok_or_else(|| Error::corrupted(location, "metadata lists no payload"))?;
    let bytes = store.read_payload(&meta, entry)?;
    let backend = IndexBackendFactory::for_kind(meta.descriptor.backend)
        .load(&meta.descriptor, &bytes)
        .map_err(|e| e.into_load_error(location))?;
    if backend.len() as u64 != meta.count {
        return Err(Error::corrupted(
            location,
            format!(
                "payload holds {} vectors, metadata says {}",
                backend.len(),
                meta.count
            ),
        ));
    }
    Ok(Arc::from(backend))
}
