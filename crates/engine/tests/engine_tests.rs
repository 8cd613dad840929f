//! EngineCore integration tests
//!
//! Exercise a single table end to end on disk: insert, seal, build,
//! serialize, reopen, merge, delete and cache residency.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{
    BackendKind, DistanceMetric, Error, IdRange, IndexDescriptor, Neighbor, SearchParams,
    SegmentLocation, SegmentState, VectorId,
};
use tessera_engine::{CancelToken, EngineCore, EngineOptions, SegmentCache};
use tessera_storage::SegmentStore;

fn open_with(
    dir: &TempDir,
    descriptor: IndexDescriptor,
    options: EngineOptions,
) -> EngineCore {
    let store = Arc::new(SegmentStore::open(dir.path()).unwrap());
    EngineCore::open(
        "vectors",
        store,
        Arc::new(SegmentCache::new(64 << 20)),
        descriptor,
        options,
    )
    .unwrap()
}

fn open(dir: &TempDir, dim: usize) -> EngineCore {
    open_with(
        dir,
        IndexDescriptor::flat(dim, DistanceMetric::L2),
        EngineOptions::default(),
    )
}

fn random_vectors(rng: &mut StdRng, n: usize, dim: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

fn ids(hits: &[Neighbor]) -> Vec<u64> {
    hits.iter().map(|h| h.id.0).collect()
}

fn sealed_locations(engine: &EngineCore) -> Vec<SegmentLocation> {
    engine
        .segments()
        .into_iter()
        .filter(|s| matches!(s.state, SegmentState::Persisted | SegmentState::Resident))
        .map(|s| s.location)
        .collect()
}

fn search_all(engine: &EngineCore, queries: &[Vec<f32>], k: usize) -> Vec<Vec<Neighbor>> {
    engine
        .search(queries, k, &SearchParams::default(), &[])
        .unwrap()
}

// ============================================================================
// Worked examples
// ============================================================================

#[test]
fn test_insert_assigns_ids_and_finds_exact_match() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 4);

    let assigned = engine
        .add_with_ids(vec![vec![0.0, 0.0, 0.0, 0.0], vec![1.0, 0.0, 0.0, 0.0]], &[])
        .unwrap();
    assert_eq!(assigned, vec![VectorId(1), VectorId(2)]);
    assert_eq!(engine.count(), 2);

    let hits = search_all(&engine, &[vec![0.0, 0.0, 0.0, 0.0]], 1);
    assert_eq!(hits, vec![vec![Neighbor::new(VectorId(1), 0.0)]]);
}

#[test]
fn test_delete_by_range_hides_id_and_keeps_bytes_until_build() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 4);
    engine
        .add_with_ids(vec![vec![0.0, 0.0, 0.0, 0.0], vec![1.0, 0.0, 0.0, 0.0]], &[])
        .unwrap();
    let physical = engine.physical_size();

    assert_eq!(engine.delete_by_range(IdRange::new(1, 1)).unwrap(), 1);
    assert_eq!(engine.count(), 1);
    assert_eq!(engine.size(), IndexDescriptor::flat(4, DistanceMetric::L2).record_bytes());
    assert_eq!(engine.physical_size(), physical);

    let hits = search_all(&engine, &[vec![0.0, 0.0, 0.0, 0.0]], 2);
    assert_eq!(ids(&hits[0]), vec![2]);

    engine.build_index(None, &CancelToken::new()).unwrap();
    assert_eq!(engine.count(), 1);
    assert!(engine.physical_size() < physical);
    let hits = search_all(&engine, &[vec![0.0, 0.0, 0.0, 0.0]], 2);
    assert_eq!(ids(&hits[0]), vec![2]);
}

#[test]
fn test_delete_range_rejects_reversed_bounds() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 2);
    assert!(matches!(
        engine.delete_by_range(IdRange::new(5, 1)),
        Err(Error::InvalidInput { .. })
    ));
}

// ============================================================================
// Search shape
// ============================================================================

#[test]
fn test_k_larger_than_live_count() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 2);
    engine
        .add_with_ids(vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![2.0, 0.0]], &[])
        .unwrap();
    engine.build_index(None, &CancelToken::new()).unwrap();
    engine.add_with_ids(vec![vec![3.0, 0.0]], &[]).unwrap();
    engine.delete_by_range(IdRange::new(2, 2)).unwrap();

    let hits = search_all(&engine, &[vec![0.0, 0.0]], 100);
    assert_eq!(ids(&hits[0]), vec![1, 3, 4]);
}

#[test]
fn test_search_with_id_ranges_is_union() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 1);
    engine
        .add_with_ids((1..=10).map(|i| vec![i as f32]).collect(), &[])
        .unwrap();
    let hits = engine
        .search(
            &[vec![0.0]],
            10,
            &SearchParams::default(),
            &[IdRange::new(2, 3), IdRange::new(8, 8)],
        )
        .unwrap();
    assert_eq!(ids(&hits[0]), vec![2, 3, 8]);
}

#[test]
fn test_search_rejects_wrong_query_dimension() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 3);
    assert!(matches!(
        engine.search(&[vec![0.0; 2]], 1, &SearchParams::default(), &[]),
        Err(Error::DimensionMismatch { expected: 3, got: 2 })
    ));
}

#[test]
fn test_inner_product_ranks_descending() {
    let dir = TempDir::new().unwrap();
    let engine = open_with(
        &dir,
        IndexDescriptor::flat(2, DistanceMetric::InnerProduct),
        EngineOptions::default(),
    );
    engine
        .add_with_ids(vec![vec![1.0, 0.0], vec![3.0, 0.0], vec![2.0, 0.0]], &[])
        .unwrap();
    let hits = search_all(&engine, &[vec![1.0, 0.0]], 3);
    assert_eq!(ids(&hits[0]), vec![2, 3, 1]);
    assert_eq!(hits[0][0].distance, 3.0);
}

// ============================================================================
// Seal / build / serialize
// ============================================================================

#[test]
fn test_active_segment_seals_at_index_file_size() {
    let dir = TempDir::new().unwrap();
    let engine = open_with(
        &dir,
        IndexDescriptor::flat(2, DistanceMetric::L2),
        EngineOptions {
            index_file_size: 4 * 16,
            ..EngineOptions::default()
        },
    );
    for i in 0..4 {
        engine.add_with_ids(vec![vec![i as f32, 0.0]], &[]).unwrap();
    }
    let segments = engine.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].state, SegmentState::Raw);
    assert_eq!(segments[0].count, 4);
    assert!(engine.has_pending_build());

    engine.add_with_ids(vec![vec![9.0, 0.0]], &[]).unwrap();
    assert_eq!(engine.segments().len(), 2);
    assert_eq!(engine.count(), 5);

    engine.build_sealed(&CancelToken::new()).unwrap();
    assert!(!engine.has_pending_build());
    let states: Vec<SegmentState> = engine.segments().iter().map(|s| s.state).collect();
    assert!(states.contains(&SegmentState::Persisted));
    assert!(states.contains(&SegmentState::Raw));
    assert_eq!(engine.count(), 5);
}

#[test]
fn test_serialize_then_reopen_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let queries = random_vectors(&mut rng, 5, 8);

    let (count, size, physical, before) = {
        let engine = open(&dir, 8);
        engine
            .add_with_ids(random_vectors(&mut rng, 200, 8), &[])
            .unwrap();
        engine.build_index(None, &CancelToken::new()).unwrap();
        engine.delete_by_range(IdRange::new(10, 19)).unwrap();
        (
            engine.count(),
            engine.size(),
            engine.physical_size(),
            search_all(&engine, &queries, 10),
        )
    };

    let engine = open(&dir, 8);
    assert_eq!(engine.count(), count);
    assert_eq!(count, 190);
    assert_eq!(engine.size(), size);
    assert_eq!(engine.physical_size(), physical);
    assert_eq!(search_all(&engine, &queries, 10), before);

    // Ids continue above everything seen before the restart.
    let next = engine.add_with_ids(vec![vec![0.0; 8]], &[]).unwrap();
    assert_eq!(next, vec![VectorId(201)]);
}

#[test]
fn test_ivf_round_trip_with_full_probe() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let queries = random_vectors(&mut rng, 4, 6);
    let ivf = IndexDescriptor::flat(6, DistanceMetric::L2).with_backend(BackendKind::IvfFlat, 4);
    let full = SearchParams { nprobe: 4 };

    let before = {
        let engine = open(&dir, 6);
        engine
            .add_with_ids(random_vectors(&mut rng, 120, 6), &[])
            .unwrap();
        let exact = search_all(&engine, &queries, 5);
        engine.build_index(Some(ivf), &CancelToken::new()).unwrap();
        assert_eq!(engine.describe_index(), ivf);
        let approx = engine.search(&queries, 5, &full, &[]).unwrap();
        assert_eq!(approx, exact);
        approx
    };

    let engine = open_with(&dir, ivf, EngineOptions::default());
    assert_eq!(engine.segments()[0].backend, BackendKind::IvfFlat);
    assert_eq!(engine.search(&queries, 5, &full, &[]).unwrap(), before);
}

#[test]
fn test_build_rejects_incompatible_descriptor() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 4);
    let other = IndexDescriptor::flat(4, DistanceMetric::InnerProduct);
    assert!(matches!(
        engine.build_index(Some(other), &CancelToken::new()),
        Err(Error::InvalidInput { .. })
    ));
    assert_eq!(engine.describe_index().metric, DistanceMetric::L2);
}

#[test]
fn test_cancelled_build_keeps_committed_state() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 2);
    engine
        .add_with_ids((0..20).map(|i| vec![i as f32, 1.0]).collect(), &[])
        .unwrap();
    let before = search_all(&engine, &[vec![3.0, 1.0]], 3);

    let token = CancelToken::new();
    token.cancel();
    let ivf = IndexDescriptor::flat(2, DistanceMetric::L2).with_backend(BackendKind::IvfFlat, 2);
    assert!(matches!(
        engine.build_index(Some(ivf), &token),
        Err(Error::Cancelled)
    ));
    assert_eq!(engine.describe_index().backend, BackendKind::Flat);
    assert_eq!(engine.count(), 20);
    assert!(sealed_locations(&engine).is_empty());
    assert_eq!(search_all(&engine, &[vec![3.0, 1.0]], 3), before);
}

#[test]
fn test_drop_index_rebuilds_as_flat() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let engine = open(&dir, 4);
    engine
        .add_with_ids(random_vectors(&mut rng, 40, 4), &[])
        .unwrap();
    let ivf = IndexDescriptor::flat(4, DistanceMetric::L2).with_backend(BackendKind::IvfFlat, 3);
    engine.build_index(Some(ivf), &CancelToken::new()).unwrap();
    let old = sealed_locations(&engine);

    engine.drop_index(&CancelToken::new()).unwrap();
    assert_eq!(engine.describe_index().backend, BackendKind::Flat);
    let segments = engine.segments();
    assert!(segments.iter().all(|s| s.backend == BackendKind::Flat));
    assert_eq!(engine.count(), 40);
    for location in old {
        assert!(!engine.store().exists(&location));
    }
}

// ============================================================================
// Merge
// ============================================================================

fn two_persisted_segments(engine: &EngineCore, rng: &mut StdRng, a: usize, b: usize) {
    let dim = engine.dimension();
    engine.add_with_ids(random_vectors(rng, a, dim), &[]).unwrap();
    engine.build_index(None, &CancelToken::new()).unwrap();
    engine.add_with_ids(random_vectors(rng, b, dim), &[]).unwrap();
    engine.build_index(None, &CancelToken::new()).unwrap();
}

#[test]
fn test_merge_sums_counts_and_preserves_exact_top_k() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    let engine = open(&dir, 5);
    two_persisted_segments(&engine, &mut rng, 30, 45);
    let queries = random_vectors(&mut rng, 6, 5);
    let before = search_all(&engine, &queries, 7);

    let sources = sealed_locations(&engine);
    assert_eq!(sources.len(), 2);
    let merged = engine.merge(&sources, &CancelToken::new()).unwrap();

    let segments = engine.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].location, merged);
    assert_eq!(segments[0].count, 75);
    assert_eq!(engine.count(), 75);
    assert_eq!(search_all(&engine, &queries, 7), before);
    for source in &sources {
        assert!(!engine.store().exists(source));
    }
}

#[test]
fn test_merge_drops_tombstones() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let engine = open(&dir, 3);
    two_persisted_segments(&engine, &mut rng, 10, 10);
    engine.delete_by_range(IdRange::new(5, 14)).unwrap();
    assert_eq!(engine.count(), 10);

    engine
        .merge(&sealed_locations(&engine), &CancelToken::new())
        .unwrap();
    let segments = engine.segments();
    assert_eq!(segments[0].count, 10);
    assert_eq!(segments[0].tombstones, 0);
    let hits = search_all(&engine, &random_vectors(&mut rng, 1, 3), 20);
    assert!(hits[0].iter().all(|h| !(5..=14).contains(&h.id.0)));
    assert_eq!(hits[0].len(), 10);
}

#[test]
fn test_merge_of_ivf_segments_rebuilds() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(8);
    let ivf = IndexDescriptor::flat(4, DistanceMetric::L2).with_backend(BackendKind::IvfFlat, 2);
    let engine = open_with(&dir, ivf, EngineOptions::default());
    two_persisted_segments(&engine, &mut rng, 20, 20);

    engine
        .merge(&sealed_locations(&engine), &CancelToken::new())
        .unwrap();
    let segments = engine.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].backend, BackendKind::IvfFlat);
    assert_eq!(engine.count(), 40);
}

#[test]
fn test_merge_conflicting_ids_fails_and_keeps_sources() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, 2);
    engine
        .add_with_ids(vec![vec![0.0, 0.0], vec![1.0, 0.0]], &[1, 2])
        .unwrap();
    engine.build_index(None, &CancelToken::new()).unwrap();
    engine
        .add_with_ids(vec![vec![2.0, 0.0], vec![3.0, 0.0]], &[2, 3])
        .unwrap();
    engine.build_index(None, &CancelToken::new()).unwrap();

    let sources = sealed_locations(&engine);
    assert!(matches!(
        engine.merge(&sources, &CancelToken::new()),
        Err(Error::MergeIdConflict { id: VectorId(2) })
    ));
    assert_eq!(sealed_locations(&engine), sources);
    assert_eq!(engine.count(), 4);
}

#[test]
fn test_merge_rejects_unknown_or_repeated_sources() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let engine = open(&dir, 2);
    two_persisted_segments(&engine, &mut rng, 3, 3);
    let sources = sealed_locations(&engine);

    assert!(matches!(
        engine.merge(&[sources[0].clone(), sources[0].clone()], &CancelToken::new()),
        Err(Error::InvalidInput { .. })
    ));
    assert!(matches!(
        engine.merge(&[SegmentLocation::new("missing")], &CancelToken::new()),
        Err(Error::InvalidInput { .. })
    ));
    assert!(matches!(
        engine.merge(&[], &CancelToken::new()),
        Err(Error::InvalidInput { .. })
    ));
}

#[test]
fn test_compact_merges_small_segments() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(2);
    let engine = open(&dir, 2);
    assert_eq!(engine.compact(&CancelToken::new()).unwrap(), None);

    two_persisted_segments(&engine, &mut rng, 4, 4);
    let merged = engine.compact(&CancelToken::new()).unwrap();
    assert!(merged.is_some());
    assert_eq!(sealed_locations(&engine), vec![merged.unwrap()]);
    assert_eq!(engine.compact(&CancelToken::new()).unwrap(), None);
}

// ============================================================================
// Cache residency
// ============================================================================

#[test]
fn test_preload_makes_segments_resident() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(4);
    {
        let engine = open(&dir, 4);
        two_persisted_segments(&engine, &mut rng, 10, 10);
    }

    let engine = open(&dir, 4);
    assert!(engine
        .segments()
        .iter()
        .all(|s| s.state == SegmentState::Persisted));

    let report = engine.preload().unwrap();
    assert_eq!(report.loaded, 2);
    assert!(!report.pressure);
    assert!(engine
        .segments()
        .iter()
        .all(|s| s.state == SegmentState::Resident));

    let again = engine.preload().unwrap();
    assert_eq!(again.loaded, 0);
    assert_eq!(again.already_resident, 2);
}

#[test]
fn test_preload_reports_pressure_on_tiny_cache() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(6);
    let store = Arc::new(SegmentStore::open(dir.path()).unwrap());
    let engine = EngineCore::open(
        "tiny",
        store,
        Arc::new(SegmentCache::new(1)),
        IndexDescriptor::flat(4, DistanceMetric::L2),
        EngineOptions::default(),
    )
    .unwrap();
    two_persisted_segments(&engine, &mut rng, 10, 10);

    let report = engine.preload().unwrap();
    assert!(report.pressure);
    // Searches still work with nothing resident.
    assert_eq!(search_all(&engine, &random_vectors(&mut rng, 1, 4), 3)[0].len(), 3);
}
