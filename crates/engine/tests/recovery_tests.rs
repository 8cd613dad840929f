//! Crash recovery tests
//!
//! Simulate crashes by dropping the engine (or hand-crafting the on-disk
//! leftovers of an interrupted operation) and reopening the directory.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{
    DistanceMetric, IdRange, IndexDescriptor, SearchParams, SegmentLocation, SegmentState,
    VectorId, VectorRecord,
};
use tessera_engine::{CancelToken, EngineCore, EngineOptions, SegmentCache};
use tessera_storage::{
    AppendLog, DurabilityMode, LogEntry, SegmentMeta, SegmentStore, SEGMENT_META_FILE,
};

fn open(dir: &TempDir) -> EngineCore {
    let store = Arc::new(SegmentStore::open(dir.path()).unwrap());
    EngineCore::open(
        "recover",
        store,
        Arc::new(SegmentCache::new(1 << 20)),
        IndexDescriptor::flat(2, DistanceMetric::L2),
        EngineOptions {
            durability: DurabilityMode::Always,
            ..EngineOptions::default()
        },
    )
    .unwrap()
}

fn points(n: usize) -> Vec<Vec<f32>> {
    (0..n).map(|i| vec![i as f32, 0.0]).collect()
}

fn nearest(engine: &EngineCore, x: f32) -> Option<u64> {
    engine
        .search(&[vec![x, 0.0]], 1, &SearchParams::default(), &[])
        .unwrap()[0]
        .first()
        .map(|h| h.id.0)
}

fn persisted(engine: &EngineCore) -> Vec<SegmentLocation> {
    engine
        .segments()
        .into_iter()
        .filter(|s| matches!(s.state, SegmentState::Persisted | SegmentState::Resident))
        .map(|s| s.location)
        .collect()
}

#[test]
fn test_unbuilt_inserts_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.add_with_ids(points(10), &[]).unwrap();
        engine.delete_by_range(IdRange::new(3, 4)).unwrap();
        // Dropped without build or serialize.
    }

    let engine = open(&dir);
    assert_eq!(engine.count(), 8);
    // Ids 3 and 4 hold 2.0 and 3.0.
    assert_eq!(nearest(&engine, 3.0), Some(5));
    let segments = engine.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].state, SegmentState::Raw);
    assert!(engine.has_pending_build());

    // Recovered segments are sealed; new inserts go to a fresh segment.
    let next = engine.add_with_ids(points(1), &[]).unwrap();
    assert_eq!(next, vec![VectorId(11)]);

    engine.build_sealed(&CancelToken::new()).unwrap();
    assert_eq!(persisted(&engine).len(), 1);
    assert_eq!(engine.count(), 9);
}

#[test]
fn test_torn_log_tail_is_dropped() {
    let dir = TempDir::new().unwrap();
    let log_path = {
        let engine = open(&dir);
        engine.add_with_ids(points(5), &[]).unwrap();
        engine.add_with_ids(points(5), &[]).unwrap();
        let location = engine.segments()[0].location.clone();
        engine.store().log_path(&location)
    };

    // Half-written frame at the end of the log.
    let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
    file.write_all(&[0x40, 0x00, 0x00, 0x00, 0x91, 0x01]).unwrap();
    drop(file);

    let engine = open(&dir);
    assert_eq!(engine.count(), 10);
    assert_eq!(nearest(&engine, 4.0), Some(5));
}

#[test]
fn test_uncommitted_segment_directory_is_swept() {
    let dir = TempDir::new().unwrap();
    let orphan = SegmentLocation::generate();
    {
        let engine = open(&dir);
        engine.add_with_ids(points(4), &[]).unwrap();
        engine.build_index(None, &CancelToken::new()).unwrap();

        // Payload written, crash before the metadata rename.
        let orphan_dir = engine.store().segment_dir(&orphan);
        fs::create_dir_all(&orphan_dir).unwrap();
        fs::write(orphan_dir.join("payload-0.bin"), b"partial").unwrap();
    }

    let engine = open(&dir);
    assert!(!engine.store().segment_dir(&orphan).exists());
    assert_eq!(engine.count(), 4);
    assert_eq!(persisted(&engine).len(), 1);
}

#[test]
fn test_committed_replacement_deletes_superseded_source() {
    let dir = TempDir::new().unwrap();
    let (source, replacement) = {
        let engine = open(&dir);
        engine.add_with_ids(points(6), &[]).unwrap();
        engine.build_index(None, &CancelToken::new()).unwrap();
        let source = persisted(&engine)[0].clone();

        // A rebuild that committed its output, then crashed before
        // deleting the version it replaces.
        let store = engine.store();
        let meta = store.read_meta(&source).unwrap();
        let payload = store.read_payload(&meta, &meta.payloads[0]).unwrap();
        let mut next = SegmentMeta::new(
            SegmentLocation::generate(),
            meta.descriptor,
            meta.count,
            meta.min_id,
            meta.max_id,
        );
        next.supersedes = vec![source.clone()];
        store.commit(&next, &[payload.as_slice()]).unwrap();
        (source, next.location)
    };

    let engine = open(&dir);
    assert!(!engine.store().exists(&source));
    assert_eq!(persisted(&engine), vec![replacement]);
    assert_eq!(engine.count(), 6);
}

#[test]
fn test_log_of_committed_segment_is_discarded() {
    let dir = TempDir::new().unwrap();
    let location = {
        let engine = open(&dir);
        engine.add_with_ids(points(3), &[]).unwrap();
        engine.build_index(None, &CancelToken::new()).unwrap();
        let location = persisted(&engine)[0].clone();

        // Crash between the commit and the log removal.
        let mut log =
            AppendLog::open(engine.store().log_path(&location), DurabilityMode::Always).unwrap();
        log.append(&LogEntry::Insert {
            records: vec![
                VectorRecord::new(1u64, vec![0.0, 0.0]),
                VectorRecord::new(2u64, vec![1.0, 0.0]),
                VectorRecord::new(3u64, vec![2.0, 0.0]),
            ],
        })
        .unwrap();
        location
    };

    let engine = open(&dir);
    assert_eq!(engine.count(), 3);
    assert!(!engine.store().log_path(&location).exists());
}

#[test]
fn test_corrupted_metadata_is_reported_not_deleted() {
    let dir = TempDir::new().unwrap();
    let (bad, bad_count, meta_path) = {
        let engine = open(&dir);
        engine.add_with_ids(points(3), &[]).unwrap();
        engine.build_index(None, &CancelToken::new()).unwrap();
        engine.add_with_ids(points(2), &[]).unwrap();
        engine.build_index(None, &CancelToken::new()).unwrap();
        let info = engine.segments().remove(0);
        let meta_path = engine.store().segment_dir(&info.location).join(SEGMENT_META_FILE);
        (info.location, info.count, meta_path)
    };
    let mut bytes = fs::read(&meta_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&meta_path, bytes).unwrap();

    let engine = open(&dir);
    let corrupted = engine.corrupted_segments();
    assert_eq!(corrupted.len(), 1);
    assert_eq!(corrupted[0].0, bad);
    assert!(meta_path.exists());
    assert_eq!(persisted(&engine).len(), 1);
    assert_eq!(engine.count(), 5 - bad_count);
}

#[test]
fn test_merge_result_survives_restart() {
    let dir = TempDir::new().unwrap();
    let merged = {
        let engine = open(&dir);
        engine.add_with_ids(points(5), &[]).unwrap();
        engine.build_index(None, &CancelToken::new()).unwrap();
        engine.add_with_ids(points(5), &[]).unwrap();
        engine.build_index(None, &CancelToken::new()).unwrap();
        let sources = persisted(&engine);
        engine.merge(&sources, &CancelToken::new()).unwrap()
    };

    let engine = open(&dir);
    assert_eq!(persisted(&engine), vec![merged]);
    assert_eq!(engine.count(), 10);
}
