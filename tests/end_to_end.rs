//! End-to-end test through the public facade

use tempfile::TempDir;
use tessera::{
    BackendKind, DistanceMetric, Error, IdRange, IndexParam, Session, TableSchema, VectorId,
};

fn grid(n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| vec![(i % 10) as f32, (i / 10) as f32, 0.0])
        .collect()
}

#[test]
fn test_table_survives_restart_with_index_and_deletes() {
    let dir = TempDir::new().unwrap();
    {
        let session = Session::open(dir.path()).unwrap();
        session
            .create_table(TableSchema::new("grid", 3, DistanceMetric::L2))
            .unwrap();
        let ids = session.insert("grid", grid(100), &[]).unwrap();
        assert_eq!(ids.len(), 100);

        session
            .create_index("grid", IndexParam::ivf_flat(8))
            .unwrap();
        // (3, 4) is id 44; (5, 5) is id 56.
        assert_eq!(
            session
                .delete_by_range("grid", IdRange::new(44, 44))
                .unwrap(),
            1
        );
        let hits = session
            .search("grid", &[vec![5.0, 5.0, 0.0]], &[], 1, Some(8))
            .unwrap();
        assert_eq!(hits[0][0].id, VectorId(56));
        assert_eq!(hits[0][0].distance, 0.0);
    }

    let session = Session::open(dir.path()).unwrap();
    assert_eq!(session.count_table("grid").unwrap(), 99);
    assert_eq!(
        session.describe_index("grid").unwrap().backend,
        BackendKind::IvfFlat
    );
    let hits = session
        .search("grid", &[vec![3.0, 4.0, 0.0]], &[], 5, Some(8))
        .unwrap();
    assert_eq!(hits[0].len(), 5);
    assert!(hits[0].iter().all(|h| h.id != VectorId(44)));
    assert!(hits[0].windows(2).all(|w| w[0].distance <= w[1].distance));

    let info = session.table_info("grid").unwrap();
    assert_eq!(info.count, 99);
    assert!(info.corrupted.is_empty());
}

#[test]
fn test_errors_surface_through_facade() {
    let dir = TempDir::new().unwrap();
    let mut session = Session::open(dir.path()).unwrap();
    assert!(matches!(
        session.count_table("nope"),
        Err(Error::TableNotFound { .. })
    ));
    session
        .create_table(TableSchema::new("t", 2, DistanceMetric::InnerProduct))
        .unwrap();
    assert!(matches!(
        session.create_table(TableSchema::new("t", 2, DistanceMetric::L2)),
        Err(Error::TableAlreadyExists { .. })
    ));
    session.disconnect().unwrap();
    assert!(matches!(session.show_tables(), Err(Error::NotConnected)));
}
