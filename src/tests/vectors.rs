//! ANN scenarios through the database facade.

use std::collections::HashMap;
use tempfile::tempdir;

use super::harness::test_options;
use crate::db::{CollectionOptions, Database, Document};
use crate::error::Error;

fn doc(id: &str, vector: Vec<f32>) -> Document {
    Document {
        id: id.to_string(),
        vector,
        ..Default::default()
    }
}

fn collection(name: &str, dimension: usize, index_type: &str) -> CollectionOptions {
    CollectionOptions {
        name: name.to_string(),
        dimension,
        index_type: Some(index_type.to_string()),
        ..Default::default()
    }
}

#[test]
fn test_hnsw_top1() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    db.create_collection(&collection("vectors", 3, "hnsw")).unwrap();
    for (id, v) in [
        ("1", vec![1.0, 2.0, 3.0]),
        ("2", vec![4.0, 5.0, 6.0]),
        ("3", vec![7.0, 8.0, 9.0]),
        ("4", vec![10.0, 11.0, 12.0]),
    ] {
        db.upsert_document("vectors", doc(id, v)).unwrap();
    }
    let (ids, distances) = db.search_vectors("vectors", &[1.1, 2.1, 3.1], 2).unwrap();
    assert_eq!(ids[0], "1");
    assert_eq!(ids.len(), 2);
    assert!(distances[0] <= distances[1]);
    db.close().unwrap();
}

#[test]
fn test_flat_collection_round_trip() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    db.create_collection(&collection("flat", 2, "flat")).unwrap();
    db.upsert_document("flat", doc("a", vec![0.0, 0.0])).unwrap();
    db.upsert_document("flat", doc("b", vec![5.0, 5.0])).unwrap();
    let (ids, _) = db.search_vectors("flat", &[4.9, 5.2], 1).unwrap();
    assert_eq!(ids, vec!["b"]);
    db.close().unwrap();
}

#[test]
fn test_ivf_build_and_search() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    let mut co = collection("ivf", 2, "ivf_flat");
    co.parameters.insert("nlist".into(), "2".into());
    db.create_collection(&co).unwrap();

    let docs: Vec<Document> = (0..40)
        .map(|i| {
            let base = if i % 2 == 0 { 0.0 } else { 50.0 };
            doc(&format!("d{i}"), vec![base + i as f32 * 0.01, base])
        })
        .collect();
    db.build_index("ivf", docs).unwrap();

    db.set_params("ivf", &HashMap::from([("nprobe".into(), "2".into())]))
        .unwrap();
    let (ids, _) = db.search_vectors("ivf", &[50.1, 50.0], 3).unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| {
        let n: usize = id[1..].parse().unwrap();
        n % 2 == 1
    }));
    db.close().unwrap();
}

#[test]
fn test_search_dimension_mismatch() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    db.create_collection(&collection("vectors", 3, "hnsw")).unwrap();
    assert!(matches!(
        db.search_vectors("vectors", &[1.0, 2.0], 1),
        Err(Error::InvalidDimension(_))
    ));
    db.close().unwrap();
}

#[test]
fn test_set_params_unknown_key() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    db.create_collection(&collection("vectors", 3, "hnsw")).unwrap();
    db.set_params("vectors", &HashMap::from([("efsearch".into(), "32".into())]))
        .unwrap();
    assert!(matches!(
        db.set_params("vectors", &HashMap::from([("bogus".into(), "1".into())])),
        Err(Error::InvalidParameter(_))
    ));
    db.close().unwrap();
}

#[test]
fn test_vectors_survive_restart() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(test_options(&dir)).unwrap();
        db.create_collection(&collection("vectors", 3, "hnsw")).unwrap();
        for (id, v) in [("1", vec![1.0, 2.0, 3.0]), ("2", vec![4.0, 5.0, 6.0])] {
            db.upsert_document("vectors", doc(id, v)).unwrap();
        }
        db.close().unwrap();
    }
    let db = Database::open(test_options(&dir)).unwrap();
    let restored = db.get_document("vectors", "1").unwrap();
    assert_eq!(restored.vector, vec![1.0, 2.0, 3.0]);
    let (ids, _) = db.search_vectors("vectors", &[4.0, 5.0, 6.0], 1).unwrap();
    assert_eq!(ids, vec!["2"]);
    db.close().unwrap();
}
