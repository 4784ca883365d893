//! Collection and document lifecycle through the facade.

use std::sync::Arc;
use tempfile::tempdir;

use super::harness::test_options;
use crate::db::{CollectionOptions, Database, Document};
use crate::embedding::Embedder;
use crate::error::{Error, Result};

fn hnsw_collection(name: &str, dimension: usize) -> CollectionOptions {
    CollectionOptions {
        name: name.to_string(),
        dimension,
        index_type: Some("hnsw".to_string()),
        ..Default::default()
    }
}

#[test]
fn test_collection_lifecycle() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();

    let created = db
        .create_collection(&hnsw_collection("test_collection", 128))
        .unwrap();
    assert_eq!(created.dimension, 128);

    assert!(matches!(
        db.create_collection(&hnsw_collection("test_collection", 128)),
        Err(Error::CollectionExists(_))
    ));

    let fetched = db.get_collection("test_collection").unwrap();
    assert_eq!(fetched.name, "test_collection");
    assert_eq!(fetched.dimension, 128);
    assert_eq!(fetched.index_type, crate::vector::IndexType::Hnsw);

    db.delete_collection("test_collection").unwrap();
    assert!(matches!(
        db.get_collection("test_collection"),
        Err(Error::CollectionNotFound(_))
    ));
    assert!(matches!(
        db.delete_collection("test_collection"),
        Err(Error::CollectionNotFound(_))
    ));
    db.close().unwrap();
}

#[test]
fn test_collection_validation() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    assert!(matches!(
        db.create_collection(&hnsw_collection("", 8)),
        Err(Error::EmptyParameter(_))
    ));
    assert!(matches!(
        db.create_collection(&hnsw_collection("zero", 0)),
        Err(Error::InvalidDimension(_))
    ));
    let mut co = hnsw_collection("weird", 8);
    co.index_type = Some("btree".to_string());
    assert!(matches!(
        db.create_collection(&co),
        Err(Error::UnsupportedIndexType(_))
    ));
    db.close().unwrap();
}

#[test]
fn test_document_round_trip() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    db.create_collection(&hnsw_collection("docs", 3)).unwrap();

    let mut doc = Document {
        id: "doc1".to_string(),
        vector: vec![1.0, 2.0, 3.0],
        ..Default::default()
    };
    doc.parameters
        .insert("tag".to_string(), serde_json::Value::String("test".into()));
    db.upsert_document("docs", doc).unwrap();

    let fetched = db.get_document("docs", "doc1").unwrap();
    assert_eq!(fetched.id, "doc1");
    assert_eq!(fetched.vector, vec![1.0, 2.0, 3.0]);
    assert_eq!(fetched.dimension, 3);
    assert_eq!(
        fetched.parameters.get("tag"),
        Some(&serde_json::Value::String("test".into()))
    );

    let (ids, _) = db.search_vectors("docs", &[1.0, 2.0, 3.0], 1).unwrap();
    assert_eq!(ids, vec!["doc1"]);

    db.delete_document("docs", "doc1").unwrap();
    assert!(matches!(
        db.get_document("docs", "doc1"),
        Err(Error::DocumentNotFound(_))
    ));
    // document delete is idempotent even though the vector is already gone
    db.delete_document("docs", "doc1").unwrap();
    db.close().unwrap();
}

#[test]
fn test_upsert_validation() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    db.create_collection(&hnsw_collection("docs", 3)).unwrap();

    let bad_dim = Document {
        id: "x".to_string(),
        vector: vec![1.0],
        ..Default::default()
    };
    assert!(matches!(
        db.upsert_document("docs", bad_dim),
        Err(Error::InvalidDimension(_))
    ));

    let no_vector = Document {
        id: "x".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        db.upsert_document("docs", no_vector),
        Err(Error::EmptyParameter(_))
    ));

    assert!(matches!(
        db.upsert_document(
            "missing",
            Document {
                id: "x".to_string(),
                vector: vec![1.0, 2.0, 3.0],
                ..Default::default()
            }
        ),
        Err(Error::CollectionNotFound(_))
    ));
    db.close().unwrap();
}

#[test]
fn test_batch_upsert_and_document_search() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir)).unwrap();
    db.create_collection(&hnsw_collection("docs", 2)).unwrap();

    let docs: Vec<Document> = (0..20)
        .map(|i| Document {
            id: format!("doc{i}"),
            vector: vec![i as f32, i as f32],
            ..Default::default()
        })
        .collect();
    db.batch_upsert_documents("docs", docs).unwrap();

    let query = Document {
        vector: vec![10.2, 10.1],
        ..Default::default()
    };
    let (found, distances) = db.search_documents("docs", query, 3, None).unwrap();
    assert_eq!(found.len(), 3);
    assert_eq!(found[0].id, "doc10");
    assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    db.close().unwrap();
}

#[test]
fn test_documents_survive_restart() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(test_options(&dir)).unwrap();
        db.create_collection(&hnsw_collection("docs", 2)).unwrap();
        db.upsert_document(
            "docs",
            Document {
                id: "persisted".to_string(),
                vector: vec![0.5, 0.7],
                ..Default::default()
            },
        )
        .unwrap();
        db.close().unwrap();
    }
    let db = Database::open(test_options(&dir)).unwrap();
    let collections = db.list_collections().unwrap();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].name, "docs");
    let doc = db.get_document("docs", "persisted").unwrap();
    assert_eq!(doc.vector, vec![0.5, 0.7]);
    db.close().unwrap();
}

struct StubEmbedder;

impl Embedder for StubEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f64>> {
        // length-sensitive deterministic vector
        Ok(vec![text.len() as f64, 1.0, 2.0])
    }
}

#[test]
fn test_embedding_provider_path() {
    let dir = tempdir().unwrap();
    let db = Database::open(test_options(&dir))
        .unwrap()
        .with_embedder(Arc::new(StubEmbedder));
    db.create_collection(&hnsw_collection("docs", 3)).unwrap();

    let mut doc = Document {
        id: "embedded".to_string(),
        ..Default::default()
    };
    doc.parameters
        .insert("embedding".to_string(), serde_json::Value::Bool(true));
    doc.parameters
        .insert("text".to_string(), serde_json::Value::String("hello".into()));
    db.upsert_document("docs", doc).unwrap();

    let fetched = db.get_document("docs", "embedded").unwrap();
    assert_eq!(fetched.vector, vec![5.0, 1.0, 2.0]);

    // query documents by text through the same provider
    let mut query = Document::default();
    query
        .parameters
        .insert("embedding".to_string(), serde_json::Value::Bool(true));
    query
        .parameters
        .insert("text".to_string(), serde_json::Value::String("howdy".into()));
    let (found, _) = db.search_documents("docs", query, 1, None).unwrap();
    assert_eq!(found[0].id, "embedded");
    db.close().unwrap();
}

#[test]
fn test_query_cache_serves_results() {
    let dir = tempdir().unwrap();
    let mut opts = test_options(&dir);
    opts.cache_size = 64;
    let db = Database::open(opts).unwrap();
    db.create_collection(&hnsw_collection("docs", 2)).unwrap();
    db.upsert_document(
        "docs",
        Document {
            id: "a".to_string(),
            vector: vec![1.0, 1.0],
            ..Default::default()
        },
    )
    .unwrap();
    let first = db.search_vectors("docs", &[1.0, 1.0], 1).unwrap();
    let second = db.search_vectors("docs", &[1.0, 1.0], 1).unwrap();
    assert_eq!(first, second);
    db.close().unwrap();
}
