//! OasisDB: a single-node vector database.
//!
//! Documents pair an opaque id, a fixed-dimension f32 vector and free-form
//! parameters. Metadata rides an LSM tree (WAL, skip-list memtable, leveled
//! bloom-filtered SSTables); vectors ride a per-collection ANN index (HNSW,
//! IVF-Flat or Flat) with its own WAL and asynchronous snapshots. The
//! [`Database`] facade composes the two stores.
//!
//! ```no_run
//! use oasisdb::{CollectionOptions, Database, Document, Options};
//!
//! let db = Database::open(Options::new("/tmp/oasis")?)?;
//! db.create_collection(&CollectionOptions {
//!     name: "articles".into(),
//!     dimension: 3,
//!     ..Default::default()
//! })?;
//! db.upsert_document(
//!     "articles",
//!     Document {
//!         id: "a1".into(),
//!         vector: vec![0.1, 0.2, 0.3],
//!         ..Default::default()
//!     },
//! )?;
//! let (ids, distances) = db.search_vectors("articles", &[0.1, 0.2, 0.3], 1)?;
//! # assert_eq!(ids.len(), 1);
//! # let _ = distances;
//! # Ok::<(), oasisdb::Error>(())
//! ```

pub mod codec;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod id;
pub mod lsm_storage;
pub mod mem_table;
pub mod scalar;
pub mod table;
pub mod vector;
pub mod wal;

mod compact;

pub use config::Options;
pub use db::{Collection, CollectionOptions, Database, Document};
pub use embedding::Embedder;
pub use error::{Error, Result};
pub use vector::distance::Space;
pub use vector::{IndexConfig, IndexType, VectorIndex};

#[cfg(test)]
mod tests;
