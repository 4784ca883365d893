//! The database facade: the collection/document model composed over the
//! scalar store and the vector-index manager.
//!
//! Collections persist as JSON at `collection:<name>`; document metadata
//! (everything except the vector) at `doc:<collection>:<id>`; the vector
//! itself lives in the collection's ANN index. Coordination across the two
//! stores happens here and only here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::Options;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::scalar::ScalarStorage;
use crate::vector::distance::Space;
use crate::vector::manager::IndexManager;
use crate::vector::{IndexConfig, IndexType, VectorIndex};

/// LRU over `search_vectors` results, used by the serving layer.
pub type QueryCache = moka::sync::Cache<String, (Vec<String>, Vec<f32>)>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub dimension: usize,
    #[serde(default)]
    pub index_type: IndexType,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Skipped when serialized as scalar metadata: the vector's home is the
    /// ANN index.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector: Vec<f32>,
    /// Free-form, the authoritative metadata store for the document.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dimension: usize,
}

#[derive(Clone, Debug, Default)]
pub struct CollectionOptions {
    pub name: String,
    pub dimension: usize,
    /// Defaults to `hnsw`.
    pub index_type: Option<String>,
    pub parameters: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

pub struct Database {
    opts: Options,
    scalar: ScalarStorage,
    indexes: IndexManager,
    cache: Option<QueryCache>,
    embedder: Option<Arc<dyn Embedder>>,
}

fn collection_key(name: &str) -> String {
    format!("collection:{name}")
}

fn doc_key(collection: &str, id: &str) -> String {
    format!("doc:{collection}:{id}")
}

impl Database {
    pub fn open(opts: Options) -> Result<Self> {
        opts.ensure_dirs()?;
        let scalar = ScalarStorage::open(opts.clone())?;
        let indexes = IndexManager::open(opts.clone())?;
        indexes.load_indexes()?;
        let cache = (opts.cache_size > 0).then(|| QueryCache::new(opts.cache_size));
        Ok(Self {
            opts,
            scalar,
            indexes,
            cache,
            embedder: None,
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /*----------------collection CRUD------------------*/

    pub fn create_collection(&self, co: &CollectionOptions) -> Result<Collection> {
        if co.name.is_empty() {
            return Err(Error::EmptyParameter("collection name".into()));
        }
        if co.dimension == 0 {
            return Err(Error::InvalidDimension(
                "collection dimension must be positive".into(),
            ));
        }
        let index_type: IndexType = co.index_type.as_deref().unwrap_or("hnsw").parse()?;
        let space: Space = match co.parameters.get("space") {
            Some(raw) => raw.parse()?,
            None => Space::L2,
        };

        let key = collection_key(&co.name);
        if self.scalar.get(key.as_bytes())?.1 {
            return Err(Error::CollectionExists(co.name.clone()));
        }

        let config = IndexConfig {
            index_type,
            dimension: co.dimension,
            space,
            parameters: co.parameters.clone(),
        };
        self.indexes.create_index(&co.name, &config)?;

        let collection = Collection {
            name: co.name.clone(),
            dimension: co.dimension,
            index_type,
            parameters: co.parameters.clone(),
            metadata: co.metadata.clone(),
        };
        self.scalar
            .put(key.as_bytes(), &serde_json::to_vec(&collection)?)?;
        Ok(collection)
    }

    pub fn get_collection(&self, name: &str) -> Result<Collection> {
        let (raw, found) = self.scalar.get(collection_key(name).as_bytes())?;
        if !found {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Live collections are whatever the index manager tracks; each one's
    /// scalar record is fetched for the response.
    pub fn list_collections(&self) -> Result<Vec<Collection>> {
        let mut out = Vec::new();
        for name in self.indexes.collections() {
            match self.get_collection(&name) {
                Ok(collection) => out.push(collection),
                Err(Error::CollectionNotFound(_)) => {
                    warn!(collection = %name, "index without collection record")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    pub fn delete_collection(&self, name: &str) -> Result<()> {
        self.get_collection(name)?;
        if let Err(err) = self.indexes.delete_index(name) {
            warn!(collection = name, %err, "index delete during collection delete");
        }
        self.scalar.delete(collection_key(name).as_bytes())
    }

    /*----------------document CRUD------------------*/

    pub fn upsert_document(&self, collection: &str, mut doc: Document) -> Result<()> {
        let meta = self.get_collection(collection)?;
        if doc.id.is_empty() {
            return Err(Error::EmptyParameter("document id".into()));
        }
        self.maybe_embed(&mut doc)?;
        if doc.vector.is_empty() {
            return Err(Error::EmptyParameter("document vector".into()));
        }
        if doc.vector.len() != meta.dimension {
            return Err(Error::InvalidDimension(format!(
                "collection {collection} expects {}, got {}",
                meta.dimension,
                doc.vector.len()
            )));
        }
        doc.dimension = doc.vector.len();

        let vector = std::mem::take(&mut doc.vector);
        self.scalar.put(
            doc_key(collection, &doc.id).as_bytes(),
            &serde_json::to_vec(&doc)?,
        )?;
        self.indexes.add_vector(collection, &doc.id, &vector)
    }

    pub fn get_document(&self, collection: &str, id: &str) -> Result<Document> {
        let (raw, found) = self.scalar.get(doc_key(collection, id).as_bytes())?;
        if !found {
            return Err(Error::DocumentNotFound(id.to_string()));
        }
        let mut doc: Document = serde_json::from_slice(&raw)?;
        let index = self.indexes.get_index(collection)?;
        let vector = index.read().vector(id);
        doc.vector = vector.ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        Ok(doc)
    }

    /// The scalar delete commits even when the ANN delete reports the
    /// vector missing, keeping document deletion idempotent.
    pub fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        self.get_collection(collection)?;
        self.scalar.delete(doc_key(collection, id).as_bytes())?;
        if let Err(err) = self.indexes.delete_vector(collection, id) {
            warn!(collection, id, %err, "vector delete after metadata delete");
        }
        Ok(())
    }

    /*----------------search------------------*/

    pub fn search_vectors(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<(Vec<String>, Vec<f32>)> {
        let meta = self.get_collection(collection)?;
        if query.len() != meta.dimension {
            return Err(Error::InvalidDimension(format!(
                "collection {collection} expects {}, got {}",
                meta.dimension,
                query.len()
            )));
        }
        let cache_key = self.cache.as_ref().map(|_| query_cache_key(collection, query, k));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.get(key) {
                return Ok(hit);
            }
        }
        let index = self.indexes.get_index(collection)?;
        let result = index.read().search(query, k)?;
        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.insert(key, result.clone());
        }
        Ok(result)
    }

    /// `filter` is accepted for the serving layer but not enforced here;
    /// it rides along opaquely.
    pub fn search_documents(
        &self,
        collection: &str,
        mut query: Document,
        k: usize,
        _filter: Option<serde_json::Value>,
    ) -> Result<(Vec<Document>, Vec<f32>)> {
        self.maybe_embed(&mut query)?;
        if query.vector.is_empty() {
            return Err(Error::EmptyParameter("query vector".into()));
        }
        let (ids, dists) = self.search_vectors(collection, &query.vector, k)?;
        let mut docs = Vec::with_capacity(ids.len());
        let mut kept = Vec::with_capacity(ids.len());
        for (id, dist) in ids.iter().zip(dists) {
            let (raw, found) = self.scalar.get(doc_key(collection, id).as_bytes())?;
            if !found {
                // tombstone asymmetry: the index can outlive the metadata
                warn!(collection, id = %id, "search hit without metadata, skipping");
                continue;
            }
            docs.push(serde_json::from_slice(&raw)?);
            kept.push(dist);
        }
        Ok((docs, kept))
    }

    /*----------------bulk paths------------------*/

    /// Validate every document, then batch-write metadata and vectors.
    /// `rebuild` routes the vectors through the index's bulk build instead
    /// of incremental insertion.
    fn bulk_upsert(&self, collection: &str, docs: Vec<Document>, rebuild: bool) -> Result<()> {
        let meta = self.get_collection(collection)?;
        let mut docs = docs;
        for doc in &mut docs {
            if doc.id.is_empty() {
                return Err(Error::EmptyParameter("document id".into()));
            }
            self.maybe_embed(doc)?;
            if doc.vector.len() != meta.dimension {
                return Err(Error::InvalidDimension(format!(
                    "document {}: collection {collection} expects {}, got {}",
                    doc.id,
                    meta.dimension,
                    doc.vector.len()
                )));
            }
            doc.dimension = doc.vector.len();
        }

        let mut ids = Vec::with_capacity(docs.len());
        let mut vectors = Vec::with_capacity(docs.len());
        let mut keys = Vec::with_capacity(docs.len());
        let mut values = Vec::with_capacity(docs.len());
        for doc in &mut docs {
            ids.push(doc.id.clone());
            vectors.push(std::mem::take(&mut doc.vector));
            keys.push(bytes::Bytes::from(doc_key(collection, &doc.id)));
            values.push(bytes::Bytes::from(serde_json::to_vec(&*doc)?));
        }
        self.scalar.batch_put(&keys, &values)?;
        if rebuild {
            self.indexes.build_index(collection, &ids, &vectors)
        } else {
            self.indexes.add_vector_batch(collection, &ids, &vectors)
        }
    }

    pub fn batch_upsert_documents(&self, collection: &str, docs: Vec<Document>) -> Result<()> {
        self.bulk_upsert(collection, docs, false)
    }

    /// Rebuild the collection's ANN index from the given documents.
    pub fn build_index(&self, collection: &str, docs: Vec<Document>) -> Result<()> {
        self.bulk_upsert(collection, docs, true)
    }

    /*----------------tuning & lifecycle------------------*/

    pub fn set_params(&self, collection: &str, params: &HashMap<String, String>) -> Result<()> {
        self.get_collection(collection)?;
        let index = self.indexes.get_index(collection)?;
        let mut index = index.write();
        index.set_params(params)
    }

    pub fn scalar_level_stats(&self) -> Vec<(usize, u64)> {
        self.scalar.level_stats()
    }

    pub fn close(&self) -> Result<()> {
        self.indexes.close()?;
        self.scalar.stop()
    }

    /// Optional embedding generation: `parameters.embedding == true` plus a
    /// `parameters.text` string and no supplied vector.
    fn maybe_embed(&self, doc: &mut Document) -> Result<()> {
        if !doc.vector.is_empty() {
            return Ok(());
        }
        let wants_embedding = matches!(
            doc.parameters.get("embedding"),
            Some(serde_json::Value::Bool(true))
        );
        let Some(serde_json::Value::String(text)) = doc.parameters.get("text") else {
            return Ok(());
        };
        if !wants_embedding {
            return Ok(());
        }
        let Some(embedder) = &self.embedder else {
            return Err(Error::InvalidParameter(
                "embedding requested but no provider is configured".into(),
            ));
        };
        let raw = embedder.embed(text)?;
        doc.vector = raw.into_iter().map(|x| x as f32).collect();
        doc.dimension = doc.vector.len();
        Ok(())
    }
}

fn query_cache_key(collection: &str, query: &[f32], k: usize) -> String {
    use std::fmt::Write;
    let mut key = format!("{collection}:{k}:");
    for v in query {
        let _ = write!(key, "{:08x}", v.to_bits());
    }
    key
}
