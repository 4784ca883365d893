//! Embedding-provider seam. Providers live outside this crate (HTTP
//! services, local models); the facade only needs text-to-vector calls. The
//! wire convention is f64, downcast to f32 at the storage boundary.

use crate::error::Result;

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f64>>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}
