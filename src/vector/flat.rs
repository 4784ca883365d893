//! Brute-force index: one contiguous float array scanned on every query.
//! Exact results, no tuning knobs, the baseline the ANN variants are
//! measured against.

use bytes::{Buf, BufMut};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::vector::distance::Space;
use crate::vector::{
    check_batch, check_dimension, get_f32s, get_string, put_f32s, put_string, read_snapshot,
    write_snapshot, IndexConfig, OrdF32, VectorIndex,
};

pub(crate) const SNAPSHOT_KIND: u8 = 0;

pub struct FlatIndex {
    space: Space,
    dim: usize,
    /// Row-major storage, `ids.len() * dim` floats.
    data: Vec<f32>,
    ids: Vec<String>,
    by_id: HashMap<String, usize>,
}

impl FlatIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        Ok(Self {
            space: config.space,
            dim: config.dimension,
            data: Vec::new(),
            ids: Vec::new(),
            by_id: HashMap::new(),
        })
    }

    fn row(&self, at: usize) -> &[f32] {
        &self.data[at * self.dim..(at + 1) * self.dim]
    }
}

impl VectorIndex for FlatIndex {
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        check_dimension(self.dim, vector.len())?;
        if let Some(&at) = self.by_id.get(id) {
            self.data[at * self.dim..(at + 1) * self.dim].copy_from_slice(vector);
            return Ok(());
        }
        self.by_id.insert(id.to_string(), self.ids.len());
        self.ids.push(id.to_string());
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Replaces the whole content.
    fn build(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(ids, vectors)?;
        self.data.clear();
        self.ids.clear();
        self.by_id.clear();
        self.add_batch(ids, vectors)
    }

    fn add_batch(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(ids, vectors)?;
        for (id, vector) in ids.iter().zip(vectors) {
            self.add(id, vector)?;
        }
        Ok(())
    }

    /// Removes the row, compacting the array; tail rows shift down and the
    /// id map is rebuilt for them.
    fn delete(&mut self, id: &str) -> Result<()> {
        let Some(at) = self.by_id.remove(id) else {
            return Err(Error::DocumentNotFound(id.to_string()));
        };
        self.data.drain(at * self.dim..(at + 1) * self.dim);
        self.ids.remove(at);
        for (row, id) in self.ids.iter().enumerate().skip(at) {
            self.by_id.insert(id.clone(), row);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<(Vec<String>, Vec<f32>)> {
        check_dimension(self.dim, query.len())?;
        let mut scored: Vec<(OrdF32, usize)> = self
            .data
            .par_chunks_exact(self.dim)
            .enumerate()
            .map(|(row, stored)| (OrdF32(self.space.distance(query, stored)), row))
            .collect();
        scored.sort();
        scored.truncate(k.min(self.ids.len()));
        Ok(scored
            .into_iter()
            .map(|(dist, row)| (self.ids[row].clone(), dist.0))
            .unzip())
    }

    fn vector(&self, id: &str) -> Option<Vec<f32>> {
        self.by_id.get(id).map(|&at| self.row(at).to_vec())
    }

    fn set_params(&mut self, params: &HashMap<String, String>) -> Result<()> {
        if let Some(key) = params.keys().next() {
            return Err(Error::InvalidParameter(format!(
                "flat index has no parameter {key}"
            )));
        }
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut body = Vec::new();
        body.put_u8(self.space.as_u8());
        body.put_u32_le(self.dim as u32);
        body.put_u64_le(self.ids.len() as u64);
        for id in &self.ids {
            put_string(&mut body, id);
        }
        put_f32s(&mut body, &self.data);
        write_snapshot(path, SNAPSHOT_KIND, &body)
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let body = read_snapshot(path, SNAPSHOT_KIND)?;
        let mut buf = &body[..];
        let space = Space::from_u8(buf.get_u8())
            .ok_or_else(|| Error::Corruption("unknown space tag".into()))?;
        let dim = buf.get_u32_le() as usize;
        if dim != self.dim {
            return Err(Error::FailedToLoadIndex(format!(
                "snapshot dimension {dim} does not match configured {}",
                self.dim
            )));
        }
        let count = buf.get_u64_le() as usize;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(get_string(&mut buf)?);
        }
        let data = get_f32s(&mut buf, count * dim)?;
        self.space = space;
        self.by_id = ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.clone(), row))
            .collect();
        self.ids = ids;
        self.data = data;
        Ok(())
    }

    fn close(&mut self) {
        self.data.clear();
        self.ids.clear();
        self.by_id.clear();
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dim: usize) -> IndexConfig {
        IndexConfig {
            index_type: crate::vector::IndexType::Flat,
            dimension: dim,
            space: Space::L2,
            parameters: HashMap::new(),
        }
    }

    #[test]
    fn test_add_search_exact_order() {
        let mut index = FlatIndex::new(&config(2)).unwrap();
        index.add("a", &[0.0, 0.0]).unwrap();
        index.add("b", &[1.0, 0.0]).unwrap();
        index.add("c", &[3.0, 0.0]).unwrap();
        let (ids, dists) = index.search(&[0.9, 0.0], 2).unwrap();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(dists[0] < dists[1]);
    }

    #[test]
    fn test_k_clamped_to_len() {
        let mut index = FlatIndex::new(&config(2)).unwrap();
        index.add("only", &[1.0, 1.0]).unwrap();
        let (ids, _) = index.search(&[0.0, 0.0], 10).unwrap();
        assert_eq!(ids, vec!["only"]);
    }

    #[test]
    fn test_delete_compacts_tail_rows() {
        let mut index = FlatIndex::new(&config(1)).unwrap();
        for (id, v) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            index.add(id, &[v]).unwrap();
        }
        index.delete("a").unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.vector("b"), Some(vec![2.0]));
        assert_eq!(index.vector("c"), Some(vec![3.0]));
        assert_eq!(index.vector("a"), None);
        assert!(matches!(
            index.delete("a"),
            Err(Error::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_add_overwrites_existing_id() {
        let mut index = FlatIndex::new(&config(1)).unwrap();
        index.add("a", &[1.0]).unwrap();
        index.add("a", &[9.0]).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.vector("a"), Some(vec![9.0]));
    }

    #[test]
    fn test_build_supersedes() {
        let mut index = FlatIndex::new(&config(1)).unwrap();
        index.add("old", &[1.0]).unwrap();
        index
            .build(&["x".into(), "y".into()], &[vec![1.0], vec![2.0]])
            .unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.vector("old"), None);
    }

    #[test]
    fn test_dimension_checked() {
        let mut index = FlatIndex::new(&config(3)).unwrap();
        assert!(matches!(
            index.add("a", &[1.0]),
            Err(Error::InvalidDimension(_))
        ));
        assert!(matches!(
            index.search(&[1.0], 1),
            Err(Error::InvalidDimension(_))
        ));
    }

    #[test]
    fn test_unknown_param_rejected() {
        let mut index = FlatIndex::new(&config(1)).unwrap();
        let params = HashMap::from([("efsearch".to_string(), "10".to_string())]);
        assert!(matches!(
            index.set_params(&params),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index_0.idx");
        let mut index = FlatIndex::new(&config(2)).unwrap();
        index.add("a", &[1.0, 2.0]).unwrap();
        index.add("b", &[3.0, 4.0]).unwrap();
        index.save(&path).unwrap();

        let mut restored = FlatIndex::new(&config(2)).unwrap();
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.vector("a"), Some(vec![1.0, 2.0]));
        let (ids, _) = restored.search(&[3.0, 4.0], 1).unwrap();
        assert_eq!(ids, vec!["b"]);

        let mut wrong_dim = FlatIndex::new(&config(3)).unwrap();
        assert!(matches!(
            wrong_dim.load(&path),
            Err(Error::FailedToLoadIndex(_))
        ));
    }
}
