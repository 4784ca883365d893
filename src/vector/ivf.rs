//! Inverted-file index: k-means cells over the configured space, probed
//! nearest-first. Must be trained before incremental adds; `build` trains
//! and adds in one shot.

use bytes::{Buf, BufMut};
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::vector::distance::Space;
use crate::vector::{
    check_batch, check_dimension, get_f32s, get_string, param_usize, put_f32s, put_string,
    read_snapshot, write_snapshot, IndexConfig, OrdF32, VectorIndex,
};

pub(crate) const SNAPSHOT_KIND: u8 = 2;

pub const DEFAULT_NLIST: usize = 100;
pub const DEFAULT_NPROBE: usize = 1;
const KMEANS_ITERATIONS: usize = 10;

#[derive(Default, Clone)]
struct InvertedList {
    ids: Vec<String>,
    data: Vec<f32>,
}

pub struct IvfFlatIndex {
    space: Space,
    dim: usize,
    nlist: usize,
    nprobe: usize,
    trained: bool,
    /// `lists.len() * dim` floats once trained.
    centroids: Vec<f32>,
    lists: Vec<InvertedList>,
    /// id -> list holding it.
    locations: HashMap<String, usize>,
}

impl IvfFlatIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let nlist = param_usize(&config.parameters, "nlist")?.unwrap_or(DEFAULT_NLIST);
        let nprobe = param_usize(&config.parameters, "nprobe")?.unwrap_or(DEFAULT_NPROBE);
        Ok(Self {
            space: config.space,
            dim: config.dimension,
            nlist,
            nprobe,
            trained: false,
            centroids: Vec::new(),
            lists: Vec::new(),
            locations: HashMap::new(),
        })
    }

    /// Lloyd's k-means over the training vectors. The cell count shrinks to
    /// the sample size when fewer vectors than `nlist` are supplied.
    pub fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.is_empty() {
            return Err(Error::EmptyParameter("training vectors".into()));
        }
        for v in vectors {
            check_dimension(self.dim, v.len())?;
        }
        let cells = self.nlist.min(vectors.len()).max(1);

        let mut rng = rand::thread_rng();
        let mut seeds: Vec<&Vec<f32>> = vectors.iter().collect();
        seeds.shuffle(&mut rng);
        let mut centroids: Vec<Vec<f32>> = seeds.into_iter().take(cells).cloned().collect();

        let mut assignment = vec![0usize; vectors.len()];
        for _ in 0..KMEANS_ITERATIONS {
            let mut moved = false;
            for (i, v) in vectors.iter().enumerate() {
                let best = nearest_centroid(&centroids, self.space, v);
                if assignment[i] != best {
                    assignment[i] = best;
                    moved = true;
                }
            }
            let mut sums = vec![vec![0.0f32; self.dim]; cells];
            let mut counts = vec![0usize; cells];
            for (i, v) in vectors.iter().enumerate() {
                counts[assignment[i]] += 1;
                for (s, x) in sums[assignment[i]].iter_mut().zip(v) {
                    *s += x;
                }
            }
            for (cell, sum) in sums.into_iter().enumerate() {
                if counts[cell] > 0 {
                    centroids[cell] = sum.iter().map(|s| s / counts[cell] as f32).collect();
                }
                // an empty cell keeps its previous centroid
            }
            if !moved {
                break;
            }
        }

        self.centroids = centroids.into_iter().flatten().collect();
        self.lists = vec![InvertedList::default(); cells];
        self.locations.clear();
        self.trained = true;
        Ok(())
    }

    fn cells(&self) -> usize {
        self.lists.len()
    }

    fn centroid(&self, cell: usize) -> &[f32] {
        &self.centroids[cell * self.dim..(cell + 1) * self.dim]
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], space: Space, v: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| OrdF32(space.distance(c, v)))
        .map(|(cell, _)| cell)
        .unwrap_or(0)
}

impl VectorIndex for IvfFlatIndex {
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        if !self.trained {
            return Err(Error::InvalidParameter(
                "ivf index requires training before add".into(),
            ));
        }
        check_dimension(self.dim, vector.len())?;
        if self.locations.contains_key(id) {
            self.delete(id)?;
        }
        let cell = (0..self.cells())
            .min_by_key(|&c| OrdF32(self.space.distance(self.centroid(c), vector)))
            .unwrap_or(0);
        let list = &mut self.lists[cell];
        list.ids.push(id.to_string());
        list.data.extend_from_slice(vector);
        self.locations.insert(id.to_string(), cell);
        Ok(())
    }

    /// Train on the batch, then add everything.
    fn build(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(ids, vectors)?;
        self.train(vectors)?;
        self.add_batch(ids, vectors)
    }

    fn add_batch(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(ids, vectors)?;
        for (id, vector) in ids.iter().zip(vectors) {
            self.add(id, vector)?;
        }
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        let Some(cell) = self.locations.remove(id) else {
            return Err(Error::DocumentNotFound(id.to_string()));
        };
        let list = &mut self.lists[cell];
        if let Some(row) = list.ids.iter().position(|x| x == id) {
            list.ids.remove(row);
            list.data.drain(row * self.dim..(row + 1) * self.dim);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<(Vec<String>, Vec<f32>)> {
        check_dimension(self.dim, query.len())?;
        if !self.trained {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut cells: Vec<(OrdF32, usize)> = (0..self.cells())
            .map(|c| (OrdF32(self.space.distance(self.centroid(c), query)), c))
            .collect();
        cells.sort();
        cells.truncate(self.nprobe.max(1));

        let mut scored: Vec<(OrdF32, &String)> = cells
            .par_iter()
            .flat_map(|&(_, cell)| {
                let list = &self.lists[cell];
                list.data
                    .par_chunks_exact(self.dim)
                    .enumerate()
                    .map(move |(row, stored)| {
                        (OrdF32(self.space.distance(query, stored)), &list.ids[row])
                    })
            })
            .collect();
        scored.sort();
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(dist, id)| (id.clone(), dist.0))
            .unzip())
    }

    fn vector(&self, id: &str) -> Option<Vec<f32>> {
        let &cell = self.locations.get(id)?;
        let list = &self.lists[cell];
        let row = list.ids.iter().position(|x| x == id)?;
        Some(list.data[row * self.dim..(row + 1) * self.dim].to_vec())
    }

    fn set_params(&mut self, params: &HashMap<String, String>) -> Result<()> {
        for key in params.keys() {
            match key.as_str() {
                "nprobe" => {
                    self.nprobe = param_usize(params, "nprobe")?.unwrap();
                }
                other => {
                    return Err(Error::InvalidParameter(format!(
                        "ivf index has no parameter {other}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut body = Vec::new();
        body.put_u8(self.space.as_u8());
        body.put_u32_le(self.dim as u32);
        body.put_u32_le(self.nlist as u32);
        body.put_u32_le(self.nprobe as u32);
        body.put_u8(self.trained as u8);
        body.put_u32_le(self.cells() as u32);
        put_f32s(&mut body, &self.centroids);
        for list in &self.lists {
            body.put_u64_le(list.ids.len() as u64);
            for id in &list.ids {
                put_string(&mut body, id);
            }
            put_f32s(&mut body, &list.data);
        }
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
        let nlist = buf.get_u32_le() as usize;
        let nprobe = buf.get_u32_le() as usize;
        let trained = buf.get_u8() == 1;
        let cells = buf.get_u32_le() as usize;
        let centroids = get_f32s(&mut buf, cells * dim)?;
        let mut lists = Vec::with_capacity(cells);
        let mut locations = HashMap::new();
        for cell in 0..cells {
            let count = buf.get_u64_le() as usize;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                let id = get_string(&mut buf)?;
                locations.insert(id.clone(), cell);
                ids.push(id);
            }
            let data = get_f32s(&mut buf, count * dim)?;
            lists.push(InvertedList { ids, data });
        }
        self.space = space;
        self.nlist = nlist;
        self.nprobe = nprobe;
        self.trained = trained;
        self.centroids = centroids;
        self.lists = lists;
        self.locations = locations;
        Ok(())
    }

    fn close(&mut self) {
        self.centroids.clear();
        self.lists.clear();
        self.locations.clear();
        self.trained = false;
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.locations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dim: usize, nlist: usize) -> IndexConfig {
        IndexConfig {
            index_type: crate::vector::IndexType::IvfFlat,
            dimension: dim,
            space: Space::L2,
            parameters: HashMap::from([("nlist".to_string(), nlist.to_string())]),
        }
    }

    fn clustered() -> (Vec<String>, Vec<Vec<f32>>) {
        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        for i in 0..30 {
            ids.push(format!("low_{i}"));
            vectors.push(vec![i as f32 * 0.01, 0.0]);
            ids.push(format!("high_{i}"));
            vectors.push(vec![100.0 + i as f32 * 0.01, 0.0]);
        }
        (ids, vectors)
    }

    #[test]
    fn test_add_requires_training() {
        let mut index = IvfFlatIndex::new(&config(2, 4)).unwrap();
        assert!(matches!(
            index.add("a", &[1.0, 2.0]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_build_trains_and_searches() {
        let mut index = IvfFlatIndex::new(&config(2, 2)).unwrap();
        let (ids, vectors) = clustered();
        index.build(&ids, &vectors).unwrap();
        assert_eq!(index.len(), 60);

        let (found, dists) = index.search(&[100.05, 0.0], 3).unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|id| id.starts_with("high_")));
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_search_before_training_is_empty() {
        let index = IvfFlatIndex::new(&config(2, 2)).unwrap();
        let (ids, dists) = index.search(&[1.0, 2.0], 5).unwrap();
        assert!(ids.is_empty() && dists.is_empty());
    }

    #[test]
    fn test_delete_and_readd() {
        let mut index = IvfFlatIndex::new(&config(2, 2)).unwrap();
        let (ids, vectors) = clustered();
        index.build(&ids, &vectors).unwrap();
        index.delete("low_0").unwrap();
        assert_eq!(index.vector("low_0"), None);
        assert_eq!(index.len(), 59);
        assert!(matches!(
            index.delete("low_0"),
            Err(Error::DocumentNotFound(_))
        ));
        index.add("low_0", &[0.0, 0.0]).unwrap();
        assert_eq!(index.vector("low_0"), Some(vec![0.0, 0.0]));
    }

    #[test]
    fn test_nprobe_param() {
        let mut index = IvfFlatIndex::new(&config(2, 2)).unwrap();
        index
            .set_params(&HashMap::from([("nprobe".into(), "2".into())]))
            .unwrap();
        assert_eq!(index.nprobe, 2);
        assert!(matches!(
            index.set_params(&HashMap::from([("efsearch".into(), "8".into())])),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index_2.idx");
        let mut index = IvfFlatIndex::new(&config(2, 2)).unwrap();
        let (ids, vectors) = clustered();
        index.build(&ids, &vectors).unwrap();
        index.save(&path).unwrap();

        let mut restored = IvfFlatIndex::new(&config(2, 2)).unwrap();
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 60);
        let (found, _) = restored.search(&[0.05, 0.0], 1).unwrap();
        assert!(found[0].starts_with("low_"));
    }
}
