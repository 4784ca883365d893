//! Hierarchical navigable small world graph.
//!
//! Layered proximity graph: every element gets a sampled level, searches
//! descend greedily from the top entry point and beam-search the base
//! layer. String ids are mapped to u32 labels (see `crate::id`); deletes
//! mark the graph node and hide it from results without shrinking the
//! element count. Adjacency lists carry their own locks so batch insertion
//! can run on a thread pool; at most one neighbor list is locked at a time.

use parking_lot::RwLock;
use rand::Rng;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::id::string_to_id;
use crate::vector::distance::Space;
use crate::vector::{
    check_batch, check_dimension, get_f32s, get_string, param_usize, put_f32s, put_string,
    read_snapshot, write_snapshot, IndexConfig, OrdF32, VectorIndex,
};

pub(crate) const SNAPSHOT_KIND: u8 = 1;

pub const DEFAULT_M: usize = 16;
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
pub const DEFAULT_MAX_ELEMENTS: usize = 100_000;
pub const DEFAULT_EF_SEARCH: usize = 10;

struct Element {
    label: u32,
    id: String,
    vector: Vec<f32>,
    level: usize,
    deleted: AtomicBool,
    /// Adjacency per layer, `0..=level`.
    neighbors: Vec<RwLock<Vec<usize>>>,
}

impl Element {
    fn new(label: u32, id: &str, vector: &[f32], level: usize) -> Arc<Self> {
        Arc::new(Self {
            label,
            id: id.to_string(),
            vector: vector.to_vec(),
            level,
            deleted: AtomicBool::new(false),
            neighbors: (0..=level).map(|_| RwLock::new(Vec::new())).collect(),
        })
    }
}

pub struct HnswIndex {
    space: Space,
    dim: usize,
    m: usize,
    /// Base-layer fanout, 2 * M.
    m0: usize,
    ef_construction: usize,
    max_elements: usize,
    build_threads: usize,
    ef_search: usize,
    level_mult: f64,

    elems: RwLock<Vec<Arc<Element>>>,
    by_label: RwLock<HashMap<u32, usize>>,
    /// `(element index, its level)` of the top entry point.
    entry: RwLock<Option<(usize, usize)>>,
}

impl HnswIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let m = param_usize(&config.parameters, "M")?.unwrap_or(DEFAULT_M);
        let ef_construction =
            param_usize(&config.parameters, "efConstruction")?.unwrap_or(DEFAULT_EF_CONSTRUCTION);
        let max_elements =
            param_usize(&config.parameters, "maxElements")?.unwrap_or(DEFAULT_MAX_ELEMENTS);
        let build_threads = match param_usize(&config.parameters, "buildThreads")? {
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        Ok(Self {
            space: config.space,
            dim: config.dimension,
            m,
            m0: m * 2,
            ef_construction,
            max_elements,
            build_threads,
            ef_search: DEFAULT_EF_SEARCH,
            level_mult: 1.0 / (m as f64).ln(),
            elems: RwLock::new(Vec::new()),
            by_label: RwLock::new(HashMap::new()),
            entry: RwLock::new(None),
        })
    }

    fn sample_level(&self) -> usize {
        let r: f64 = rand::thread_rng().gen::<f64>().max(1e-12);
        ((-r.ln() * self.level_mult) as usize).min(31)
    }

    /// Insert one element; `&self` so a build pool can run many at once.
    fn insert_one(&self, id: &str, vector: &[f32]) -> Result<()> {
        check_dimension(self.dim, vector.len())?;
        let label = string_to_id(id);

        // an existing label is superseded: the old node stays in the graph
        // as a deleted marker and the fresh one takes over the label
        {
            let by_label = self.by_label.read();
            if let Some(&old) = by_label.get(&label) {
                self.elems.read()[old].deleted.store(true, Ordering::Relaxed);
            }
        }

        let level = self.sample_level();
        let elem = Element::new(label, id, vector, level);
        let at = {
            let mut elems = self.elems.write();
            if elems.len() >= self.max_elements {
                return Err(Error::InvalidParameter(format!(
                    "hnsw index is full: maxElements={}",
                    self.max_elements
                )));
            }
            elems.push(elem.clone());
            elems.len() - 1
        };
        self.by_label.write().insert(label, at);

        let (mut cur, top_level) = {
            let mut entry = self.entry.write();
            match *entry {
                None => {
                    *entry = Some((at, level));
                    return Ok(());
                }
                Some(e) => e,
            }
        };

        let elems = self.elems.read();
        let query = &elem.vector;
        for layer in (level + 1..=top_level).rev() {
            cur = self.greedy_closest(&elems, query, cur, layer);
        }
        for layer in (0..=level.min(top_level)).rev() {
            let candidates = self.search_layer(&elems, query, cur, self.ef_construction, layer);
            let cap = if layer == 0 { self.m0 } else { self.m };
            let selected: Vec<usize> = candidates.iter().take(self.m).map(|&(_, n)| n).collect();
            *elem.neighbors[layer].write() = selected.clone();
            for &n in &selected {
                let other = &elems[n];
                let mut links = other.neighbors[layer].write();
                if !links.contains(&at) {
                    links.push(at);
                }
                if links.len() > cap {
                    links.sort_by_key(|&x| {
                        OrdF32(self.space.distance(&other.vector, &elems[x].vector))
                    });
                    links.truncate(cap);
                }
            }
            if let Some(&(_, best)) = candidates.first() {
                cur = best;
            }
        }
        drop(elems);

        if level > top_level {
            let mut entry = self.entry.write();
            match *entry {
                Some((_, current)) if level > current => *entry = Some((at, level)),
                None => *entry = Some((at, level)),
                _ => {}
            }
        }
        Ok(())
    }

    /// Steepest-descent step used on the upper layers.
    fn greedy_closest(
        &self,
        elems: &[Arc<Element>],
        query: &[f32],
        start: usize,
        layer: usize,
    ) -> usize {
        let mut cur = start;
        let mut cur_dist = self.space.distance(query, &elems[cur].vector);
        loop {
            let links = elems[cur].neighbors[layer].read().clone();
            let mut improved = false;
            for n in links {
                let d = self.space.distance(query, &elems[n].vector);
                if d < cur_dist {
                    cur = n;
                    cur_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return cur;
            }
        }
    }

    /// Beam search within one layer; returns up to `ef` nodes ascending by
    /// distance. Deleted nodes are kept as waypoints and filtered later.
    fn search_layer(
        &self,
        elems: &[Arc<Element>],
        query: &[f32],
        entry: usize,
        ef: usize,
        layer: usize,
    ) -> Vec<(OrdF32, usize)> {
        let ef = ef.max(1);
        let start = OrdF32(self.space.distance(query, &elems[entry].vector));
        let mut visited: HashSet<usize> = HashSet::from([entry]);
        let mut candidates = BinaryHeap::from([Reverse((start, entry))]);
        let mut results: BinaryHeap<(OrdF32, usize)> = BinaryHeap::from([(start, entry)]);

        while let Some(Reverse((dist, node))) = candidates.pop() {
            let worst = results.peek().map(|&(d, _)| d).unwrap_or(OrdF32(f32::MAX));
            if dist > worst && results.len() >= ef {
                break;
            }
            let links = elems[node].neighbors[layer].read().clone();
            for n in links {
                if !visited.insert(n) {
                    continue;
                }
                let d = OrdF32(self.space.distance(query, &elems[n].vector));
                let worst = results.peek().map(|&(w, _)| w).unwrap_or(OrdF32(f32::MAX));
                if results.len() < ef || d < worst {
                    candidates.push(Reverse((d, n)));
                    results.push((d, n));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        results.into_sorted_vec()
    }
}

impl VectorIndex for HnswIndex {
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        self.insert_one(id, vector)
    }

    /// HNSW has no training phase: build is batch insertion.
    fn build(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        self.add_batch(ids, vectors)
    }

    fn add_batch(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(ids, vectors)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.build_threads)
            .build()
            .map_err(|e| Error::FailedToCreateIndex(e.to_string()))?;
        let this = &*self;
        pool.install(|| {
            ids.par_iter()
                .zip(vectors.par_iter())
                .try_for_each(|(id, vector)| this.insert_one(id, vector))
        })
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        let label = string_to_id(id);
        let by_label = self.by_label.read();
        let Some(&at) = by_label.get(&label) else {
            return Err(Error::DocumentNotFound(id.to_string()));
        };
        self.elems.read()[at].deleted.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<(Vec<String>, Vec<f32>)> {
        check_dimension(self.dim, query.len())?;
        if k == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let elems = self.elems.read();
        let Some((mut cur, top_level)) = *self.entry.read() else {
            return Ok((Vec::new(), Vec::new()));
        };
        for layer in (1..=top_level).rev() {
            cur = self.greedy_closest(&elems, query, cur, layer);
        }
        let found = self.search_layer(&elems, query, cur, self.ef_search.max(k), 0);

        let mut ids = Vec::with_capacity(k);
        let mut dists = Vec::with_capacity(k);
        for (dist, at) in found {
            let elem = &elems[at];
            if elem.deleted.load(Ordering::Relaxed) {
                continue;
            }
            ids.push(elem.id.clone());
            dists.push(dist.0);
            if ids.len() == k {
                break;
            }
        }
        Ok((ids, dists))
    }

    fn vector(&self, id: &str) -> Option<Vec<f32>> {
        let by_label = self.by_label.read();
        let &at = by_label.get(&string_to_id(id))?;
        let elems = self.elems.read();
        let elem = &elems[at];
        if elem.deleted.load(Ordering::Relaxed) {
            return None;
        }
        Some(elem.vector.clone())
    }

    fn set_params(&mut self, params: &HashMap<String, String>) -> Result<()> {
        for key in params.keys() {
            match key.as_str() {
                "efsearch" => {
                    self.ef_search = param_usize(params, "efsearch")?.unwrap();
                }
                other => {
                    return Err(Error::InvalidParameter(format!(
                        "hnsw index has no parameter {other}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let elems = self.elems.read();
        let entry = *self.entry.read();

        let mut body = Vec::new();
        body.put_u8(self.space.as_u8());
        body.put_u32_le(self.dim as u32);
        body.put_u32_le(self.m as u32);
        body.put_u32_le(self.ef_construction as u32);
        body.put_u64_le(self.max_elements as u64);
        body.put_u32_le(self.ef_search as u32);
        match entry {
            Some((at, level)) => {
                body.put_u8(1);
                body.put_u64_le(at as u64);
                body.put_u32_le(level as u32);
            }
            None => {
                body.put_u8(0);
                body.put_u64_le(0);
                body.put_u32_le(0);
            }
        }
        body.put_u64_le(elems.len() as u64);
        for elem in elems.iter() {
            body.put_u32_le(elem.label);
            put_string(&mut body, &elem.id);
            body.put_u32_le(elem.level as u32);
            body.put_u8(elem.deleted.load(Ordering::Relaxed) as u8);
            put_f32s(&mut body, &elem.vector);
            for layer in &elem.neighbors {
                let links = layer.read();
                body.put_u32_le(links.len() as u32);
                for &n in links.iter() {
                    body.put_u64_le(n as u64);
                }
            }
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
        let m = buf.get_u32_le() as usize;
        let ef_construction = buf.get_u32_le() as usize;
        let max_elements = buf.get_u64_le() as usize;
        let ef_search = buf.get_u32_le() as usize;
        let entry = {
            let present = buf.get_u8() == 1;
            let at = buf.get_u64_le() as usize;
            let level = buf.get_u32_le() as usize;
            present.then_some((at, level))
        };
        let count = buf.get_u64_le() as usize;
        let mut elems = Vec::with_capacity(count);
        let mut by_label = HashMap::with_capacity(count);
        for at in 0..count {
            let label = buf.get_u32_le();
            let id = get_string(&mut buf)?;
            let level = buf.get_u32_le() as usize;
            let deleted = buf.get_u8() == 1;
            let vector = get_f32s(&mut buf, dim)?;
            let elem = Element::new(label, &id, &vector, level);
            elem.deleted.store(deleted, Ordering::Relaxed);
            for layer in 0..=level {
                let links = buf.get_u32_le() as usize;
                let mut neighbors = Vec::with_capacity(links);
                for _ in 0..links {
                    neighbors.push(buf.get_u64_le() as usize);
                }
                *elem.neighbors[layer].write() = neighbors;
            }
            if !deleted {
                by_label.insert(label, at);
            }
            elems.push(elem);
        }

        self.space = space;
        self.m = m;
        self.m0 = m * 2;
        self.ef_construction = ef_construction;
        self.max_elements = max_elements;
        self.ef_search = ef_search;
        self.level_mult = 1.0 / (m as f64).ln();
        *self.elems.write() = elems;
        *self.by_label.write() = by_label;
        *self.entry.write() = entry;
        Ok(())
    }

    fn close(&mut self) {
        self.elems.write().clear();
        self.by_label.write().clear();
        *self.entry.write() = None;
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    /// Includes deleted markers: deletes do not shrink the count.
    fn len(&self) -> usize {
        self.elems.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dim: usize) -> IndexConfig {
        IndexConfig {
            index_type: crate::vector::IndexType::Hnsw,
            dimension: dim,
            space: Space::L2,
            parameters: HashMap::new(),
        }
    }

    fn sample(index: &mut HnswIndex) {
        for (id, v) in [
            ("1", [1.0, 2.0, 3.0]),
            ("2", [4.0, 5.0, 6.0]),
            ("3", [7.0, 8.0, 9.0]),
            ("4", [10.0, 11.0, 12.0]),
        ] {
            index.add(id, &v).unwrap();
        }
    }

    #[test]
    fn test_top1_neighbor() {
        let mut index = HnswIndex::new(&config(3)).unwrap();
        sample(&mut index);
        let (ids, dists) = index.search(&[1.1, 2.1, 3.1], 2).unwrap();
        assert_eq!(ids[0], "1");
        assert_eq!(ids.len(), 2);
        assert!(dists[0] <= dists[1]);
    }

    #[test]
    fn test_recall_on_larger_set() {
        let mut index = HnswIndex::new(&config(4)).unwrap();
        let ids: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        let vectors: Vec<Vec<f32>> = (0..200)
            .map(|i| {
                let x = i as f32;
                vec![x, (x * 0.5).sin(), (x * 0.1).cos(), -x]
            })
            .collect();
        index.add_batch(&ids, &vectors).unwrap();
        assert_eq!(index.len(), 200);
        let (found, _) = index.search(&vectors[42], 1).unwrap();
        assert_eq!(found, vec!["42"]);
    }

    #[test]
    fn test_delete_hides_from_search() {
        let mut index = HnswIndex::new(&config(3)).unwrap();
        sample(&mut index);
        index.delete("1").unwrap();
        let (ids, _) = index.search(&[1.0, 2.0, 3.0], 4).unwrap();
        assert!(!ids.contains(&"1".to_string()));
        assert_eq!(index.vector("1"), None);
        // count is not reduced by a mark-delete
        assert_eq!(index.len(), 4);
        assert!(matches!(
            index.delete("nope"),
            Err(Error::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_readd_supersedes() {
        let mut index = HnswIndex::new(&config(3)).unwrap();
        sample(&mut index);
        index.add("1", &[100.0, 100.0, 100.0]).unwrap();
        assert_eq!(index.vector("1"), Some(vec![100.0, 100.0, 100.0]));
        let (ids, _) = index.search(&[100.0, 100.0, 100.0], 1).unwrap();
        assert_eq!(ids, vec!["1"]);
    }

    #[test]
    fn test_efsearch_param() {
        let mut index = HnswIndex::new(&config(3)).unwrap();
        index
            .set_params(&HashMap::from([("efsearch".into(), "64".into())]))
            .unwrap();
        assert_eq!(index.ef_search, 64);
        assert!(matches!(
            index.set_params(&HashMap::from([("nprobe".into(), "4".into())])),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            index.set_params(&HashMap::from([("efsearch".into(), "abc".into())])),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_max_elements_cap() {
        let mut cfg = config(2);
        cfg.parameters.insert("maxElements".into(), "2".into());
        let mut index = HnswIndex::new(&cfg).unwrap();
        index.add("a", &[0.0, 0.0]).unwrap();
        index.add("b", &[1.0, 1.0]).unwrap();
        assert!(matches!(
            index.add("c", &[2.0, 2.0]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index_9.idx");
        let mut index = HnswIndex::new(&config(3)).unwrap();
        sample(&mut index);
        index.delete("3").unwrap();
        index.save(&path).unwrap();

        let mut restored = HnswIndex::new(&config(3)).unwrap();
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 4);
        let (ids, _) = restored.search(&[1.1, 2.1, 3.1], 1).unwrap();
        assert_eq!(ids, vec!["1"]);
        assert_eq!(restored.vector("3"), None);
    }
}
