//! Vector index abstraction: three variants behind one contract.

pub mod distance;
pub mod flat;
pub mod hnsw;
pub mod ivf;
pub mod manager;

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use self::distance::Space;
use self::flat::FlatIndex;
use self::hnsw::HnswIndex;
use self::ivf::IvfFlatIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    #[default]
    Hnsw,
    IvfFlat,
    Flat,
}

impl FromStr for IndexType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hnsw" => Ok(IndexType::Hnsw),
            "ivf_flat" => Ok(IndexType::IvfFlat),
            "flat" => Ok(IndexType::Flat),
            other => Err(Error::UnsupportedIndexType(other.to_string())),
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexType::Hnsw => write!(f, "hnsw"),
            IndexType::IvfFlat => write!(f, "ivf_flat"),
            IndexType::Flat => write!(f, "flat"),
        }
    }
}

/// Persisted as `indexfile/<collection>.conf`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    pub index_type: IndexType,
    pub dimension: usize,
    #[serde(default)]
    pub space: Space,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Capability set shared by every variant. Search results are ordered by
/// ascending distance.
pub trait VectorIndex: Send + Sync {
    /// Dimension-checked single insert; an existing id is superseded.
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()>;
    /// Bulk (re)build: supersedes prior content in Flat, trains and adds in
    /// IVF, aliases `add_batch` in HNSW.
    fn build(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()>;
    fn add_batch(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()>;
    /// Logical removal; HNSW only marks the graph node.
    fn delete(&mut self, id: &str) -> Result<()>;
    fn search(&self, query: &[f32], k: usize) -> Result<(Vec<String>, Vec<f32>)>;
    /// Point lookup of a stored vector.
    fn vector(&self, id: &str) -> Option<Vec<f32>>;
    /// Variant-specific tunables; unknown keys are invalid parameters.
    fn set_params(&mut self, params: &HashMap<String, String>) -> Result<()>;
    fn save(&self, path: &Path) -> Result<()>;
    fn load(&mut self, path: &Path) -> Result<()>;
    fn close(&mut self);
    fn dimension(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sealed variant set; dispatch is by tag.
pub enum Index {
    Hnsw(HnswIndex),
    IvfFlat(IvfFlatIndex),
    Flat(FlatIndex),
}

impl Index {
    pub fn create(config: &IndexConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(Error::InvalidDimension(
                "index dimension must be positive".into(),
            ));
        }
        Ok(match config.index_type {
            IndexType::Hnsw => Index::Hnsw(HnswIndex::new(config)?),
            IndexType::IvfFlat => Index::IvfFlat(IvfFlatIndex::new(config)?),
            IndexType::Flat => Index::Flat(FlatIndex::new(config)?),
        })
    }

    fn inner(&self) -> &dyn VectorIndex {
        match self {
            Index::Hnsw(i) => i,
            Index::IvfFlat(i) => i,
            Index::Flat(i) => i,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn VectorIndex {
        match self {
            Index::Hnsw(i) => i,
            Index::IvfFlat(i) => i,
            Index::Flat(i) => i,
        }
    }
}

impl VectorIndex for Index {
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        self.inner_mut().add(id, vector)
    }

    fn build(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        self.inner_mut().build(ids, vectors)
    }

    fn add_batch(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        self.inner_mut().add_batch(ids, vectors)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.inner_mut().delete(id)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<(Vec<String>, Vec<f32>)> {
        self.inner().search(query, k)
    }

    fn vector(&self, id: &str) -> Option<Vec<f32>> {
        self.inner().vector(id)
    }

    fn set_params(&mut self, params: &HashMap<String, String>) -> Result<()> {
        self.inner_mut().set_params(params)
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.inner().save(path)
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.inner_mut().load(path)
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }

    fn dimension(&self) -> usize {
        self.inner().dimension()
    }

    fn len(&self) -> usize {
        self.inner().len()
    }
}

/*----------------shared variant plumbing------------------*/

/// f32 distance with a total order, for heaps and sorts.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct OrdF32(pub f32);

impl Eq for OrdF32 {}

impl PartialOrd for OrdF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

pub(crate) fn check_dimension(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::InvalidDimension(format!(
            "expected {expected}, got {got}"
        )));
    }
    Ok(())
}

pub(crate) fn check_batch(ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
    if ids.len() != vectors.len() {
        return Err(Error::MismatchKeysValues);
    }
    Ok(())
}

/// Optional positive-integer creation/tuning parameter.
pub(crate) fn param_usize(params: &HashMap<String, String>, key: &str) -> Result<Option<usize>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => match raw.parse::<usize>() {
            Ok(v) if v > 0 => Ok(Some(v)),
            _ => Err(Error::InvalidParameter(format!("{key}={raw}"))),
        },
    }
}

const SNAPSHOT_MAGIC: u32 = 0x4F41_4442;

/// Snapshot envelope shared by the variants: magic, variant tag, body,
/// trailing crc32 over everything before it.
pub(crate) fn write_snapshot(path: &Path, kind: u8, body: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(body.len() + 9);
    buf.put_u32_le(SNAPSHOT_MAGIC);
    buf.put_u8(kind);
    buf.extend_from_slice(body);
    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    std::fs::write(path, &buf)?;
    std::fs::File::open(path)?.sync_all()?;
    Ok(())
}

pub(crate) fn read_snapshot(path: &Path, kind: u8) -> Result<Vec<u8>> {
    use bytes::Buf;
    let data = std::fs::read(path)?;
    if data.len() < 9 {
        return Err(Error::Corruption(format!(
            "{}: snapshot too small",
            path.display()
        )));
    }
    let (payload, tail) = data.split_at(data.len() - 4);
    if (&tail[..]).get_u32_le() != crc32fast::hash(payload) {
        return Err(Error::Corruption(format!(
            "{}: snapshot checksum mismatch",
            path.display()
        )));
    }
    let mut head = &payload[..5];
    if head.get_u32_le() != SNAPSHOT_MAGIC {
        return Err(Error::Corruption(format!(
            "{}: bad snapshot magic",
            path.display()
        )));
    }
    if head.get_u8() != kind {
        return Err(Error::FailedToLoadIndex(format!(
            "{}: snapshot holds a different index type",
            path.display()
        )));
    }
    Ok(payload[5..].to_vec())
}

pub(crate) fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

pub(crate) fn get_string(buf: &mut &[u8]) -> Result<String> {
    use bytes::Buf;
    if buf.len() < 2 {
        return Err(Error::Corruption("truncated string length".into()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.len() < len {
        return Err(Error::Corruption("truncated string body".into()));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| Error::Corruption("invalid utf-8 string".into()))?;
    buf.advance(len);
    Ok(s)
}

pub(crate) fn put_f32s(buf: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        buf.put_f32_le(*v);
    }
}

pub(crate) fn get_f32s(buf: &mut &[u8], count: usize) -> Result<Vec<f32>> {
    use bytes::Buf;
    if buf.len() < count * 4 {
        return Err(Error::Corruption("truncated vector data".into()));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(buf.get_f32_le());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_type_parsing() {
        assert_eq!("hnsw".parse::<IndexType>().unwrap(), IndexType::Hnsw);
        assert_eq!("ivf_flat".parse::<IndexType>().unwrap(), IndexType::IvfFlat);
        assert_eq!("flat".parse::<IndexType>().unwrap(), IndexType::Flat);
        assert!(matches!(
            "btree".parse::<IndexType>(),
            Err(Error::UnsupportedIndexType(_))
        ));
    }

    #[test]
    fn test_create_rejects_zero_dimension() {
        let config = IndexConfig {
            index_type: IndexType::Flat,
            dimension: 0,
            space: Space::L2,
            parameters: HashMap::new(),
        };
        assert!(matches!(
            Index::create(&config),
            Err(Error::InvalidDimension(_))
        ));
    }

    #[test]
    fn test_snapshot_envelope_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index_1.idx");
        write_snapshot(&path, 2, b"payload").unwrap();
        assert_eq!(read_snapshot(&path, 2).unwrap(), b"payload");
        assert!(matches!(
            read_snapshot(&path, 3),
            Err(Error::FailedToLoadIndex(_))
        ));

        // flip a byte: checksum must catch it
        let mut data = std::fs::read(&path).unwrap();
        data[6] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(read_snapshot(&path, 2), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_string_codec_round_trip() {
        let mut buf = Vec::new();
        put_string(&mut buf, "doc-42");
        put_f32s(&mut buf, &[1.5, -2.0]);
        let mut slice = &buf[..];
        assert_eq!(get_string(&mut slice).unwrap(), "doc-42");
        assert_eq!(get_f32s(&mut slice, 2).unwrap(), vec![1.5, -2.0]);
        assert!(slice.is_empty());
    }
}
