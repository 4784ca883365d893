//! SSTable reader and the LSM node wrapping it.

pub mod bloom;
pub mod builder;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::codec::get_uvarint;
use crate::error::{Error, Result};
use crate::table::bloom::Filter;
use crate::table::builder::{BuildResult, FOOTER_CORE_SIZE};

/// One cached index-block record: the separator key covering a data block
/// plus that block's position in the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Bytes,
    pub offset: u64,
    pub size: u64,
}

/// Read handle supporting positioned reads; closable so `destroy` can
/// release the descriptor before unlinking.
struct FileObject {
    file: Mutex<Option<File>>,
    size: u64,
}

impl FileObject {
    fn open(path: &Path) -> Result<Self> {
        let file = File::options().read(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(Some(file)),
            size,
        })
    }

    fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sstable reader is closed",
            ))
        })?;
        let mut data = vec![0; len as usize];
        file.read_exact_at(&mut data, offset)?;
        Ok(data)
    }

    fn close(&self) {
        self.file.lock().take();
    }
}

/// Decode a run of `u16 keyLen | u32 valueLen | key | value` records.
pub(crate) fn parse_records(mut buf: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
    let mut records = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 6 {
            return Err(Error::Corruption("truncated record header".into()));
        }
        let key_len = buf.get_u16_le() as usize;
        let value_len = buf.get_u32_le() as usize;
        if buf.len() < key_len + value_len {
            return Err(Error::Corruption("truncated record body".into()));
        }
        let key = Bytes::copy_from_slice(&buf[..key_len]);
        let value = Bytes::copy_from_slice(&buf[key_len..key_len + value_len]);
        buf.advance(key_len + value_len);
        records.push((key, value));
    }
    Ok(records)
}

/// Open SSTable file: footer offsets plus a positioned-read handle.
pub struct SsTable {
    file: FileObject,
    filter_offset: u64,
    filter_size: u64,
    index_offset: u64,
    index_size: u64,
}

impl SsTable {
    pub fn open(path: &Path, footer_size: usize) -> Result<Self> {
        let file = FileObject::open(path)?;
        if (file.size as usize) < footer_size || footer_size < FOOTER_CORE_SIZE {
            return Err(Error::Corruption(format!(
                "{}: file too small for footer",
                path.display()
            )));
        }
        let footer = file.read(file.size - footer_size as u64, footer_size as u64)?;
        let mut buf = &footer[..];
        let filter_offset = buf.get_u64_le();
        let filter_size = buf.get_u64_le();
        let index_offset = buf.get_u64_le();
        let index_size = buf.get_u64_le();
        if filter_offset + filter_size > file.size || index_offset + index_size > file.size {
            return Err(Error::Corruption(format!(
                "{}: footer offsets out of range",
                path.display()
            )));
        }
        Ok(Self {
            file,
            filter_offset,
            filter_size,
            index_offset,
            index_size,
        })
    }

    pub fn size(&self) -> u64 {
        self.file.size
    }

    pub fn read_index(&self) -> Result<Vec<IndexEntry>> {
        let raw = self.file.read(self.index_offset, self.index_size)?;
        let mut entries = Vec::new();
        for (key, value) in parse_records(&raw)? {
            let mut buf = value.as_ref();
            let offset = get_uvarint(&mut buf)
                .ok_or_else(|| Error::Corruption("bad index entry offset".into()))?;
            let size = get_uvarint(&mut buf)
                .ok_or_else(|| Error::Corruption("bad index entry size".into()))?;
            entries.push(IndexEntry { key, offset, size });
        }
        Ok(entries)
    }

    pub fn read_filter(&self) -> Result<HashMap<u64, Bytes>> {
        let raw = self.file.read(self.filter_offset, self.filter_size)?;
        let mut filters = HashMap::new();
        for (key, bitmap) in parse_records(&raw)? {
            let mut buf = key.as_ref();
            let offset = get_uvarint(&mut buf)
                .ok_or_else(|| Error::Corruption("bad filter block key".into()))?;
            filters.insert(offset, bitmap);
        }
        Ok(filters)
    }

    pub fn read_block(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.file.read(offset, size)
    }

    pub fn close(&self) {
        self.file.close();
    }
}

/// Runtime wrapper around one SSTable: open reader plus the eagerly cached
/// index, filter map and key range.
pub struct Node {
    pub level: usize,
    pub seq: u64,
    pub size: u64,
    path: PathBuf,
    sst: SsTable,
    index: Vec<IndexEntry>,
    filters: HashMap<u64, Bytes>,
    filter: Box<dyn Filter>,
    pub start_key: Bytes,
    pub end_key: Bytes,
}

impl Node {
    /// Open an existing table from disk, reading footer, index and filters.
    pub fn open(
        path: impl AsRef<Path>,
        level: usize,
        seq: u64,
        footer_size: usize,
        filter: Box<dyn Filter>,
    ) -> Result<Self> {
        let sst = SsTable::open(path.as_ref(), footer_size)?;
        let index = sst.read_index()?;
        let filters = sst.read_filter()?;
        Ok(Self::assemble(
            path.as_ref().to_path_buf(),
            level,
            seq,
            sst.size(),
            sst,
            index,
            filters,
            filter,
        ))
    }

    /// Wrap a table just produced by the builder, reusing its caches.
    pub fn from_build(
        path: impl AsRef<Path>,
        level: usize,
        seq: u64,
        footer_size: usize,
        build: BuildResult,
        filter: Box<dyn Filter>,
    ) -> Result<Self> {
        let sst = SsTable::open(path.as_ref(), footer_size)?;
        Ok(Self::assemble(
            path.as_ref().to_path_buf(),
            level,
            seq,
            build.size,
            sst,
            build.index,
            build.filters,
            filter,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        path: PathBuf,
        level: usize,
        seq: u64,
        size: u64,
        sst: SsTable,
        index: Vec<IndexEntry>,
        filters: HashMap<u64, Bytes>,
        filter: Box<dyn Filter>,
    ) -> Self {
        let start_key = index.first().map(|e| e.key.clone()).unwrap_or_default();
        let end_key = index.last().map(|e| e.key.clone()).unwrap_or_default();
        Self {
            level,
            seq,
            size,
            path,
            sst,
            index,
            filters,
            filter,
            start_key,
            end_key,
        }
    }

    /// Point lookup: index binary search, bloom probe, block scan. The
    /// returned value may be the empty tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let at = self.index.partition_point(|e| e.key.as_ref() < key);
        let Some(entry) = self.index.get(at) else {
            return Ok(None);
        };
        if let Some(bitmap) = self.filters.get(&entry.offset) {
            if !self.filter.may_contain(bitmap, key) {
                return Ok(None);
            }
        }
        let block = self.sst.read_block(entry.offset, entry.size)?;
        for (k, v) in parse_records(&block)? {
            if k.as_ref() == key {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// Every pair in the table, in key order. Compaction input.
    pub fn get_all(&self) -> Result<Vec<(Bytes, Bytes)>> {
        let mut all = Vec::new();
        for entry in &self.index {
            let block = self.sst.read_block(entry.offset, entry.size)?;
            all.extend(parse_records(&block)?);
        }
        Ok(all)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the reader only.
    pub fn close(&self) {
        self.sst.close();
    }

    /// Release the reader and unlink the file.
    pub fn destroy(&self) {
        self.sst.close();
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove sstable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::bloom::Bloom;
    use crate::table::builder::SsTableBuilder;
    use tempfile::tempdir;

    fn build_table(path: &Path, pairs: &[(&str, &str)], block_size: usize) -> BuildResult {
        let mut builder =
            SsTableBuilder::new(path, block_size, 32, Box::<Bloom>::default()).unwrap();
        for (k, v) in pairs {
            builder.append(k.as_bytes(), v.as_bytes()).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn test_round_trip_single_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_1.sst");
        let pairs = [("alpha", "1"), ("bravo", "2"), ("charlie", "3")];
        build_table(&path, &pairs, 16 << 10);

        let node = Node::open(&path, 0, 1, 32, Box::<Bloom>::default()).unwrap();
        for (k, v) in pairs {
            assert_eq!(node.get(k.as_bytes()).unwrap(), Some(Bytes::from(v)));
        }
        assert_eq!(node.get(b"delta").unwrap(), None);
        assert_eq!(node.get_all().unwrap().len(), 3);
    }

    #[test]
    fn test_round_trip_many_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_2.sst");
        let pairs: Vec<(String, String)> = (0..500)
            .map(|i| (format!("key_{i:05}"), format!("value_{i:05}")))
            .collect();
        let borrowed: Vec<(&str, &str)> = pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        // tiny blocks force a multi-block file
        let build = build_table(&path, &borrowed, 256);
        assert!(build.index.len() > 1);
        assert_eq!(build.filters.len(), build.index.len());

        let node = Node::open(&path, 0, 2, 32, Box::<Bloom>::default()).unwrap();
        assert_eq!(node.start_key, build.index.first().unwrap().key);
        assert_eq!(node.end_key, build.index.last().unwrap().key);
        for (k, v) in &pairs {
            assert_eq!(
                node.get(k.as_bytes()).unwrap(),
                Some(Bytes::from(v.clone())),
                "missing {k}"
            );
        }
        let all = node.get_all().unwrap();
        assert_eq!(all.len(), 500);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_tombstone_is_surfaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_3.sst");
        build_table(&path, &[("dead", ""), ("live", "1")], 16 << 10);
        let node = Node::open(&path, 0, 3, 32, Box::<Bloom>::default()).unwrap();
        assert_eq!(node.get(b"dead").unwrap(), Some(Bytes::new()));
        assert_eq!(node.get(b"live").unwrap(), Some(Bytes::from_static(b"1")));
    }

    #[test]
    fn test_destroy_unlinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1_4.sst");
        build_table(&path, &[("k", "v")], 16 << 10);
        let node = Node::open(&path, 1, 4, 32, Box::<Bloom>::default()).unwrap();
        node.destroy();
        assert!(!path.exists());
    }

    #[test]
    fn test_truncated_footer_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_5.sst");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            SsTable::open(&path, 32),
            Err(Error::Corruption(_))
        ));
    }
}
