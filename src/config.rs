//! Engine configuration and the on-disk layout under `dir`:
//!
//! ```text
//! dir/sstfile/<level>_<seq>.sst          SSTables
//! dir/walfile/memtable/<index>.wal       LSM WALs, one per memtable generation
//! dir/walfile/index/<collection_id>.wal  per-collection ANN-index WAL
//! dir/indexfile/<collection>.conf        JSON index config
//! dir/indexfile/index_<collection_id>.idx  index snapshot
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mem_table::{skiplist_factory, MemTableFactory};
use crate::table::bloom::{Bloom, Filter, DEFAULT_BLOOM_BITS};

pub type FilterFactory = Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;

pub const DEFAULT_MAX_LEVEL: usize = 7;
pub const DEFAULT_SST_SIZE: usize = 1 << 20;
pub const DEFAULT_SST_NUM_PER_LEVEL: usize = 10;
pub const DEFAULT_SST_DATA_BLOCK_SIZE: usize = 16 << 10;
pub const DEFAULT_SST_FOOTER_SIZE: usize = 32;

#[derive(Clone)]
pub struct Options {
    pub dir: PathBuf,
    /// Number of LSM levels, at least 2.
    pub max_level: usize,
    /// Target SSTable size at level 0; level L caps at `sst_size * 10^L`.
    pub sst_size: usize,
    /// Per-level node count factored into the compaction trigger.
    pub sst_num_per_level: usize,
    pub sst_data_block_size: usize,
    pub sst_footer_size: usize,
    /// Query-result LRU capacity in entries; 0 disables the cache.
    pub cache_size: u64,
    pub filter: FilterFactory,
    pub memtable: MemTableFactory,
}

impl Options {
    /// Defaults rooted at `dir`, creating the directory tree if missing.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let opts = Self {
            dir: dir.as_ref().to_path_buf(),
            max_level: DEFAULT_MAX_LEVEL,
            sst_size: DEFAULT_SST_SIZE,
            sst_num_per_level: DEFAULT_SST_NUM_PER_LEVEL,
            sst_data_block_size: DEFAULT_SST_DATA_BLOCK_SIZE,
            sst_footer_size: DEFAULT_SST_FOOTER_SIZE,
            cache_size: 0,
            filter: Arc::new(|| Box::new(Bloom::new(DEFAULT_BLOOM_BITS)) as Box<dyn Filter>),
            memtable: skiplist_factory(),
        };
        opts.ensure_dirs()?;
        Ok(opts)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        if self.max_level < 2 {
            return Err(Error::InvalidParameter(format!(
                "max_level must be at least 2, got {}",
                self.max_level
            )));
        }
        std::fs::create_dir_all(self.sst_dir())?;
        std::fs::create_dir_all(self.memtable_wal_dir())?;
        std::fs::create_dir_all(self.index_wal_dir())?;
        std::fs::create_dir_all(self.index_dir())?;
        Ok(())
    }

    pub fn sst_dir(&self) -> PathBuf {
        self.dir.join("sstfile")
    }

    pub fn memtable_wal_dir(&self) -> PathBuf {
        self.dir.join("walfile").join("memtable")
    }

    pub fn index_wal_dir(&self) -> PathBuf {
        self.dir.join("walfile").join("index")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.dir.join("indexfile")
    }

    pub fn sst_path(&self, level: usize, seq: u64) -> PathBuf {
        self.sst_dir().join(format!("{level}_{seq}.sst"))
    }

    pub fn memtable_wal_path(&self, index: usize) -> PathBuf {
        self.memtable_wal_dir().join(format!("{index}.wal"))
    }

    pub fn index_wal_path(&self, collection_id: u32) -> PathBuf {
        self.index_wal_dir().join(format!("{collection_id}.wal"))
    }

    pub fn index_conf_path(&self, collection: &str) -> PathBuf {
        self.index_dir().join(format!("{collection}.conf"))
    }

    pub fn index_snapshot_path(&self, collection_id: u32) -> PathBuf {
        self.index_dir().join(format!("index_{collection_id}.idx"))
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("dir", &self.dir)
            .field("max_level", &self.max_level)
            .field("sst_size", &self.sst_size)
            .field("sst_num_per_level", &self.sst_num_per_level)
            .field("sst_data_block_size", &self.sst_data_block_size)
            .field("sst_footer_size", &self.sst_footer_size)
            .field("cache_size", &self.cache_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_creates_layout() {
        let dir = tempdir().unwrap();
        let opts = Options::new(dir.path()).unwrap();
        assert!(opts.sst_dir().is_dir());
        assert!(opts.memtable_wal_dir().is_dir());
        assert!(opts.index_wal_dir().is_dir());
        assert!(opts.index_dir().is_dir());
        assert_eq!(opts.max_level, DEFAULT_MAX_LEVEL);
    }

    #[test]
    fn test_rejects_single_level() {
        let dir = tempdir().unwrap();
        let mut opts = Options::new(dir.path()).unwrap();
        opts.max_level = 1;
        assert!(matches!(
            opts.ensure_dirs(),
            Err(Error::InvalidParameter(_))
        ));
    }
}
