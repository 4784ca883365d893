//! The LSM tree over scalar key/value pairs.
//!
//! Write path: WAL append, memtable apply, rotation once the active
//! memtable outgrows the SSTable target. Read path walks the freshness
//! order: active memtable, read-only memtables newest first, level 0 newest
//! sequence first, then the sorted levels. Flush and compaction run on a
//! single background worker fed through channels (see `compact`).

use bytes::Bytes;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::compact;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::mem_table::MemTable;
use crate::table::Node;
use crate::wal::Wal;

/// A rotated memtable queued for flush, still readable and still backed by
/// its WAL until the flush lands at level 0.
pub(crate) struct ImmMemTable {
    pub mem: Arc<dyn MemTable>,
    pub wal_path: PathBuf,
}

/// Everything guarded by the tree's write lock.
pub(crate) struct WriteSide {
    pub memtable: Arc<dyn MemTable>,
    /// Read-only queue, oldest first.
    pub imm: Vec<ImmMemTable>,
    pub wal: Wal,
    pub memtable_index: usize,
}

pub(crate) struct FlushJob {
    pub mem: Arc<dyn MemTable>,
    pub wal_path: PathBuf,
}

pub(crate) struct LsmInner {
    pub opts: Options,
    pub write: RwLock<WriteSide>,
    /// One slot per level; level 0 ordered by sequence, higher levels by
    /// start key (non-overlapping).
    pub levels: Vec<RwLock<Vec<Arc<Node>>>>,
    pub next_seq: AtomicU64,
    pub mem_tx: Sender<FlushJob>,
    pub level_tx: Sender<usize>,
}

pub struct LsmTree {
    inner: Arc<LsmInner>,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LsmTree {
    /// Open the tree at `opts.dir`, restoring SSTables from `sstfile/` and
    /// replaying memtable WALs from `walfile/memtable/`.
    pub fn open(opts: Options) -> Result<Self> {
        opts.ensure_dirs()?;
        let mut levels: Vec<RwLock<Vec<Arc<Node>>>> = Vec::with_capacity(opts.max_level);
        for _ in 0..opts.max_level {
            levels.push(RwLock::new(Vec::new()));
        }

        // 1. restore nodes from <level>_<seq>.sst, oldest sequence first
        let mut found: Vec<(usize, u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(opts.sst_dir())? {
            let path = entry?.path();
            match parse_sst_name(&path) {
                Some((level, seq)) if level < opts.max_level => found.push((level, seq, path)),
                Some((level, _)) => {
                    return Err(Error::Corruption(format!(
                        "{}: sstable level {level} exceeds max_level {}",
                        path.display(),
                        opts.max_level
                    )))
                }
                None => warn!(path = %path.display(), "skipping unrecognized sstable file"),
            }
        }
        found.sort_by_key(|(level, seq, _)| (*level, *seq));
        let mut next_seq = 1;
        for (level, seq, path) in found {
            let node = Node::open(&path, level, seq, opts.sst_footer_size, (opts.filter)())?;
            next_seq = next_seq.max(seq + 1);
            levels[level].get_mut().push(Arc::new(node));
        }
        for level_nodes in levels.iter_mut().skip(1) {
            level_nodes
                .get_mut()
                .sort_by(|a, b| a.start_key.cmp(&b.start_key));
        }

        // 2. replay memtable WALs; all but the newest go straight to flush
        let mut wal_files: Vec<(usize, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(opts.memtable_wal_dir())? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "wal") {
                if let Some(index) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<usize>().ok())
                {
                    wal_files.push((index, path));
                } else {
                    warn!(path = %path.display(), "skipping unrecognized wal file");
                }
            }
        }
        wal_files.sort_by_key(|(index, _)| *index);

        let mut imm = Vec::new();
        let mut pending_jobs = Vec::new();
        let (memtable, wal, memtable_index) = match wal_files.split_last() {
            Some(((last_index, last_path), rest)) => {
                for (_, path) in rest {
                    let mem = (opts.memtable)();
                    Wal::replay_into(path, mem.as_ref())?;
                    imm.push(ImmMemTable {
                        mem: mem.clone(),
                        wal_path: path.clone(),
                    });
                    pending_jobs.push(FlushJob {
                        mem,
                        wal_path: path.clone(),
                    });
                }
                let mem = (opts.memtable)();
                Wal::replay_into(last_path, mem.as_ref())?;
                (mem, Wal::open(last_path)?, *last_index)
            }
            None => {
                let path = opts.memtable_wal_path(0);
                ((opts.memtable)(), Wal::open(path)?, 0)
            }
        };

        let (mem_tx, mem_rx) = unbounded();
        let (level_tx, level_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);

        let inner = Arc::new(LsmInner {
            opts,
            write: RwLock::new(WriteSide {
                memtable,
                imm,
                wal,
                memtable_index,
            }),
            levels,
            next_seq: AtomicU64::new(next_seq),
            mem_tx: mem_tx.clone(),
            level_tx,
        });

        let worker = {
            let inner = inner.clone();
            std::thread::spawn(move || compact::run_worker(inner, mem_rx, level_rx, stop_rx, done_tx))
        };
        for job in pending_jobs {
            let _ = mem_tx.send(job);
        }

        info!(dir = %inner.opts.dir.display(), "lsm tree opened");
        Ok(Self {
            inner,
            stop_tx,
            done_rx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Durable write: WAL first, then the active memtable, rotating it once
    /// it outgrows the SSTable target.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut side = self.inner.write.write();
        side.wal.write(key, value)?;
        side.memtable
            .put(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        if side.memtable.size() * 5 / 4 > self.inner.opts.sst_size {
            self.rotate(&mut side)?;
        }
        Ok(())
    }

    /// Tombstone write.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.put(key, b"")
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        // memtables under the write-side lock
        {
            let side = self.inner.write.read();
            if let Some(value) = side.memtable.get(key) {
                return Ok(live(value));
            }
            for imm in side.imm.iter().rev() {
                if let Some(value) = imm.mem.get(key) {
                    return Ok(live(value));
                }
            }
        }
        // level 0, newest sequence first
        {
            let nodes = self.inner.levels[0].read();
            for node in nodes.iter().rev() {
                if let Some(value) = node.get(key)? {
                    return Ok(live(value));
                }
            }
        }
        // sorted levels: at most one node can hold the key
        for level_nodes in self.inner.levels.iter().skip(1) {
            let nodes = level_nodes.read();
            let at = nodes.partition_point(|n| n.end_key.as_ref() < key);
            if let Some(node) = nodes.get(at) {
                if let Some(value) = node.get(key)? {
                    return Ok(live(value));
                }
            }
        }
        Ok(None)
    }

    /// `(node count, total bytes)` per level. Diagnostics and tests.
    pub fn level_stats(&self) -> Vec<(usize, u64)> {
        self.inner
            .levels
            .iter()
            .map(|l| {
                let nodes = l.read();
                (nodes.len(), nodes.iter().map(|n| n.size).sum())
            })
            .collect()
    }

    /// Signal the worker and wait for its done acknowledgment. Pending
    /// memtable flushes are drained before the worker exits.
    pub fn stop(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        let _ = self.stop_tx.send(());
        let _ = self.done_rx.recv();
        if worker.join().is_err() {
            warn!("compaction worker panicked during shutdown");
        }
        self.inner.write.read().wal.sync()?;
        Ok(())
    }

    fn rotate(&self, side: &mut WriteSide) -> Result<()> {
        side.wal.sync()?;
        let next_index = side.memtable_index + 1;
        let next_wal = Wal::open(self.inner.opts.memtable_wal_path(next_index))?;
        let old_wal = std::mem::replace(&mut side.wal, next_wal);
        let old_path = old_wal.path().to_path_buf();
        drop(old_wal);

        let old_mem = std::mem::replace(&mut side.memtable, (self.inner.opts.memtable)());
        side.memtable_index = next_index;
        side.imm.push(ImmMemTable {
            mem: old_mem.clone(),
            wal_path: old_path.clone(),
        });
        let _ = self.inner.mem_tx.send(FlushJob {
            mem: old_mem,
            wal_path: old_path,
        });
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// The empty value is the tombstone: found, but reported as absent.
fn live(value: Bytes) -> Option<Bytes> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_sst_name(path: &std::path::Path) -> Option<(usize, u64)> {
    if path.extension()? != "sst" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (level, seq) = stem.split_once('_')?;
    Some((level.parse().ok()?, seq.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let tree = LsmTree::open(Options::new(dir.path()).unwrap()).unwrap();
        tree.put(b"key", b"v1").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), Some(Bytes::from_static(b"v1")));
        tree.put(b"key", b"v2").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), Some(Bytes::from_static(b"v2")));
        tree.delete(b"key").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), None);
        assert_eq!(tree.get(b"never").unwrap(), None);
        tree.stop().unwrap();
    }

    #[test]
    fn test_restart_replays_wal() {
        let dir = tempdir().unwrap();
        {
            let tree = LsmTree::open(Options::new(dir.path()).unwrap()).unwrap();
            tree.put(b"persisted", b"yes").unwrap();
            tree.stop().unwrap();
        }
        let tree = LsmTree::open(Options::new(dir.path()).unwrap()).unwrap();
        assert_eq!(
            tree.get(b"persisted").unwrap(),
            Some(Bytes::from_static(b"yes"))
        );
        tree.stop().unwrap();
    }

    #[test]
    fn test_sst_name_parsing() {
        use std::path::Path;
        assert_eq!(parse_sst_name(Path::new("/x/0_12.sst")), Some((0, 12)));
        assert_eq!(parse_sst_name(Path::new("/x/3_7.sst")), Some((3, 7)));
        assert_eq!(parse_sst_name(Path::new("/x/nope.sst")), None);
        assert_eq!(parse_sst_name(Path::new("/x/0_12.tmp")), None);
    }
}
