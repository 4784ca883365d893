//! Per-collection index lifecycle and durability.
//!
//! Every mutating operation funnels through one path: serialize a WAL
//! envelope, append it, then dispatch to the in-memory index, all under the
//! manager lock so the WAL order matches the applied order. A background
//! snapshotter persists indexes to `indexfile/` and retires WAL files once
//! every live collection's operations are covered by a snapshot; deleting a
//! collection cancels its pending snapshot by dropping the collection's
//! cancel channel.
//!
//! WAL files are self-describing: a freshly created file is seeded with
//! `CreateIndex` envelopes for every live collection, so replaying one file
//! can always reconstruct its targets (snapshot first, tail of operations
//! on top).

use crossbeam::channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::id::string_to_id;
use crate::vector::{Index, IndexConfig, VectorIndex};
use crate::wal::Wal;

const SAVE_QUEUE_DEPTH: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    CreateIndex,
    Build,
    Add,
    AddBatch,
    Delete,
}

/// One WAL record value: `{op_type, collection, data}` as UTF-8 JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct WalEnvelope {
    pub op_type: OpType,
    pub collection: String,
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct AddPayload {
    id: String,
    vector: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct BatchPayload {
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct DeletePayload {
    id: String,
}

struct SaveJob {
    collection: String,
    index: Arc<RwLock<Index>>,
    /// Operation count observed at enqueue time; everything up to it is
    /// guaranteed to be inside the snapshot this job writes.
    seq: u64,
    cancel: Receiver<()>,
}

struct ManagerState {
    indexes: HashMap<String, Arc<RwLock<Index>>>,
    configs: HashMap<String, IndexConfig>,
    /// Mutating ops appended per collection since open.
    op_seq: HashMap<String, u64>,
    /// Ops known to be covered by an on-disk snapshot.
    snap_seq: HashMap<String, u64>,
    /// Never sent on; dropping the sender on delete cancels pending saves.
    cancels: HashMap<String, (Sender<()>, Receiver<()>)>,
    /// Lazily created; envelopes are collection-tagged, so one file can
    /// interleave several collections and still recover.
    wal: Option<Wal>,
}

struct ManagerInner {
    opts: Options,
    state: RwLock<ManagerState>,
}

pub struct IndexManager {
    inner: Arc<ManagerInner>,
    save_tx: Sender<SaveJob>,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndexManager {
    pub fn open(opts: Options) -> Result<Self> {
        opts.ensure_dirs()?;
        let inner = Arc::new(ManagerInner {
            opts,
            state: RwLock::new(ManagerState {
                indexes: HashMap::new(),
                configs: HashMap::new(),
                op_seq: HashMap::new(),
                snap_seq: HashMap::new(),
                cancels: HashMap::new(),
                wal: None,
            }),
        });
        let (save_tx, save_rx) = bounded(SAVE_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let worker = {
            let inner = inner.clone();
            std::thread::spawn(move || run_snapshotter(inner, save_rx, stop_rx, done_tx))
        };
        Ok(Self {
            inner,
            save_tx,
            stop_tx,
            done_rx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Recovery: replay `walfile/index/*.wal` in modification order, then
    /// load snapshots for collections with no outstanding WAL state.
    pub fn load_indexes(&self) -> Result<()> {
        // 1. WAL replay
        let mut wal_files: Vec<(SystemTime, std::path::PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(self.inner.opts.index_wal_dir())? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "wal") {
                let mtime = std::fs::metadata(&path)?.modified()?;
                wal_files.push((mtime, path));
            }
        }
        wal_files.sort_by_key(|(mtime, _)| *mtime);
        for (_, path) in &wal_files {
            for (_, value) in Wal::read_records(path)? {
                let env: WalEnvelope = match serde_json::from_slice(&value) {
                    Ok(env) => env,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping malformed wal envelope");
                        continue;
                    }
                };
                self.replay_envelope(&env);
            }
        }

        // 2. snapshots for collections untouched by any WAL
        for entry in std::fs::read_dir(self.inner.opts.index_dir())? {
            let path = entry?.path();
            if !path.extension().map_or(false, |ext| ext == "conf") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.inner.state.read().indexes.contains_key(name) {
                continue;
            }
            let config: IndexConfig = serde_json::from_slice(&std::fs::read(&path)?)?;
            let mut index = Index::create(&config)?;
            let snapshot = self.inner.opts.index_snapshot_path(string_to_id(name));
            if snapshot.exists() {
                index.load(&snapshot)?;
            } else {
                warn!(collection = name, "config present without snapshot or wal");
            }
            let mut st = self.inner.state.write();
            st.indexes
                .insert(name.to_string(), Arc::new(RwLock::new(index)));
            st.configs.insert(name.to_string(), config);
        }

        // every live collection needs a cancel channel
        {
            let mut st = self.inner.state.write();
            let names: Vec<String> = st.indexes.keys().cloned().collect();
            for name in names {
                st.cancels.entry(name).or_insert_with(|| bounded(1));
            }
        }
        let count = self.inner.state.read().indexes.len();
        info!(collections = count, "vector indexes recovered");
        Ok(())
    }

    pub fn create_index(&self, name: &str, config: &IndexConfig) -> Result<()> {
        {
            let mut st = self.inner.state.write();
            if st.indexes.contains_key(name) {
                return Err(Error::CollectionExists(name.to_string()));
            }
            let env = WalEnvelope {
                op_type: OpType::CreateIndex,
                collection: name.to_string(),
                data: serde_json::to_value(config)?,
            };
            append_wal(&self.inner, &mut st, &env)?;

            let index = Index::create(config)?;
            std::fs::write(
                self.inner.opts.index_conf_path(name),
                serde_json::to_vec_pretty(config)?,
            )?;
            st.indexes
                .insert(name.to_string(), Arc::new(RwLock::new(index)));
            st.configs.insert(name.to_string(), config.clone());
            st.cancels.insert(name.to_string(), bounded(1));
        }
        // the fresh (empty) index gets a snapshot too
        self.schedule_save(name);
        Ok(())
    }

    pub fn get_index(&self, name: &str) -> Result<Arc<RwLock<Index>>> {
        self.inner
            .state
            .read()
            .indexes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    /// Unregister first so no new work can schedule, abandon any queued
    /// snapshot, then release memory and disk state.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        let index = {
            let mut st = self.inner.state.write();
            let Some(index) = st.indexes.remove(name) else {
                return Err(Error::IndexNotFound(name.to_string()));
            };
            st.configs.remove(name);
            st.op_seq.remove(name);
            st.snap_seq.remove(name);
            st.cancels.remove(name);
            index
        };
        index.write().close();

        let id = string_to_id(name);
        let wal_path = self.inner.opts.index_wal_path(id);
        {
            let mut st = self.inner.state.write();
            if st.wal.as_ref().map_or(false, |w| w.path() == wal_path) {
                st.wal = None;
            }
        }
        for path in [
            self.inner.opts.index_snapshot_path(id),
            self.inner.opts.index_conf_path(name),
            wal_path,
        ] {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %err, "failed to remove index file");
                }
            }
        }
        info!(collection = name, "vector index deleted");
        Ok(())
    }

    pub fn add_vector(&self, name: &str, id: &str, vector: &[f32]) -> Result<()> {
        self.apply_op_with_wal(WalEnvelope {
            op_type: OpType::Add,
            collection: name.to_string(),
            data: serde_json::to_value(AddPayload {
                id: id.to_string(),
                vector: vector.to_vec(),
            })?,
        })
    }

    pub fn add_vector_batch(
        &self,
        name: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        if ids.len() != vectors.len() {
            return Err(Error::MismatchKeysValues);
        }
        self.apply_op_with_wal(WalEnvelope {
            op_type: OpType::AddBatch,
            collection: name.to_string(),
            data: serde_json::to_value(BatchPayload {
                ids: ids.to_vec(),
                vectors: vectors.to_vec(),
            })?,
        })
    }

    pub fn build_index(&self, name: &str, ids: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        if ids.len() != vectors.len() {
            return Err(Error::MismatchKeysValues);
        }
        self.apply_op_with_wal(WalEnvelope {
            op_type: OpType::Build,
            collection: name.to_string(),
            data: serde_json::to_value(BatchPayload {
                ids: ids.to_vec(),
                vectors: vectors.to_vec(),
            })?,
        })
    }

    pub fn delete_vector(&self, name: &str, id: &str) -> Result<()> {
        self.apply_op_with_wal(WalEnvelope {
            op_type: OpType::Delete,
            collection: name.to_string(),
            data: serde_json::to_value(DeletePayload { id: id.to_string() })?,
        })
    }

    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.read().indexes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the snapshotter (waiting for its done handshake) and release
    /// every index. Queued snapshots are drained first so a clean shutdown
    /// leaves current `.idx` files behind.
    pub fn close(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        let _ = self.stop_tx.send(());
        let _ = self.done_rx.recv();
        if worker.join().is_err() {
            warn!("index snapshotter panicked during shutdown");
        }
        let mut st = self.inner.state.write();
        for (_, index) in st.indexes.drain() {
            index.write().close();
        }
        st.configs.clear();
        st.cancels.clear();
        st.wal = None;
        Ok(())
    }

    /// The single mutating-op funnel: WAL first, then the in-memory index,
    /// then a best-effort snapshot request. Holding the manager lock across
    /// both steps keeps the WAL order identical to the applied order, which
    /// the snapshotter's retirement check relies on.
    fn apply_op_with_wal(&self, env: WalEnvelope) -> Result<()> {
        {
            let mut st = self.inner.state.write();
            append_wal(&self.inner, &mut st, &env)?;
            if env.op_type == OpType::CreateIndex {
                return Ok(());
            }
            let index = st
                .indexes
                .get(&env.collection)
                .cloned()
                .ok_or_else(|| Error::IndexNotFound(env.collection.clone()))?;
            dispatch_op(&index, &env)?;
            *st.op_seq.entry(env.collection.clone()).or_insert(0) += 1;
        }
        self.schedule_save(&env.collection);
        Ok(())
    }

    /// Best-effort enqueue; a full queue means a snapshot is already on the
    /// way and will capture this state.
    fn schedule_save(&self, name: &str) {
        let job = {
            let st = self.inner.state.read();
            let (Some(index), Some((_, cancel))) = (st.indexes.get(name), st.cancels.get(name))
            else {
                return;
            };
            SaveJob {
                collection: name.to_string(),
                index: index.clone(),
                seq: st.op_seq.get(name).copied().unwrap_or(0),
                cancel: cancel.clone(),
            }
        };
        let _ = self.save_tx.try_send(job);
    }

    fn replay_envelope(&self, env: &WalEnvelope) {
        if env.op_type == OpType::CreateIndex {
            let config: IndexConfig = match serde_json::from_value(env.data.clone()) {
                Ok(config) => config,
                Err(err) => {
                    warn!(collection = %env.collection, %err, "bad create_index payload");
                    return;
                }
            };
            let mut st = self.inner.state.write();
            if st.indexes.contains_key(&env.collection) {
                return;
            }
            let mut index = match Index::create(&config) {
                Ok(index) => index,
                Err(err) => {
                    warn!(collection = %env.collection, %err, "replay create failed");
                    return;
                }
            };
            // start from the latest snapshot when one exists; the rest of
            // this wal replays the tail on top of it
            let snapshot = self
                .inner
                .opts
                .index_snapshot_path(string_to_id(&env.collection));
            if snapshot.exists() {
                if let Err(err) = index.load(&snapshot) {
                    warn!(collection = %env.collection, %err, "snapshot load during replay");
                }
            }
            st.indexes
                .insert(env.collection.clone(), Arc::new(RwLock::new(index)));
            st.configs.insert(env.collection.clone(), config);
            return;
        }
        let Ok(index) = self.get_index(&env.collection) else {
            warn!(
                collection = %env.collection,
                op = ?env.op_type,
                "wal op for unknown index, skipping"
            );
            return;
        };
        if let Err(err) = dispatch_op(&index, env) {
            warn!(collection = %env.collection, op = ?env.op_type, %err, "wal op replay failed");
        }
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn append_wal(inner: &ManagerInner, st: &mut ManagerState, env: &WalEnvelope) -> Result<()> {
    if st.wal.is_none() {
        let path = inner.opts.index_wal_path(string_to_id(&env.collection));
        let wal = Wal::open(path)?;
        // seed the fresh file with the live collections so it replays
        // standalone
        for (name, config) in &st.configs {
            let create = WalEnvelope {
                op_type: OpType::CreateIndex,
                collection: name.clone(),
                data: serde_json::to_value(config)?,
            };
            wal.write(name.as_bytes(), &serde_json::to_vec(&create)?)?;
        }
        st.wal = Some(wal);
    }
    let value = serde_json::to_vec(env)?;
    st.wal
        .as_ref()
        .unwrap()
        .write(env.collection.as_bytes(), &value)
}

fn dispatch_op(index: &Arc<RwLock<Index>>, env: &WalEnvelope) -> Result<()> {
    match env.op_type {
        OpType::CreateIndex => Ok(()),
        OpType::Build => {
            let p: BatchPayload = serde_json::from_value(env.data.clone())?;
            index.write().build(&p.ids, &p.vectors)
        }
        OpType::Add => {
            let p: AddPayload = serde_json::from_value(env.data.clone())?;
            index.write().add(&p.id, &p.vector)
        }
        OpType::AddBatch => {
            let p: BatchPayload = serde_json::from_value(env.data.clone())?;
            index.write().add_batch(&p.ids, &p.vectors)
        }
        OpType::Delete => {
            let p: DeletePayload = serde_json::from_value(env.data.clone())?;
            index.write().delete(&p.id)
        }
    }
}

fn run_snapshotter(
    inner: Arc<ManagerInner>,
    save_rx: Receiver<SaveJob>,
    stop_rx: Receiver<()>,
    done_tx: Sender<()>,
) {
    loop {
        select! {
            recv(stop_rx) -> _ => {
                // drain queued saves so shutdown leaves current snapshots
                while let Ok(job) = save_rx.try_recv() {
                    snapshot(&inner, job);
                }
                break;
            }
            recv(save_rx) -> job => {
                if let Ok(job) = job {
                    snapshot(&inner, job);
                }
            }
        }
    }
    drop(done_tx);
}

/// Persist one index. WAL files are retired only when every live
/// collection's appended operations are covered by a snapshot, so a replay
/// of any surviving WAL plus the snapshots always reconstructs the full
/// state. A delete that raced us shows up as a disconnected cancel channel
/// or a replaced map entry, both cheap to check before touching disk.
fn snapshot(inner: &Arc<ManagerInner>, job: SaveJob) {
    if job.cancel.try_recv() == Err(TryRecvError::Disconnected) {
        debug!(collection = %job.collection, "snapshot cancelled");
        return;
    }
    {
        let st = inner.state.read();
        match st.indexes.get(&job.collection) {
            Some(current) if Arc::ptr_eq(current, &job.index) => {}
            _ => return,
        }
    }

    let path = inner.opts.index_snapshot_path(string_to_id(&job.collection));
    if let Err(err) = job.index.read().save(&path) {
        warn!(collection = %job.collection, %err, "index snapshot failed");
        return;
    }
    debug!(collection = %job.collection, "index snapshot saved");

    let mut st = inner.state.write();
    let covered = st.snap_seq.entry(job.collection.clone()).or_insert(0);
    *covered = (*covered).max(job.seq);
    let all_covered = st.op_seq.iter().all(|(name, &appended)| {
        st.snap_seq.get(name).copied().unwrap_or(0) >= appended
    });
    if !all_covered {
        return;
    }
    // everything appended is snapshotted: the wal files are redundant
    st.wal = None;
    drop(st);
    if let Ok(entries) = std::fs::read_dir(inner.opts.index_wal_dir()) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "wal") {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), %err, "failed to retire index wal");
                }
            }
        }
    }
    debug!("index wal retired");
}
