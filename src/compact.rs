//! Background worker: memtable flushes into level 0 and leveled merges
//! toward the bottom of the tree.
//!
//! One dedicated thread selects over the stop, flush and level channels.
//! Failures here are logged and the cycle retried implicitly on the next
//! trigger; they never abort the process and never touch in-memory state.

use bytes::Bytes;
use crossbeam::channel::{select, Receiver, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::lsm_storage::{FlushJob, LsmInner};
use crate::table::builder::SsTableBuilder;
use crate::table::Node;

pub(crate) fn run_worker(
    inner: Arc<LsmInner>,
    mem_rx: Receiver<FlushJob>,
    level_rx: Receiver<usize>,
    stop_rx: Receiver<()>,
    done_tx: Sender<()>,
) {
    loop {
        select! {
            recv(stop_rx) -> _ => {
                // drain queued flushes so their WALs can be retired
                while let Ok(job) = mem_rx.try_recv() {
                    if let Err(err) = flush_memtable(&inner, &job) {
                        error!(%err, "memtable flush failed during shutdown");
                    }
                }
                break;
            }
            recv(mem_rx) -> job => {
                if let Ok(job) = job {
                    if let Err(err) = flush_memtable(&inner, &job) {
                        error!(%err, "memtable flush failed");
                    }
                }
            }
            recv(level_rx) -> level => {
                if let Ok(level) = level {
                    if let Err(err) = compact_level(&inner, level) {
                        error!(level, %err, "level compaction failed");
                    }
                }
            }
        }
    }
    drop(done_tx);
}

/// Write one rotated memtable out as a level-0 SSTable, retire it from the
/// read-only queue and unlink its WAL.
fn flush_memtable(inner: &Arc<LsmInner>, job: &FlushJob) -> Result<()> {
    let entries = job.mem.all();
    if !entries.is_empty() {
        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let path = inner.opts.sst_path(0, seq);
        let mut builder = SsTableBuilder::new(
            &path,
            inner.opts.sst_data_block_size,
            inner.opts.sst_footer_size,
            (inner.opts.filter)(),
        )?;
        for (key, value) in &entries {
            builder.append(key, value)?;
        }
        let build = builder.finish()?;
        let node = Node::from_build(
            &path,
            0,
            seq,
            inner.opts.sst_footer_size,
            build,
            (inner.opts.filter)(),
        )?;
        debug!(seq, entries = entries.len(), size = node.size, "flushed memtable");
        inner.levels[0].write().push(Arc::new(node));
    }

    {
        let mut side = inner.write.write();
        side.imm.retain(|imm| !Arc::ptr_eq(&imm.mem, &job.mem));
    }
    if let Err(err) = std::fs::remove_file(&job.wal_path) {
        error!(path = %job.wal_path.display(), %err, "failed to remove flushed wal");
    }

    try_trigger_compact(inner, 0);
    Ok(())
}

/// Merge overlapping nodes from `level` and `level + 1` through a scratch
/// memtable and stream the result into fresh tables at `level + 1`.
fn compact_level(inner: &Arc<LsmInner>, level: usize) -> Result<()> {
    if level + 1 >= inner.opts.max_level {
        return Ok(());
    }

    // pick: nodes at `level` overlapping the median's range, then everything
    // at `level + 1` overlapping the picked span
    let (picked, picked_next) = {
        let nodes = inner.levels[level].read();
        if nodes.is_empty() {
            return Ok(());
        }
        let median = &nodes[nodes.len() / 2];
        let (mut min, mut max) = (median.start_key.clone(), median.end_key.clone());
        let picked: Vec<Arc<Node>> = nodes
            .iter()
            .filter(|n| overlaps(n, &min, &max))
            .cloned()
            .collect();
        for node in &picked {
            if node.start_key < min {
                min = node.start_key.clone();
            }
            if node.end_key > max {
                max = node.end_key.clone();
            }
        }
        let next = inner.levels[level + 1].read();
        let picked_next: Vec<Arc<Node>> = next
            .iter()
            .filter(|n| overlaps(n, &min, &max))
            .cloned()
            .collect();
        (picked, picked_next)
    };

    // merge through a scratch memtable; feed older data first so the newest
    // value for each key wins
    let scratch = (inner.opts.memtable)();
    let mut sources: Vec<&Arc<Node>> = picked_next.iter().collect();
    let mut upper: Vec<&Arc<Node>> = picked.iter().collect();
    upper.sort_by_key(|n| n.seq);
    sources.extend(upper);
    for node in sources {
        for (key, value) in node.get_all()? {
            scratch.put(key, value);
        }
    }

    // stream into new tables capped at sst_size * 10^(level+1)
    let target = level + 1;
    let bottom = target == inner.opts.max_level - 1;
    let cap = (inner.opts.sst_size as u64).saturating_mul(10u64.saturating_pow(target as u32));
    let mut new_nodes: Vec<Arc<Node>> = Vec::new();
    let mut builder: Option<(u64, SsTableBuilder)> = None;
    for (key, value) in scratch.all() {
        if bottom && value.is_empty() {
            // tombstones die at the bottom level
            continue;
        }
        if builder.is_none() {
            let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
            builder = Some((
                seq,
                SsTableBuilder::new(
                    inner.opts.sst_path(target, seq),
                    inner.opts.sst_data_block_size,
                    inner.opts.sst_footer_size,
                    (inner.opts.filter)(),
                )?,
            ));
        }
        let full = {
            let (_, b) = builder.as_mut().unwrap();
            b.append(&key, &value)?;
            b.data_size() >= cap
        };
        if full {
            let (seq, b) = builder.take().unwrap();
            new_nodes.push(Arc::new(finish_node(inner, target, seq, b)?));
        }
    }
    if let Some((seq, b)) = builder.take() {
        new_nodes.push(Arc::new(finish_node(inner, target, seq, b)?));
    }

    // swap the level tables: register the merged output, then drop the
    // inputs; readers may briefly see both, never neither
    {
        let mut next = inner.levels[target].write();
        for node in new_nodes.iter().cloned() {
            let at = next.partition_point(|n| n.start_key < node.start_key);
            next.insert(at, node);
        }
        next.retain(|n| !picked_next.iter().any(|p| Arc::ptr_eq(p, n)));
    }
    {
        let mut cur = inner.levels[level].write();
        cur.retain(|n| !picked.iter().any(|p| Arc::ptr_eq(p, n)));
    }
    info!(
        level,
        merged = picked.len() + picked_next.len(),
        produced = new_nodes.len(),
        "compacted level"
    );

    // destroy the merged inputs off the worker
    std::thread::spawn(move || {
        for node in picked.iter().chain(picked_next.iter()) {
            node.destroy();
        }
    });

    try_trigger_compact(inner, target);
    Ok(())
}

/// Enqueue a compaction of `level` when it exceeds
/// `sst_size * 10^level * sst_num_per_level` and is not the last level.
pub(crate) fn try_trigger_compact(inner: &Arc<LsmInner>, level: usize) {
    if level + 1 >= inner.opts.max_level {
        return;
    }
    let total: u64 = inner.levels[level].read().iter().map(|n| n.size).sum();
    let threshold = (inner.opts.sst_size as u64)
        .saturating_mul(10u64.saturating_pow(level as u32))
        .saturating_mul(inner.opts.sst_num_per_level as u64);
    if total > threshold {
        debug!(level, total, threshold, "triggering level compaction");
        let _ = inner.level_tx.send(level);
    }
}

fn finish_node(
    inner: &Arc<LsmInner>,
    level: usize,
    seq: u64,
    builder: SsTableBuilder,
) -> Result<Node> {
    let path = builder.path().to_path_buf();
    let build = builder.finish()?;
    Node::from_build(
        &path,
        level,
        seq,
        inner.opts.sst_footer_size,
        build,
        (inner.opts.filter)(),
    )
}

fn overlaps(node: &Node, min: &Bytes, max: &Bytes) -> bool {
    node.start_key <= *max && node.end_key >= *min
}
