//! Concurrent skip list keyed by lexicographic byte order.
//!
//! Locking discipline: a top-level lock guards the `{level, size, entries}`
//! counters; each node carries its own lock over its forward pointers plus a
//! value lock. Writers traverse optimistically without holding locks, then
//! lock the per-level predecessors in address order, revalidate, and splice.
//! Nodes are never unlinked (tombstones are values), so validation only has
//! to defend against concurrent inserts.

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;

use super::MemTable;

const MAX_HEIGHT: usize = 16;
const PROMOTE: f64 = 0.25;

struct Node {
    key: Bytes,
    value: RwLock<Bytes>,
    /// Forward pointers, one per level this node participates in.
    next: RwLock<Vec<Option<Arc<Node>>>>,
}

impl Node {
    fn head() -> Arc<Node> {
        Arc::new(Node {
            key: Bytes::new(),
            value: RwLock::new(Bytes::new()),
            next: RwLock::new(vec![None; MAX_HEIGHT]),
        })
    }
}

struct Meta {
    level: usize,
    size: usize,
    entries: usize,
}

pub struct SkipList {
    head: Arc<Node>,
    meta: RwLock<Meta>,
}

impl SkipList {
    pub fn new() -> Self {
        Self {
            head: Node::head(),
            meta: RwLock::new(Meta {
                level: 1,
                size: 0,
                entries: 0,
            }),
        }
    }

    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen::<f64>() < PROMOTE {
            height += 1;
        }
        height
    }

    /// Lock-free traversal: for every level, the rightmost node whose key is
    /// strictly less than `key`, and the successor observed after it.
    fn find_preds(&self, key: &[u8]) -> (Vec<Arc<Node>>, Vec<Option<Arc<Node>>>) {
        let mut preds: Vec<Arc<Node>> = vec![self.head.clone(); MAX_HEIGHT];
        let mut succs: Vec<Option<Arc<Node>>> = vec![None; MAX_HEIGHT];
        let top = self.meta.read().level;
        let mut pred = self.head.clone();
        for level in (0..top).rev() {
            loop {
                let next = pred.next.read()[level].clone();
                match next {
                    Some(n) if n.key.as_ref() < key => pred = n,
                    other => {
                        succs[level] = other;
                        break;
                    }
                }
            }
            preds[level] = pred.clone();
        }
        (preds, succs)
    }

    /// Splice a freshly built node under address-ordered predecessor locks.
    /// Returns false when validation fails and the caller must retry.
    fn try_insert(
        &self,
        node: &Arc<Node>,
        height: usize,
        preds: &[Arc<Node>],
        succs: &[Option<Arc<Node>>],
    ) -> bool {
        // distinct predecessors, locked in stable address order
        let mut distinct: Vec<Arc<Node>> = preds[..height].to_vec();
        distinct.sort_by_key(|p| Arc::as_ptr(p) as usize);
        distinct.dedup_by_key(|p| Arc::as_ptr(p) as usize);
        let mut guards: Vec<_> = distinct
            .iter()
            .map(|p| (Arc::as_ptr(p) as usize, p.next.write()))
            .collect();
        let slot = |guards: &[(usize, _)], pred: &Arc<Node>| {
            let ptr = Arc::as_ptr(pred) as usize;
            guards.iter().position(|(p, _)| *p == ptr).unwrap()
        };

        // revalidate: every predecessor must still point at the successor we
        // observed, and no concurrent insert may have introduced the key
        for level in 0..height {
            let at = slot(&guards, &preds[level]);
            let current = &guards[at].1[level];
            let unchanged = match (current, &succs[level]) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                return false;
            }
            if let Some(next) = current {
                if next.key == node.key {
                    return false;
                }
            }
        }

        {
            let mut next = node.next.write();
            for level in 0..height {
                next[level] = succs[level].clone();
            }
        }
        for level in 0..height {
            let at = slot(&guards, &preds[level]);
            guards[at].1[level] = Some(node.clone());
        }
        // release in reverse acquisition order
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        true
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable for SkipList {
    fn put(&self, key: Bytes, value: Bytes) {
        loop {
            let (preds, succs) = self.find_preds(&key);

            // in-place update through the level-0 predecessor
            if let Some(succ) = &succs[0] {
                if succ.key == key {
                    let guard = preds[0].next.write();
                    let still_there = matches!(&guard[0], Some(cur) if Arc::ptr_eq(cur, succ));
                    if !still_there {
                        continue;
                    }
                    let new_len = value.len();
                    let old_len = {
                        let mut slot = succ.value.write();
                        let old = slot.len();
                        *slot = value;
                        old
                    };
                    drop(guard);
                    let mut meta = self.meta.write();
                    meta.size += new_len;
                    meta.size -= old_len;
                    return;
                }
            }

            let height = self.random_height();
            let added = key.len() + value.len();
            let node = Arc::new(Node {
                key: key.clone(),
                value: RwLock::new(value.clone()),
                next: RwLock::new(vec![None; height]),
            });
            if self.try_insert(&node, height, &preds, &succs) {
                let mut meta = self.meta.write();
                meta.size += added;
                meta.entries += 1;
                if height > meta.level {
                    meta.level = height;
                }
                return;
            }
        }
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        loop {
            let (preds, _) = self.find_preds(key);
            // read-lock the predecessor and copy the value out under it
            let guard = preds[0].next.read();
            match &guard[0] {
                Some(succ) if succ.key.as_ref() == key => {
                    return Some(succ.value.read().clone());
                }
                Some(succ) if succ.key.as_ref() < key => {
                    // an insert slid in between traversal and locking
                    drop(guard);
                    continue;
                }
                _ => return None,
            }
        }
    }

    fn size(&self) -> usize {
        self.meta.read().size
    }

    fn entries(&self) -> usize {
        self.meta.read().entries
    }

    fn all(&self) -> Vec<(Bytes, Bytes)> {
        let mut out = Vec::with_capacity(self.entries());
        let mut node = self.head.next.read()[0].clone();
        while let Some(n) = node {
            out.push((n.key.clone(), n.value.read().clone()));
            node = n.next.read()[0].clone();
        }
        out
    }
}
