//! The in-memory ordered store absorbing recent writes.
//!
//! The LSM tree only depends on the `MemTable` trait so the structure can be
//! swapped through `Options`; the default is the concurrent skip list.

pub mod skiplist;

use bytes::Bytes;
use std::sync::Arc;

pub use skiplist::SkipList;

/// Ordered byte-string map. An empty value is the tombstone; the trait does
/// not interpret it.
///
/// All methods take `&self`: implementations synchronize internally so one
/// instance can serve concurrent readers and writers.
pub trait MemTable: Send + Sync {
    fn put(&self, key: Bytes, value: Bytes);
    fn get(&self, key: &[u8]) -> Option<Bytes>;
    /// Total bytes of keys plus values currently stored.
    fn size(&self) -> usize;
    /// Number of live entries.
    fn entries(&self) -> usize;
    /// Ordered snapshot of every `(key, value)` pair.
    fn all(&self) -> Vec<(Bytes, Bytes)>;
}

pub type MemTableFactory = Arc<dyn Fn() -> Arc<dyn MemTable> + Send + Sync>;

pub fn skiplist_factory() -> MemTableFactory {
    Arc::new(|| Arc::new(SkipList::new()) as Arc<dyn MemTable>)
}
