//! SSTable writer.
//!
//! File layout:
//!
//! ```text
//! [ data block 0 ][ data block 1 ]...[ data block n-1 ]
//! [ filter block ]
//! [ index block  ]
//! [ footer (32 bytes of offsets, padded to the configured footer size) ]
//! ```
//!
//! Every block is a run of records `u16 keyLen | u32 valueLen | key | value`
//! (little-endian). Filter-block records are keyed by the uvarint-encoded
//! offset of the data block they cover; index-block records carry a
//! separator key and `uvarint(offset) ++ uvarint(size)` of the block.

use bytes::{BufMut, Bytes};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::codec::{put_uvarint, uvarint};
use crate::error::{Error, Result};
use crate::table::bloom::Filter;
use crate::table::IndexEntry;

pub const FOOTER_CORE_SIZE: usize = 32;

/// Everything the caller caches about a finished table.
pub struct BuildResult {
    pub size: u64,
    pub filters: HashMap<u64, Bytes>,
    pub index: Vec<IndexEntry>,
}

pub(crate) fn put_record(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    buf.put_u16_le(key.len() as u16);
    buf.put_u32_le(value.len() as u32);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Separator placed between two adjacent blocks: at least every key of the
/// previous block, below every key of the next. Intentionally conservative:
/// the previous block's boundary key when one exists, otherwise the next key
/// with its last byte decremented.
pub(crate) fn separator_between(prev: &[u8], cur: &[u8]) -> Bytes {
    if !prev.is_empty() {
        return Bytes::copy_from_slice(prev);
    }
    if cur.is_empty() {
        return Bytes::new();
    }
    let mut sep = cur.to_vec();
    let last = sep.len() - 1;
    sep[last] = sep[last].wrapping_sub(1);
    sep.into()
}

pub struct SsTableBuilder {
    writer: BufWriter<File>,
    path: PathBuf,
    data_block_size: usize,
    footer_size: usize,

    /// Records accumulated for the block under construction.
    block: Vec<u8>,
    /// Bytes already flushed to the file.
    written: u64,
    filter: Box<dyn Filter>,
    /// Flushed block waiting for its index entry: (last key, offset, size).
    pending: Option<(Bytes, u64, u64)>,
    last_key: Bytes,

    filters: Vec<(u64, Bytes)>,
    index: Vec<IndexEntry>,
}

impl SsTableBuilder {
    pub fn new(
        path: impl AsRef<Path>,
        data_block_size: usize,
        footer_size: usize,
        filter: Box<dyn Filter>,
    ) -> Result<Self> {
        if footer_size < FOOTER_CORE_SIZE {
            return Err(Error::InvalidParameter(format!(
                "sst_footer_size must be at least {FOOTER_CORE_SIZE}, got {footer_size}"
            )));
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.as_ref().to_path_buf(),
            data_block_size,
            footer_size,
            block: Vec::new(),
            written: 0,
            filter,
            pending: None,
            last_key: Bytes::new(),
            filters: Vec::new(),
            index: Vec::new(),
        })
    }

    /// Number of data bytes committed so far, used by compaction to cap
    /// output tables.
    pub fn data_size(&self) -> u64 {
        self.written + self.block.len() as u64
    }

    /// Append one pair. Keys must arrive in non-decreasing order.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(
            self.last_key.is_empty() || key >= self.last_key.as_ref(),
            "keys must be appended in sorted order"
        );
        if self.block.is_empty() {
            self.emit_pending_index(key);
        }
        put_record(&mut self.block, key, value);
        self.filter.add(key);
        self.last_key = Bytes::copy_from_slice(key);
        if self.block.len() >= self.data_block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Write the footer and flush everything. Returns the caches the node
    /// keeps in memory.
    pub fn finish(mut self) -> Result<BuildResult> {
        if !self.block.is_empty() {
            self.flush_block()?;
        }
        self.emit_pending_index(b"");

        // filter block
        let filter_offset = self.written;
        let mut buf = Vec::new();
        for (offset, bitmap) in &self.filters {
            put_record(&mut buf, &uvarint(*offset), bitmap);
        }
        self.writer.write_all(&buf)?;
        let filter_size = buf.len() as u64;
        self.written += filter_size;

        // index block
        let index_offset = self.written;
        buf.clear();
        for entry in &self.index {
            let mut value = Vec::with_capacity(20);
            put_uvarint(&mut value, entry.offset);
            put_uvarint(&mut value, entry.size);
            put_record(&mut buf, &entry.key, &value);
        }
        self.writer.write_all(&buf)?;
        let index_size = buf.len() as u64;
        self.written += index_size;

        // footer
        let mut footer = Vec::with_capacity(self.footer_size);
        footer.put_u64_le(filter_offset);
        footer.put_u64_le(filter_size);
        footer.put_u64_le(index_offset);
        footer.put_u64_le(index_size);
        footer.resize(self.footer_size, 0);
        self.writer.write_all(&footer)?;
        self.written += footer.len() as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        Ok(BuildResult {
            size: self.written,
            filters: self.filters.into_iter().collect(),
            index: self.index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_block(&mut self) -> Result<()> {
        let offset = self.written;
        let size = self.block.len() as u64;
        self.writer.write_all(&self.block)?;
        self.written += size;
        self.block.clear();

        self.filters.push((offset, self.filter.hash()));
        self.filter.reset();
        self.pending = Some((self.last_key.clone(), offset, size));
        Ok(())
    }

    /// Emit the index record for the previously flushed block, keyed by the
    /// separator between its last key and the key opening the next block.
    fn emit_pending_index(&mut self, next_key: &[u8]) {
        if let Some((last_key, offset, size)) = self.pending.take() {
            self.index.push(IndexEntry {
                key: separator_between(&last_key, next_key),
                offset,
                size,
            });
        }
    }
}
