//! Append-only write-ahead log of length-prefixed records.
//!
//! Record layout: uvarint key length, uvarint value length, key bytes,
//! value bytes. Writers are single-producer per file; replay tolerates a
//! clean EOF between records and treats a truncated tail as uncommitted.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::codec::{get_uvarint, put_uvarint};
use crate::error::Result;
use crate::mem_table::MemTable;

pub struct Wal {
    file: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl Wal {
    /// Open the log for appending, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and make it durable before returning.
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(key.len() + value.len() + 10);
        put_uvarint(&mut record, key.len() as u64);
        put_uvarint(&mut record, value.len() as u64);
        record.extend_from_slice(key);
        record.extend_from_slice(value);

        let mut writer = self.file.lock();
        writer.write_all(&record)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut writer = self.file.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Decode every complete record in the file, in write order. A record
    /// cut short by a crash ends the stream without error.
    pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<(Bytes, Bytes)>> {
        let data = std::fs::read(path.as_ref())?;
        let mut buf = &data[..];
        let mut records = Vec::new();
        loop {
            if buf.is_empty() {
                break;
            }
            let Some(key_len) = get_uvarint(&mut buf) else {
                break;
            };
            let Some(value_len) = get_uvarint(&mut buf) else {
                break;
            };
            let (key_len, value_len) = (key_len as usize, value_len as usize);
            if buf.len() < key_len + value_len {
                // uncommitted tail
                break;
            }
            let key = Bytes::copy_from_slice(&buf[..key_len]);
            let value = Bytes::copy_from_slice(&buf[key_len..key_len + value_len]);
            buf = &buf[key_len + value_len..];
            records.push((key, value));
        }
        Ok(records)
    }

    /// Replay the log into a memtable, preserving write order.
    pub fn replay_into(path: impl AsRef<Path>, mem: &dyn MemTable) -> Result<()> {
        let records = Self::read_records(path.as_ref())?;
        let count = records.len();
        for (key, value) in records {
            mem.put(key, value);
        }
        info!(path = %path.as_ref().display(), records = count, "replayed wal");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_table::SkipList;
    use tempfile::tempdir;

    #[test]
    fn test_replay_into_memtable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.wal");
        let wal = Wal::open(&path).unwrap();
        for i in 1..=3 {
            wal.write(format!("key{i}").as_bytes(), format!("value{i}").as_bytes())
                .unwrap();
        }
        drop(wal);

        let mem = SkipList::new();
        Wal::replay_into(&path, &mem).unwrap();
        assert_eq!(mem.entries(), 3);
        for i in 1..=3 {
            assert_eq!(
                mem.get(format!("key{i}").as_bytes()),
                Some(Bytes::from(format!("value{i}")))
            );
        }
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.wal");
        let wal = Wal::open(&path).unwrap();
        wal.write(b"key1", b"value1").unwrap();
        wal.write(b"key2", b"value2").unwrap();
        drop(wal);

        // chop the last record in half
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();

        let records = Wal::read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, Bytes::from_static(b"key1"));
    }

    #[test]
    fn test_tombstone_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.wal");
        let wal = Wal::open(&path).unwrap();
        wal.write(b"gone", b"").unwrap();
        drop(wal);
        let records = Wal::read_records(&path).unwrap();
        assert_eq!(records, vec![(Bytes::from_static(b"gone"), Bytes::new())]);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.wal");
        {
            let wal = Wal::open(&path).unwrap();
            wal.write(b"a", b"1").unwrap();
        }
        {
            let wal = Wal::open(&path).unwrap();
            wal.write(b"b", b"2").unwrap();
        }
        assert_eq!(Wal::read_records(&path).unwrap().len(), 2);
    }
}
