//! Thin facade over the LSM tree for scalar (metadata) records.

use bytes::Bytes;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::lsm_storage::LsmTree;

pub struct ScalarStorage {
    lsm: LsmTree,
}

impl ScalarStorage {
    pub fn open(opts: Options) -> Result<Self> {
        Ok(Self {
            lsm: LsmTree::open(opts)?,
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.lsm.put(key, value)
    }

    /// `(value, exists)`; a tombstoned or never-written key reads as absent.
    pub fn get(&self, key: &[u8]) -> Result<(Bytes, bool)> {
        match self.lsm.get(key)? {
            Some(value) => Ok((value, true)),
            None => Ok((Bytes::new(), false)),
        }
    }

    /// Deletion is a tombstone put.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.lsm.delete(key)
    }

    pub fn batch_put(&self, keys: &[Bytes], values: &[Bytes]) -> Result<()> {
        if keys.len() != values.len() {
            return Err(Error::MismatchKeysValues);
        }
        for (key, value) in keys.iter().zip(values) {
            self.lsm.put(key, value)?;
        }
        Ok(())
    }

    pub fn level_stats(&self) -> Vec<(usize, u64)> {
        self.lsm.level_stats()
    }

    pub fn stop(&self) -> Result<()> {
        self.lsm.stop()
    }
}
