//! Array engine: linear probe over a flat record vector.
//!
//! O(N) everything. This is the correctness baseline the other engines
//! are differential-tested against, and a reasonable choice below a few
//! hundred keys where cache-friendly linear scans win anyway.

use concord_core::engine::{decode_state, encode_state, EngineStats, KvEngine};
use concord_core::error::{Error, Result};
use concord_core::types::{EngineKind, Key, Value};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Flat-vector engine with one reader-writer lock.
pub struct ArrayEngine {
    records: RwLock<Vec<(Key, Value)>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl ArrayEngine {
    /// Create an empty array engine.
    pub fn new() -> Self {
        ArrayEngine {
            records: RwLock::new(Vec::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl Default for ArrayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for ArrayEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write();
        match records.iter_mut().find(|(k, _)| k.as_bytes() == key) {
            Some((_, v)) => *v = Value::from(value),
            None => records.push((Key::from(key), Value::from(value))),
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read();
        records
            .iter()
            .find(|(k, _)| k.as_bytes() == key)
            .map(|(_, v)| v.clone())
            .ok_or(Error::NotFound)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut records = self.records.write();
        match records.iter().position(|(k, _)| k.as_bytes() == key) {
            Some(pos) => {
                records.swap_remove(pos);
                self.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut records = self.records.write();
        match records.iter_mut().find(|(k, _)| k.as_bytes() == key) {
            Some((_, v)) => {
                *v = Value::from(value);
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn count(&self) -> usize {
        self.records.read().len()
    }

    fn batch_put(&self, pairs: &[(Key, Value)]) -> Result<()> {
        // One writer hold for the whole batch.
        let mut records = self.records.write();
        for (key, value) in pairs {
            match records.iter_mut().find(|(k, _)| k == key) {
                Some((_, v)) => *v = value.clone(),
                None => records.push((key.clone(), value.clone())),
            }
        }
        self.writes.fetch_add(pairs.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Array
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn serialize_state(&self) -> Result<Vec<u8>> {
        let mut pairs = self.records.read().clone();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        encode_state(&pairs)
    }

    fn restore_state(&self, payload: &[u8]) -> Result<()> {
        let pairs = decode_state(payload)?;
        *self.records.write() = pairs;
        Ok(())
    }
}
