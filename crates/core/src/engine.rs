//! The uniform engine contract.
//!
//! Every storage engine (Array, Hash, RBTree, B+Tree, LSM) satisfies
//! [`KvEngine`]. Consumers (transactions, batch I/O, the database facade,
//! and the out-of-scope consensus layer) program against this trait only.
//!
//! All engines are thread-safe for concurrent readers and writers; the
//! trait takes `&self` throughout and implementations use segmented or
//! internal locks. Values returned to the caller are freshly owned copies.

use crate::error::Result;
use crate::types::{EngineKind, Key, Value};

/// Point-in-time operation counters for an engine.
///
/// Counters are monotonic and approximate under concurrency (Relaxed
/// atomics); they exist for observability, not control flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Successful and failed `get` calls
    pub reads: u64,
    /// `put`, `update`, and `batch_put` element writes
    pub writes: u64,
    /// Successful `delete` calls
    pub deletes: u64,
}

impl EngineStats {
    /// Total operations observed.
    pub fn total_ops(&self) -> u64 {
        self.reads + self.writes + self.deletes
    }
}

/// Capability set every engine must satisfy.
pub trait KvEngine: Send + Sync {
    /// Insert or replace `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Fetch an owned copy of the value for `key`, or `NotFound`.
    fn get(&self, key: &[u8]) -> Result<Value>;

    /// Remove `key`. Returns `NotFound` when absent; deleting twice
    /// reports `NotFound` the second time, not a harder error.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Replace the value of an existing `key`; `NotFound` when absent.
    fn update(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Number of unique keys reachable by `get`.
    fn count(&self) -> usize;

    /// Insert many pairs. The default implementation loops `put`;
    /// engines override when they can batch under one hold.
    fn batch_put(&self, pairs: &[(Key, Value)]) -> Result<()> {
        for (k, v) in pairs {
            self.put(k.as_bytes(), v.as_bytes())?;
        }
        Ok(())
    }

    /// Which engine kind this is.
    fn kind(&self) -> EngineKind;

    /// Operation counters.
    fn stats(&self) -> EngineStats;

    /// Serialize the complete engine state for a snapshot payload.
    ///
    /// The encoding is engine-owned; the durability layer treats it as
    /// opaque bytes under the snapshot envelope checksum.
    fn serialize_state(&self) -> Result<Vec<u8>>;

    /// Replace the engine state from a snapshot payload produced by
    /// [`KvEngine::serialize_state`].
    fn restore_state(&self, payload: &[u8]) -> Result<()>;
}

/// Canonical snapshot payload: sorted `(key, value)` pairs.
///
/// Every in-memory engine serializes through this shape so snapshots stay
/// portable across engine kinds (a snapshot written by the hash engine can
/// restore into a B+Tree).
pub fn encode_state(pairs: &[(Key, Value)]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(pairs)?)
}

/// Decode a payload produced by [`encode_state`].
pub fn decode_state(payload: &[u8]) -> Result<Vec<(Key, Value)>> {
    Ok(bincode::deserialize(payload)?)
}
