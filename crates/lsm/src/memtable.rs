//! MemTables: the in-memory half of the LSM path.
//!
//! One active table absorbs writes through a lock-free skiplist; when it
//! crosses the configured byte or entry threshold the manager freezes it
//! atomically and starts a fresh one. Frozen tables are immutable and
//! queue up for flushing into L0 SSTables.
//!
//! Deletes are tombstones: a `None` value with a sequence number. A
//! tombstone found in a newer table shadows any older live version, so
//! readers must stop at the first table that knows the key at all.
//!
//! Lock order: the LSM tree's lock, when held, is always taken *before*
//! this manager's locks, never after.

use concord_core::config::LsmConfig;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// One versioned value in a memtable. `None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemValue {
    /// WAL sequence that produced this version
    pub seq: u64,
    /// Value bytes, or `None` for a delete
    pub value: Option<Vec<u8>>,
}

/// An ordered, concurrent write buffer.
pub struct MemTable {
    id: u64,
    map: SkipMap<Vec<u8>, MemValue>,
    bytes: AtomicUsize,
}

impl MemTable {
    fn new(id: u64) -> Self {
        MemTable {
            id,
            map: SkipMap::new(),
            bytes: AtomicUsize::new(0),
        }
    }

    /// Table id; larger ids are newer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a version (newest wins by overwrite).
    pub fn insert(&self, key: Vec<u8>, value: MemValue) {
        let added = key.len() + value.value.as_ref().map_or(0, |v| v.len()) + 16;
        self.map.insert(key, value);
        self.bytes.fetch_add(added, Ordering::Relaxed);
    }

    /// Latest version of `key` in this table, if any.
    pub fn get(&self, key: &[u8]) -> Option<MemValue> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// Entry count (tombstones included).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Approximate bytes held.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Drain into sorted `(key, MemValue)` pairs for flushing.
    pub fn to_sorted_entries(&self) -> Vec<(Vec<u8>, MemValue)> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Highest sequence number in the table, 0 when empty.
    pub fn max_seq(&self) -> u64 {
        self.map.iter().map(|e| e.value().seq).max().unwrap_or(0)
    }
}

/// Active table plus the frozen flush queue.
pub struct MemTableManager {
    active: RwLock<Arc<MemTable>>,
    /// Oldest first; flushing pops from the front
    frozen: RwLock<Vec<Arc<MemTable>>>,
    next_id: AtomicU64,
    max_bytes: usize,
    max_entries: usize,
}

impl MemTableManager {
    /// Create with the freeze thresholds from config.
    pub fn new(config: &LsmConfig) -> Self {
        MemTableManager {
            active: RwLock::new(Arc::new(MemTable::new(1))),
            frozen: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(2),
            max_bytes: config.memtable_bytes,
            max_entries: config.memtable_entries,
        }
    }

    /// Insert into the active table; freeze it first if it is full.
    ///
    /// Returns `true` when this call froze the previous active table
    /// (the caller should schedule a flush).
    pub fn insert(&self, key: Vec<u8>, value: MemValue) -> bool {
        let froze = {
            let active = self.active.read();
            if active.bytes() >= self.max_bytes || active.len() >= self.max_entries {
                drop(active);
                self.freeze_active();
                true
            } else {
                false
            }
        };
        self.active.read().insert(key, value);
        froze
    }

    /// Atomically move the active table to the frozen queue.
    pub fn freeze_active(&self) {
        let mut active = self.active.write();
        if active.is_empty() {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let old = std::mem::replace(&mut *active, Arc::new(MemTable::new(id)));
        self.frozen.write().push(old);
    }

    /// Newest-first lookup across active and frozen tables.
    ///
    /// The first table that knows the key wins, tombstone or not.
    pub fn get(&self, key: &[u8]) -> Option<MemValue> {
        if let Some(v) = self.active.read().get(key) {
            return Some(v);
        }
        let frozen = self.frozen.read();
        for table in frozen.iter().rev() {
            if let Some(v) = table.get(key) {
                return Some(v);
            }
        }
        None
    }

    /// The oldest frozen table, if any, for flushing.
    pub fn oldest_frozen(&self) -> Option<Arc<MemTable>> {
        self.frozen.read().first().cloned()
    }

    /// Drop a flushed table from the frozen queue.
    pub fn remove_frozen(&self, id: u64) {
        self.frozen.write().retain(|t| t.id() != id);
    }

    /// Number of frozen tables awaiting flush.
    pub fn frozen_count(&self) -> usize {
        self.frozen.read().len()
    }

    /// Snapshot of every live table, newest first (active included).
    pub fn all_tables(&self) -> Vec<Arc<MemTable>> {
        let mut tables = vec![Arc::clone(&*self.active.read())];
        let frozen = self.frozen.read();
        tables.extend(frozen.iter().rev().cloned());
        tables
    }
}
