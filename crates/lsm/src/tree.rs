//! The LSM tree: engine contract over memtables, SSTables, and the WAL.
//!
//! Write path: WAL append first, then the active memtable. Freeze on
//! threshold schedules a flush; flushes land in L0; the level manager's
//! thresholds schedule compactions.
//!
//! Read path: memtables (newest first), then L0 by sequence, then the
//! non-overlapping levels top down. A tombstone anywhere shadows older
//! versions below it.
//!
//! # Lock discipline
//!
//! Lock order is fixed: tree-level state (`levels`) before the memtable
//! manager's internal locks, and `levels` before `manifest`. Nothing in
//! this crate takes them in the other order, and no thread is ever
//! joined while a lock is held:
//!
//! - `close()` flushes synchronously and exists for callers that need a
//!   clean shutdown point. It is never called from drop.
//! - Drop marks the tree closed, then destroys the scheduler (joining
//!   workers) with no lock held, then lets the components drop in
//!   order: compactor first, then levels, memtables, WAL, manifest.

use crate::compaction::{CompactionScheduler, LsmTask};
use crate::levels::{LevelState, SstFile};
use crate::manifest::{sstable_path, FileMeta, Manifest};
use crate::memtable::{MemTableManager, MemValue};
use crate::sstable::{write_sstable, SSTableReader, SstEntry};
use concord_core::config::{LsmConfig, WalConfig};
use concord_core::engine::{decode_state, encode_state, EngineStats, KvEngine};
use concord_core::error::{Error, ErrorKind, Result};
use concord_core::types::{EngineKind, Key, OpKind, Value};
use concord_durability::wal::{read_all, WalWriter};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

struct LsmShared {
    config: LsmConfig,
    sst_dir: PathBuf,
    wal: WalWriter,
    memtables: MemTableManager,
    levels: RwLock<LevelState>,
    manifest: Mutex<Manifest>,
    is_open: AtomicBool,
    /// Set on the first Corruption; writes refuse until reopen.
    poisoned: AtomicBool,
    /// At most one flush in flight; two workers must not race on the
    /// same frozen table.
    flush_lock: Mutex<()>,
    /// At most one compaction in flight; the job is re-picked under it.
    compact_lock: Mutex<()>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    compactions: AtomicU64,
}

/// Log-structured merge tree satisfying the engine contract.
pub struct LsmTree {
    shared: Arc<LsmShared>,
    scheduler: CompactionScheduler,
}

impl LsmTree {
    /// Open (or create) a tree rooted at `dir`.
    ///
    /// Layout: `dir/wal` for segments, `dir/sst` for tables and the
    /// manifest. Recovery loads the manifest, opens every live table,
    /// and replays WAL entries past the flushed watermark into a fresh
    /// memtable.
    pub fn open(dir: &Path, config: LsmConfig, wal_config: WalConfig) -> Result<LsmTree> {
        let wal_dir = dir.join("wal");
        let sst_dir = dir.join("sst");
        std::fs::create_dir_all(&sst_dir)?;

        let manifest = Manifest::load(&sst_dir)?;
        let levels = LevelState::from_manifest(&sst_dir, &manifest)?;
        let wal = WalWriter::open(&wal_dir, wal_config)?;
        let memtables = MemTableManager::new(&config);

        // Replay the WAL tail that never reached an SSTable.
        let mut replayed = 0u64;
        for entry in read_all(&wal_dir)? {
            if entry.seq <= manifest.last_flushed_seq {
                continue;
            }
            let value = match entry.kind {
                OpKind::Put | OpKind::Update => MemValue {
                    seq: entry.seq,
                    value: entry.value,
                },
                OpKind::Delete => MemValue {
                    seq: entry.seq,
                    value: None,
                },
                _ => continue,
            };
            memtables.insert(entry.key, value);
            replayed += 1;
        }
        if replayed > 0 {
            info!(target: "concord::lsm", replayed, "WAL tail replayed into memtable");
        }

        let shared = Arc::new(LsmShared {
            config: config.clone(),
            sst_dir,
            wal,
            memtables,
            levels: RwLock::new(levels),
            manifest: Mutex::new(manifest),
            is_open: AtomicBool::new(true),
            poisoned: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            compact_lock: Mutex::new(()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        });

        let weak: Weak<LsmShared> = Arc::downgrade(&shared);
        let scheduler = CompactionScheduler::start(config.compaction_workers, move |task| {
            let Some(shared) = weak.upgrade() else { return };
            if !shared.is_open.load(Ordering::Acquire) {
                return;
            }
            let result = match task {
                LsmTask::Flush => run_flush(&shared),
                LsmTask::Compact => run_compaction(&shared),
            };
            if let Err(e) = result {
                warn!(target: "concord::lsm", error = %e, ?task, "background task failed");
            }
        });

        Ok(LsmTree { shared, scheduler })
    }

    /// Flush every memtable and sync the WAL. A clean shutdown point;
    /// never invoked from drop.
    pub fn close(&self) -> Result<()> {
        self.shared.memtables.freeze_active();
        while self.shared.memtables.frozen_count() > 0 {
            run_flush(&self.shared)?;
        }
        self.shared.wal.sync()?;
        self.shared.is_open.store(false, Ordering::Release);
        Ok(())
    }

    /// Block until a manual flush of all frozen tables completes.
    pub fn flush(&self) -> Result<()> {
        self.shared.memtables.freeze_active();
        while self.shared.memtables.frozen_count() > 0 {
            run_flush(&self.shared)?;
        }
        Ok(())
    }

    /// Run compactions until no threshold is crossed.
    pub fn compact(&self) -> Result<()> {
        loop {
            let job_exists = self
                .shared
                .levels
                .read()
                .pick_compaction(&self.shared.config)
                .is_some();
            if !job_exists {
                return Ok(());
            }
            run_compaction(&self.shared)?;
        }
    }

    /// Flushes and compactions completed so far.
    pub fn background_stats(&self) -> (u64, u64) {
        (
            self.shared.flushes.load(Ordering::Relaxed),
            self.shared.compactions.load(Ordering::Relaxed),
        )
    }

    fn check_writable(&self) -> Result<()> {
        if !self.shared.is_open.load(Ordering::Acquire) {
            return Err(Error::InvalidState("lsm tree is closed".into()));
        }
        if self.shared.poisoned.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "lsm tree refused writes after corruption; reopen required".into(),
            ));
        }
        Ok(())
    }

    fn note_error(&self, e: &Error) {
        if e.kind() == ErrorKind::Corruption {
            self.shared.poisoned.store(true, Ordering::Release);
        }
    }

    /// Raw version lookup: tombstones come back as `Some(None)`.
    fn get_version(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        if let Some(v) = self.shared.memtables.get(key) {
            return Ok(Some(v.value));
        }
        match self.shared.levels.read().get(key) {
            Ok(Some(entry)) => Ok(Some(entry.value)),
            Ok(None) => Ok(None),
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    /// Live state: newest version per key, tombstones folded away.
    fn full_state(&self) -> Result<Vec<(Key, Value)>> {
        use std::collections::BTreeMap;
        let disk = self.shared.levels.read().merged_scan()?;
        let mut state: BTreeMap<Vec<u8>, Vec<u8>> = disk
            .into_iter()
            .filter_map(|e| e.value.map(|v| (e.key, v)))
            .collect();
        // Memtables overlay the disk view, oldest table first so the
        // newest version lands last.
        for table in self.shared.memtables.all_tables().into_iter().rev() {
            for (key, value) in table.to_sorted_entries() {
                match value.value {
                    Some(v) => {
                        state.insert(key, v);
                    }
                    None => {
                        state.remove(&key);
                    }
                }
            }
        }
        Ok(state
            .into_iter()
            .map(|(k, v)| (Key::new(k), Value::new(v)))
            .collect())
    }

    fn after_write(&self, froze: bool) {
        if froze {
            self.scheduler.schedule(LsmTask::Flush);
        }
        let needs_compaction = self
            .shared
            .levels
            .read()
            .pick_compaction(&self.shared.config)
            .is_some();
        if needs_compaction {
            self.scheduler.schedule(LsmTask::Compact);
        }
    }
}

impl KvEngine for LsmTree {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.shared.writes.fetch_add(1, Ordering::Relaxed);
        let seq = self.shared.wal.append(OpKind::Put, key, Some(value))?;
        let froze = self.shared.memtables.insert(
            key.to_vec(),
            MemValue {
                seq,
                value: Some(value.to_vec()),
            },
        );
        self.after_write(froze);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Value> {
        self.shared.reads.fetch_add(1, Ordering::Relaxed);
        match self.get_version(key)? {
            Some(Some(value)) => Ok(Value::new(value)),
            Some(None) | None => Err(Error::NotFound),
        }
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        match self.get_version(key)? {
            Some(Some(_)) => {}
            Some(None) | None => return Err(Error::NotFound),
        }
        let seq = self.shared.wal.append(OpKind::Delete, key, None)?;
        let froze = self
            .shared
            .memtables
            .insert(key.to_vec(), MemValue { seq, value: None });
        self.shared.deletes.fetch_add(1, Ordering::Relaxed);
        self.after_write(froze);
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        match self.get_version(key)? {
            Some(Some(_)) => {}
            Some(None) | None => return Err(Error::NotFound),
        }
        let seq = self.shared.wal.append(OpKind::Update, key, Some(value))?;
        let froze = self.shared.memtables.insert(
            key.to_vec(),
            MemValue {
                seq,
                value: Some(value.to_vec()),
            },
        );
        self.shared.writes.fetch_add(1, Ordering::Relaxed);
        self.after_write(froze);
        Ok(())
    }

    fn count(&self) -> usize {
        self.full_state().map(|s| s.len()).unwrap_or(0)
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Lsm
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            reads: self.shared.reads.load(Ordering::Relaxed),
            writes: self.shared.writes.load(Ordering::Relaxed),
            deletes: self.shared.deletes.load(Ordering::Relaxed),
        }
    }

    fn serialize_state(&self) -> Result<Vec<u8>> {
        encode_state(&self.full_state()?)
    }

    fn restore_state(&self, payload: &[u8]) -> Result<()> {
        for (key, value) in decode_state(payload)? {
            self.put(key.as_bytes(), value.as_bytes())?;
        }
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        // Destroy, not close: mark closed, join workers with no lock
        // held, then let fields drop. Flushing belongs to an explicit
        // close() the caller chose to make.
        self.shared.is_open.store(false, Ordering::Release);
        self.scheduler.destroy();
    }
}

/// Flush the oldest frozen memtable into an L0 SSTable.
fn run_flush(shared: &LsmShared) -> Result<()> {
    let _flushing = shared.flush_lock.lock();
    let Some(table) = shared.memtables.oldest_frozen() else {
        return Ok(());
    };
    let entries: Vec<SstEntry> = table
        .to_sorted_entries()
        .into_iter()
        .map(|(key, v)| SstEntry {
            key,
            seq: v.seq,
            value: v.value,
        })
        .collect();
    if entries.is_empty() {
        shared.memtables.remove_frozen(table.id());
        return Ok(());
    }

    let number = shared.manifest.lock().allocate_file_number();
    let path = sstable_path(&shared.sst_dir, number);
    let footer = write_sstable(
        &path,
        &entries,
        shared.config.block_bytes,
        shared.config.bloom_fp_rate,
    )?;
    let meta = FileMeta {
        number,
        level: 0,
        smallest: entries.first().map(|e| e.key.clone()).unwrap_or_default(),
        largest: entries.last().map(|e| e.key.clone()).unwrap_or_default(),
        entry_count: footer.entry_count,
        min_seq: footer.min_seq,
        max_seq: footer.max_seq,
    };
    let reader = Arc::new(SSTableReader::open(&path)?);

    // Commit: levels before manifest, always.
    {
        let mut levels = shared.levels.write();
        let mut manifest = shared.manifest.lock();
        levels.add_file(SstFile {
            meta: meta.clone(),
            reader,
        });
        manifest.add_file(meta);
        manifest.last_flushed_seq = manifest.last_flushed_seq.max(footer.max_seq);
        manifest.save(&shared.sst_dir)?;
    }
    shared.memtables.remove_frozen(table.id());
    shared.flushes.fetch_add(1, Ordering::Relaxed);
    debug!(target: "concord::lsm", file = number, entries = footer.entry_count, "memtable flushed");
    Ok(())
}

/// Run one compaction picked by the level manager.
fn run_compaction(shared: &LsmShared) -> Result<()> {
    let _compacting = shared.compact_lock.lock();
    let job = {
        let levels = shared.levels.read();
        match levels.pick_compaction(&shared.config) {
            Some(job) => job,
            None => return Ok(()),
        }
    };
    let target_level = job.level + 1;

    // Snapshot the input readers under the read hold, merge outside it.
    let (inputs, deepest) = {
        let levels = shared.levels.read();
        let mut inputs: Vec<SstFile> = Vec::new();
        for file in levels.level(job.level as usize) {
            if job.inputs.contains(&file.meta.number) {
                inputs.push(file.clone());
            }
        }
        for file in levels.level(target_level as usize) {
            if job.next_level_inputs.contains(&file.meta.number) {
                inputs.push(file.clone());
            }
        }
        (inputs, levels.deepest_level())
    };

    // Oldest first so newer versions overwrite during the fold. Files
    // from the target level predate everything in the source level.
    let mut ordered = inputs.clone();
    ordered.sort_by_key(|f| (std::cmp::Reverse(f.meta.level), f.meta.number));
    use std::collections::BTreeMap;
    let mut merged: BTreeMap<Vec<u8>, SstEntry> = BTreeMap::new();
    for file in &ordered {
        for entry in file.reader.scan()? {
            merged.insert(entry.key.clone(), entry);
        }
    }

    // Tombstones drop only when nothing deeper could hold the key.
    let drop_tombstones = (target_level as usize) >= deepest;
    let survivors: Vec<SstEntry> = merged
        .into_values()
        .filter(|e| !(drop_tombstones && e.value.is_none()))
        .collect();

    let mut output: Option<(FileMeta, Arc<SSTableReader>)> = None;
    if !survivors.is_empty() {
        let number = shared.manifest.lock().allocate_file_number();
        let path = sstable_path(&shared.sst_dir, number);
        let footer = write_sstable(
            &path,
            &survivors,
            shared.config.block_bytes,
            shared.config.bloom_fp_rate,
        )?;
        let meta = FileMeta {
            number,
            level: target_level,
            smallest: survivors.first().map(|e| e.key.clone()).unwrap_or_default(),
            largest: survivors.last().map(|e| e.key.clone()).unwrap_or_default(),
            entry_count: footer.entry_count,
            min_seq: footer.min_seq,
            max_seq: footer.max_seq,
        };
        output = Some((meta, Arc::new(SSTableReader::open(&path)?)));
    }

    let all_input_numbers: Vec<u64> = job
        .inputs
        .iter()
        .chain(job.next_level_inputs.iter())
        .copied()
        .collect();

    // Commit: levels before manifest, then unlink obsolete files.
    {
        let mut levels = shared.levels.write();
        let mut manifest = shared.manifest.lock();
        levels.remove_files(&all_input_numbers);
        manifest.remove_files(&all_input_numbers);
        if let Some((meta, reader)) = output {
            levels.add_file(SstFile {
                meta: meta.clone(),
                reader,
            });
            manifest.add_file(meta);
        }
        manifest.save(&shared.sst_dir)?;
    }
    for number in &all_input_numbers {
        let _ = std::fs::remove_file(sstable_path(&shared.sst_dir, *number));
    }
    shared.compactions.fetch_add(1, Ordering::Relaxed);
    debug!(
        target: "concord::lsm",
        level = job.level,
        inputs = all_input_numbers.len(),
        "compaction complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config() -> LsmConfig {
        LsmConfig {
            memtable_bytes: 64 * 1024,
            memtable_entries: 50,
            block_bytes: 512,
            level0_files: 3,
            level_size_multiplier: 4,
            compaction_workers: 2,
            bloom_fp_rate: 0.01,
        }
    }

    #[test]
    fn test_crud_through_the_contract() {
        let dir = tempdir().unwrap();
        let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
        tree.put(b"a", b"1").unwrap();
        tree.put(b"b", b"2").unwrap();
        tree.update(b"a", b"1'").unwrap();
        assert_eq!(tree.get(b"a").unwrap(), Value::from("1'"));
        tree.delete(b"b").unwrap();
        assert!(tree.get(b"b").is_err());
        assert!(tree.delete(b"b").is_err());
        assert_eq!(tree.count(), 1);
    }

    #[test]
    fn test_reads_span_memtables_and_sstables() {
        let dir = tempdir().unwrap();
        let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
        for i in 0..200 {
            tree.put(format!("key-{:04}", i).as_bytes(), format!("v{}", i).as_bytes())
                .unwrap();
        }
        tree.flush().unwrap();
        // Fresh writes stay in the memtable; flushed ones are on disk.
        for i in 200..260 {
            tree.put(format!("key-{:04}", i).as_bytes(), format!("v{}", i).as_bytes())
                .unwrap();
        }
        for i in 0..260 {
            assert_eq!(
                tree.get(format!("key-{:04}", i).as_bytes()).unwrap(),
                Value::from(format!("v{}", i).as_str()),
                "key {}",
                i
            );
        }
        assert_eq!(tree.count(), 260);
    }

    #[test]
    fn test_tombstone_shadows_flushed_value() {
        let dir = tempdir().unwrap();
        let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
        tree.put(b"k", b"old").unwrap();
        tree.flush().unwrap();
        tree.delete(b"k").unwrap();
        assert!(tree.get(b"k").is_err());
        tree.flush().unwrap();
        assert!(tree.get(b"k").is_err());
    }

    #[test]
    fn test_compaction_folds_levels() {
        let dir = tempdir().unwrap();
        let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
        // Several flush rounds over the same key range force L0 overlap.
        for round in 0..4 {
            for i in 0..60 {
                tree.put(
                    format!("key-{:03}", i).as_bytes(),
                    format!("round-{}", round).as_bytes(),
                )
                .unwrap();
            }
            tree.flush().unwrap();
        }
        tree.compact().unwrap();
        let (_, compactions) = tree.background_stats();
        assert!(compactions >= 1);
        for i in 0..60 {
            assert_eq!(
                tree.get(format!("key-{:03}", i).as_bytes()).unwrap(),
                Value::from("round-3")
            );
        }
        assert_eq!(tree.count(), 60);
    }

    #[test]
    fn test_recovery_replays_wal_tail() {
        let dir = tempdir().unwrap();
        {
            let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
            for i in 0..30 {
                tree.put(format!("k{}", i).as_bytes(), b"v").unwrap();
            }
            tree.shared.wal.sync().unwrap();
            // Dropped without close(): nothing flushed, WAL has it all.
        }
        let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
        assert_eq!(tree.count(), 30);
        assert_eq!(tree.get(b"k7").unwrap(), Value::from("v"));
    }

    #[test]
    fn test_recovery_after_clean_close() {
        let dir = tempdir().unwrap();
        {
            let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
            for i in 0..120 {
                tree.put(format!("k{:03}", i).as_bytes(), b"v").unwrap();
            }
            tree.delete(b"k005").unwrap();
            tree.close().unwrap();
        }
        let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
        assert_eq!(tree.count(), 119);
        assert!(tree.get(b"k005").is_err());
        assert_eq!(tree.get(b"k100").unwrap(), Value::from("v"));
    }

    #[test]
    fn test_writes_refused_after_close() {
        let dir = tempdir().unwrap();
        let tree = LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap();
        tree.put(b"a", b"1").unwrap();
        tree.close().unwrap();
        let err = tree.put(b"b", b"2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(
            LsmTree::open(dir.path(), small_config(), WalConfig::default()).unwrap(),
        );
        let mut handles = Vec::new();
        for t in 0..4 {
            let tree = Arc::clone(&tree);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("t{}-{:03}", t, i);
                    tree.put(key.as_bytes(), b"v").unwrap();
                    assert_eq!(tree.get(key.as_bytes()).unwrap(), Value::from("v"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tree.count(), 800);
    }
}
