//! Database facade: one handle wiring an engine to its durability.
//!
//! `Database::open` validates the config, runs recovery (newest
//! snapshot plus WAL replay), builds the configured engine, and starts
//! a background WAL compactor. Every mutation appends to the WAL before
//! touching the engine, so a crash at any point replays to the exact
//! pre-crash state.
//!
//! The LSM kind manages its own WAL, SSTables, and recovery inside
//! `concord-lsm`; for it this facade is a thin pass-through and the
//! snapshot/compaction machinery here stays idle.

use concord_concurrency::transaction::{Transaction, TxnManager};
use concord_core::config::{EngineConfig, IsolationLevel, SnapshotKind};
use concord_core::engine::{EngineStats, KvEngine};
use concord_core::error::{Error, ErrorKind, Result};
use concord_core::types::{EngineKind, OpKind, Value};
use concord_durability::recovery::{recover_engine, RecoveryStats};
use concord_durability::snapshot::{
    find_latest_snapshot, write_full_snapshot, write_incremental_snapshot,
};
use concord_durability::wal::{list_segments, WalWriter};
use concord_lsm::LsmTree;
use concord_storage::create_engine;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Compact the WAL once it holds more than this many segments.
const WAL_COMPACT_SEGMENT_THRESHOLD: usize = 4;

/// How often the background compactor checks.
const WAL_COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Aggregate view a `stats()` call returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseStats {
    /// Engine operation counters
    pub engine: EngineStats,
    /// Times recovery actually restored state on open (0 or 1 per handle)
    pub recoveries: u64,
    /// WAL entries appended through this handle
    pub wal_appends: u64,
    /// Snapshots written through this handle
    pub snapshots: u64,
}

/// One open database: engine + WAL + snapshots + transactions.
pub struct Database {
    config: EngineConfig,
    engine: Arc<dyn KvEngine>,
    wal: Option<Arc<WalWriter>>,
    snapshot_dir: PathBuf,
    txns: Arc<TxnManager>,
    recovery: RecoveryStats,
    recoveries: AtomicU64,
    snapshots: AtomicU64,
    /// Set on the first Corruption; further writes refuse until reopen.
    poisoned: AtomicBool,
    compactor_stop: Arc<AtomicBool>,
    compactor: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Open (or create) a database rooted at `dir`.
    pub fn open(dir: &Path, config: EngineConfig) -> Result<Database> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        let snapshot_dir = dir.join("snapshots");
        let txns = Arc::new(TxnManager::new(config.txn.default_isolation));

        if config.kind == EngineKind::Lsm {
            let engine: Arc<dyn KvEngine> = Arc::new(LsmTree::open(
                &dir.join("lsm"),
                config.lsm.clone(),
                config.wal.clone(),
            )?);
            return Ok(Database {
                config,
                engine,
                wal: None,
                snapshot_dir,
                txns,
                recovery: RecoveryStats::default(),
                recoveries: AtomicU64::new(0),
                snapshots: AtomicU64::new(0),
                poisoned: AtomicBool::new(false),
                compactor_stop: Arc::new(AtomicBool::new(false)),
                compactor: Mutex::new(None),
            });
        }

        let wal_dir = dir.join("wal");
        let engine = create_engine(&config)?;
        let recovery = recover_engine(&wal_dir, &snapshot_dir, engine.as_ref())?;
        if recovery.needed {
            info!(
                target: "concord::db",
                replayed = recovery.entries_replayed,
                "database recovered"
            );
        }
        let wal = Arc::new(WalWriter::open(&wal_dir, config.wal.clone())?);

        let compactor_stop = Arc::new(AtomicBool::new(false));
        let compactor = {
            let wal = Arc::clone(&wal);
            let stop = Arc::clone(&compactor_stop);
            let wal_dir = wal_dir.clone();
            std::thread::Builder::new()
                .name("wal-compactor".into())
                .spawn(move || {
                    // Short sleep slices keep shutdown prompt; the
                    // actual check runs on the configured interval.
                    let slice = Duration::from_millis(100);
                    let mut since_check = Duration::ZERO;
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(slice);
                        since_check += slice;
                        if since_check < WAL_COMPACT_CHECK_INTERVAL {
                            continue;
                        }
                        since_check = Duration::ZERO;
                        let segments = match list_segments(&wal_dir) {
                            Ok(s) => s,
                            Err(_) => continue,
                        };
                        if segments.len() > WAL_COMPACT_SEGMENT_THRESHOLD {
                            if let Err(e) = wal.compact() {
                                warn!(target: "concord::db", error = %e, "wal compaction failed");
                            }
                        }
                    }
                })
                .expect("spawn wal-compactor")
        };

        Ok(Database {
            config,
            engine,
            wal: Some(wal),
            snapshot_dir,
            txns,
            recoveries: AtomicU64::new(u64::from(recovery.needed)),
            recovery,
            snapshots: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
            compactor_stop,
            compactor: Mutex::new(Some(compactor)),
        })
    }

    /// The engine behind this handle.
    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    /// What recovery found on open.
    pub fn recovery(&self) -> &RecoveryStats {
        &self.recovery
    }

    fn check_writable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "database refused writes after corruption; reopen required".into(),
            ));
        }
        Ok(())
    }

    fn note_error(&self, e: &Error) {
        if e.kind() == ErrorKind::Corruption {
            self.poisoned.store(true, Ordering::Release);
        }
    }

    /// Insert or replace a key. WAL-first.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        if let Some(wal) = &self.wal {
            wal.append(OpKind::Put, key, Some(value))
                .map_err(|e| {
                    self.note_error(&e);
                    e
                })?;
        }
        self.engine.put(key, value)
    }

    /// Fetch a key.
    pub fn get(&self, key: &[u8]) -> Result<Value> {
        self.engine.get(key)
    }

    /// Delete a key. `NotFound` costs no WAL entry.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        if let Some(wal) = &self.wal {
            // Existence first: a missing key must not pollute the log.
            self.engine.get(key)?;
            wal.append(OpKind::Delete, key, None).map_err(|e| {
                self.note_error(&e);
                e
            })?;
        }
        self.engine.delete(key)
    }

    /// Replace an existing key; `NotFound` when absent.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        if let Some(wal) = &self.wal {
            self.engine.get(key)?;
            wal.append(OpKind::Update, key, Some(value)).map_err(|e| {
                self.note_error(&e);
                e
            })?;
        }
        self.engine.update(key, value)
    }

    /// Unique key count.
    pub fn count(&self) -> usize {
        self.engine.count()
    }

    /// Begin a local transaction on this database's engine.
    pub fn begin_txn(&self, isolation: Option<IsolationLevel>) -> Transaction {
        self.txns.begin(Arc::clone(&self.engine), isolation)
    }

    /// Transaction manager (ids and lifecycle counters).
    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.txns
    }

    /// Write a snapshot now, per the configured snapshot kind.
    ///
    /// Incremental falls back to full when no base exists yet.
    pub fn snapshot_now(&self) -> Result<()> {
        let Some(wal) = &self.wal else {
            // The LSM path checkpoints through its own manifest.
            return Ok(());
        };
        wal.sync()?;
        let last_seq = wal.next_seq().saturating_sub(1);
        let base = find_latest_snapshot(&self.snapshot_dir)?;
        match (self.config.snapshot_kind, base) {
            (SnapshotKind::Incremental, Some(base)) if base.seq < last_seq => {
                write_incremental_snapshot(
                    &self.snapshot_dir,
                    self.engine.as_ref(),
                    last_seq,
                    base.seq,
                )?;
            }
            _ => {
                write_full_snapshot(&self.snapshot_dir, self.engine.as_ref(), last_seq)?;
            }
        }
        self.snapshots.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Force one WAL compaction pass.
    pub fn compact_wal(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.compact()?;
        }
        Ok(())
    }

    /// Force an fsync of the WAL.
    pub fn sync(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            engine: self.engine.stats(),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            wal_appends: self.wal.as_ref().map(|w| w.stats().appends).unwrap_or(0),
            snapshots: self.snapshots.load(Ordering::Relaxed),
        }
    }

    /// Clean shutdown: final snapshot, WAL sync, compactor joined.
    pub fn close(self) -> Result<()> {
        self.snapshot_now()?;
        self.sync()?;
        // Drop handles the thread join.
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.compactor_stop.store(true, Ordering::Release);
        if let Some(handle) = self.compactor.lock().take() {
            let _ = handle.join();
        }
    }
}
