//! Typed configuration tree for the storage core.
//!
//! One [`EngineConfig`] describes an entire engine instance: the engine
//! kind plus per-subsystem sections. Every section has a `Default` carrying
//! the documented defaults, and `EngineConfig::validate` rejects nonsensical
//! values with `ErrorKind::InvalidArg` before any resource is allocated.

use crate::error::{Error, Result};
use crate::types::EngineKind;
use std::time::Duration;

/// B+Tree order bounds.
pub const BTREE_MIN_ORDER: usize = 3;
/// Maximum supported B+Tree order.
pub const BTREE_MAX_ORDER: usize = 1000;
/// Default B+Tree order.
pub const BTREE_DEFAULT_ORDER: usize = 100;

/// Default WAL segment rotation threshold in bytes (64 MiB).
pub const WAL_DEFAULT_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;
/// Default WAL segment rotation threshold in entries.
pub const WAL_DEFAULT_SEGMENT_ENTRIES: u64 = 1000;
/// Default number of appends between batched fsyncs.
pub const WAL_DEFAULT_FSYNC_EVERY: u64 = 100;
/// Default wall-clock bound between batched fsyncs.
pub const WAL_DEFAULT_FSYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Cache eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePolicy {
    /// Least recently used
    Lru,
    /// Least frequently used, ties broken by age
    Lfu,
    /// First in, first out
    Fifo,
    /// Uniform random victim
    Random,
    /// Second-chance circular scan
    Clock,
    /// Adaptive replacement (recency + frequency with ghost lists)
    Arc,
}

/// Arena thread-safety mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// No internal locking; caller guarantees exclusive access
    SingleThread,
    /// Writer hold on mutation, reader hold on stats
    MultiThread,
}

/// Snapshot flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Complete engine state
    Full,
    /// Diff against a base snapshot
    Incremental,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Writes apply eagerly and are immediately visible
    ReadUncommitted,
    /// Writes buffer until commit
    ReadCommitted,
    /// Read Committed plus per-key read latching
    RepeatableRead,
    /// Repeatable Read plus invisibility of new keys until commit
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

/// Distributed-transaction schedule policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Strict arrival order
    Fifo,
    /// Priority descending, FIFO among equals (default)
    Priority,
}

/// Hash engine section.
#[derive(Debug, Clone)]
pub struct HashConfig {
    /// Starting bucket count per segment; must be a power of two
    pub initial_buckets: usize,
    /// Resize trigger: entries per bucket
    pub load_factor: f64,
    /// Number of lock segments
    pub segments: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        HashConfig {
            initial_buckets: 16,
            load_factor: 0.75,
            segments: 16,
        }
    }
}

/// B+Tree engine section.
#[derive(Debug, Clone)]
pub struct BTreeConfig {
    /// Branching factor (3..=1000)
    pub order: usize,
    /// Enable the hot-node cache
    pub cache_enabled: bool,
    /// Hot-node cache max entries
    pub cache_capacity: usize,
    /// Enable the adaptive node-size manager
    pub adaptive_sizing: bool,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            order: BTREE_DEFAULT_ORDER,
            cache_enabled: false,
            cache_capacity: 1024,
            adaptive_sizing: false,
        }
    }
}

/// Cache subsystem section.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Eviction policy
    pub policy: CachePolicy,
    /// Maximum entries
    pub capacity: usize,
    /// Hash-index bucket count
    pub buckets: usize,
    /// Optional entry time-to-live
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            policy: CachePolicy::Lru,
            capacity: 1024,
            buckets: 256,
            ttl: None,
        }
    }
}

/// Arena allocator section.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Bytes per block
    pub block_size: usize,
    /// Locking mode
    pub thread_mode: ThreadMode,
    /// Return compacted blocks to a reuse cache
    pub enable_block_cache: bool,
    /// Reuse cache depth
    pub max_cached_blocks: usize,
    /// Advisory NUMA placement hint; ignored where the platform offers
    /// no placement control
    pub numa_node: Option<u32>,
    /// Track size/alignment histograms
    pub collect_detailed_stats: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            block_size: 4096,
            thread_mode: ThreadMode::MultiThread,
            enable_block_cache: true,
            max_cached_blocks: 16,
            numa_node: None,
            collect_detailed_stats: false,
        }
    }
}

/// WAL section.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Rotate when the active segment exceeds this many bytes
    pub segment_bytes: u64,
    /// Rotate when the active segment exceeds this many entries
    pub segment_entries: u64,
    /// Batched fsync: appends between syncs
    pub fsync_every: u64,
    /// Batched fsync: wall-clock bound between syncs
    pub fsync_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            segment_bytes: WAL_DEFAULT_SEGMENT_BYTES,
            segment_entries: WAL_DEFAULT_SEGMENT_ENTRIES,
            fsync_every: WAL_DEFAULT_FSYNC_EVERY,
            fsync_interval: WAL_DEFAULT_FSYNC_INTERVAL,
        }
    }
}

/// LSM engine section.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Freeze the active memtable past this many bytes
    pub memtable_bytes: usize,
    /// Freeze the active memtable past this many entries
    pub memtable_entries: usize,
    /// Target uncompressed data-block size in SSTables
    pub block_bytes: usize,
    /// Trigger L0 -> L1 compaction at this many L0 files
    pub level0_files: usize,
    /// Size ratio between adjacent levels
    pub level_size_multiplier: u64,
    /// Compaction worker threads
    pub compaction_workers: usize,
    /// Bloom filter target false-positive rate for SSTables
    pub bloom_fp_rate: f64,
}

impl Default for LsmConfig {
    fn default() -> Self {
        LsmConfig {
            memtable_bytes: 4 * 1024 * 1024,
            memtable_entries: 100_000,
            block_bytes: 4096,
            level0_files: 4,
            level_size_multiplier: 10,
            compaction_workers: 2,
            bloom_fp_rate: 0.01,
        }
    }
}

/// Local transaction section.
#[derive(Debug, Clone, Default)]
pub struct TxnConfig {
    /// Isolation when `begin` is called without one
    pub default_isolation: IsolationLevel,
}

/// Distributed coordinator section.
#[derive(Debug, Clone)]
pub struct DistConfig {
    /// Schedule policy (default Priority)
    pub schedule_policy: SchedulePolicy,
    /// Priority queue capacity; non-positive clamps to the default
    pub priority_queue_capacity: usize,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Timeout-checker scan period
    pub timeout_check_interval: Duration,
}

impl Default for DistConfig {
    fn default() -> Self {
        DistConfig {
            schedule_policy: SchedulePolicy::Priority,
            priority_queue_capacity: 64,
            heartbeat_interval: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(1),
        }
    }
}

/// Async batch I/O section.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Ops per batch context
    pub max_batch_size: usize,
    /// Pool size: concurrently live contexts
    pub max_concurrent_batches: usize,
    /// Default `wait` timeout
    pub timeout: Duration,
    /// Worker threads executing submitted batches
    pub workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_batch_size: 256,
            max_concurrent_batches: 32,
            timeout: Duration::from_secs(30),
            workers: 2,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Which engine backs this instance
    pub kind: EngineKind,
    /// Hash engine section
    pub hash: HashConfig,
    /// B+Tree engine section
    pub btree: BTreeConfig,
    /// Cache subsystem section
    pub cache: CacheConfig,
    /// Arena allocator section
    pub arena: ArenaConfig,
    /// WAL section
    pub wal: WalConfig,
    /// LSM section
    pub lsm: LsmConfig,
    /// Snapshot flavor taken by periodic snapshots
    pub snapshot_kind: SnapshotKind,
    /// Local transaction section
    pub txn: TxnConfig,
    /// Distributed coordinator section
    pub dist: DistConfig,
    /// Async batch I/O section
    pub batch: BatchConfig,
}

impl EngineConfig {
    /// Configuration for the given engine kind with all defaults.
    pub fn new(kind: EngineKind) -> Self {
        EngineConfig {
            kind,
            hash: HashConfig::default(),
            btree: BTreeConfig::default(),
            cache: CacheConfig::default(),
            arena: ArenaConfig::default(),
            wal: WalConfig::default(),
            lsm: LsmConfig::default(),
            snapshot_kind: SnapshotKind::Full,
            txn: TxnConfig::default(),
            dist: DistConfig::default(),
            batch: BatchConfig::default(),
        }
    }

    /// Validate every section.
    ///
    /// Called by the factory before any resource is allocated, so a bad
    /// config never leaves a half-built engine behind.
    pub fn validate(&self) -> Result<()> {
        if !self.hash.initial_buckets.is_power_of_two() {
            return Err(Error::InvalidArg(format!(
                "hash.initial_buckets must be a power of two, got {}",
                self.hash.initial_buckets
            )));
        }
        if self.hash.load_factor <= 0.0 || !self.hash.load_factor.is_finite() {
            return Err(Error::InvalidArg(format!(
                "hash.load_factor must be positive, got {}",
                self.hash.load_factor
            )));
        }
        if self.hash.segments == 0 {
            return Err(Error::InvalidArg("hash.segments must be > 0".into()));
        }
        if self.btree.order < BTREE_MIN_ORDER || self.btree.order > BTREE_MAX_ORDER {
            return Err(Error::InvalidArg(format!(
                "btree.order must be in {}..={}, got {}",
                BTREE_MIN_ORDER, BTREE_MAX_ORDER, self.btree.order
            )));
        }
        if self.btree.cache_enabled && self.btree.cache_capacity == 0 {
            return Err(Error::InvalidArg(
                "btree.cache.capacity must be > 0 when the cache is enabled".into(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(Error::InvalidArg("cache.capacity must be > 0".into()));
        }
        if self.cache.buckets == 0 {
            return Err(Error::InvalidArg("cache.buckets must be > 0".into()));
        }
        if self.arena.block_size == 0 {
            return Err(Error::InvalidArg("arena.block_size must be > 0".into()));
        }
        if self.wal.segment_bytes == 0 || self.wal.segment_entries == 0 {
            return Err(Error::InvalidArg(
                "wal rotation thresholds must be > 0".into(),
            ));
        }
        if self.wal.fsync_every == 0 {
            return Err(Error::InvalidArg("wal.fsync_every must be > 0".into()));
        }
        if self.lsm.memtable_bytes == 0 || self.lsm.memtable_entries == 0 {
            return Err(Error::InvalidArg(
                "lsm memtable thresholds must be > 0".into(),
            ));
        }
        if self.lsm.block_bytes == 0 {
            return Err(Error::InvalidArg("lsm.block_bytes must be > 0".into()));
        }
        if self.lsm.bloom_fp_rate <= 0.0 || self.lsm.bloom_fp_rate >= 1.0 {
            return Err(Error::InvalidArg(format!(
                "lsm.bloom_fp_rate must be in (0, 1), got {}",
                self.lsm.bloom_fp_rate
            )));
        }
        if self.batch.max_batch_size == 0 {
            return Err(Error::InvalidArg("batch.max_batch_size must be > 0".into()));
        }
        if self.batch.max_concurrent_batches == 0 {
            return Err(Error::InvalidArg(
                "batch.max_concurrent_batches must be > 0".into(),
            ));
        }
        if self.batch.workers == 0 {
            return Err(Error::InvalidArg("batch.workers must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::new(EngineKind::BPlusTree)
    }
}
