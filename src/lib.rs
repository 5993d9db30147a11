//! # ConcordKV storage core
//!
//! The local storage half of the ConcordKV distributed key-value
//! store: a pluggable storage-engine framework with a write-ahead log,
//! snapshots, transactions (local ACID plus a 2PC coordinator), an
//! arena allocator, and an async batched I/O path.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Database                           │
//! │  ┌───────────┐ ┌──────────────┐ ┌────────────────────┐  │
//! │  │  Engines   │ │ Transactions │ │   Batch I/O        │  │
//! │  │ Array/Hash │ │ local + 2PC  │ │ contexts + workers │  │
//! │  │ RBTree/B+  │ │ coordinator  │ │                    │  │
//! │  │ Tree/LSM   │ │              │ │                    │  │
//! │  └─────┬──────┘ └──────────────┘ └────────────────────┘  │
//! │        │ WAL-first writes                                │
//! │  ┌─────┴──────────────────────────────────────────────┐  │
//! │  │  Durability: segmented WAL, snapshots, recovery    │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The consensus layer, replication transport, routing, and cluster
//! membership are external collaborators; they consume the engine
//! contract and the coordinator's transport callback, and nothing in
//! this workspace opens a socket.
//!
//! ## Crates
//!
//! | Crate | Contents |
//! |---|---|
//! | `concord-core` | keys/values, errors, config, the engine contract |
//! | `concord-storage` | arena, engines, cache, bloom filters |
//! | `concord-concurrency` | locks, local txns, priority queue, 2PC |
//! | `concord-durability` | WAL, snapshots, compaction, recovery |
//! | `concord-lsm` | memtables, SSTables, levels, manifest, compaction |
//! | `concord-engine` | the `Database` facade and batch I/O |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use concord_concurrency::{
    Coordinator, CoordinatorStats, DistTxnStatus, Message, NodeId, PriorityQueue, Reply,
    SegmentedLock, Transaction, TxnManager, TxnStatus,
};
pub use concord_core::{
    ArenaConfig, BTreeConfig, BatchConfig, CacheConfig, CachePolicy, DistConfig, EngineConfig,
    EngineKind, EngineStats, Error, ErrorKind, HashConfig, IsolationLevel, Key, KvEngine,
    LsmConfig, OpKind, Record, Result, SchedulePolicy, SnapshotKind, ThreadMode, TxnConfig,
    TxnPriority, Value, WalConfig,
};
pub use concord_durability::{RecoveryStats, WalStats, WalWriter};
pub use concord_engine::{BatchHandle, BatchManager, BatchStatus, Database, DatabaseStats};
pub use concord_lsm::LsmTree;
pub use concord_storage::{
    create_engine, Arena, ArenaStats, BloomFilter, BloomHashKind, BloomVariant, Cache, CacheStats,
};
