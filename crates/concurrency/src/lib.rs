//! Concurrency layer for ConcordKV
//!
//! Everything that coordinates threads around the storage engines:
//!
//! - Segmented locking primitives, with the workspace-wide
//!   lock-upgrade ban documented at the source
//! - The local transaction manager: four isolation levels, ordered op
//!   lists, eager apply with reverse-order rollback
//! - The bounded priority queue (mutex plus two condvars) backing the
//!   distributed coordinator
//! - The two-phase-commit coordinator: three background threads,
//!   transport callback, cooperative shutdown, coordinator-exclusive
//!   ownership of distributed transactions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dist;
pub mod locks;
pub mod queue;
pub mod transaction;

pub use dist::{
    Coordinator, CoordinatorStats, DistTxnStatus, DistributedTxn, Message, NodeId, Reply,
    Transport,
};
pub use locks::SegmentedLock;
pub use queue::{PriorityQueue, DEFAULT_QUEUE_CAPACITY};
pub use transaction::{Transaction, TxnManager, TxnManagerStats, TxnOp, TxnOpKind, TxnStatus};
