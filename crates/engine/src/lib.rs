//! Engine orchestration for ConcordKV
//!
//! The topmost crate of the storage core:
//!
//! - [`Database`]: one handle wiring the configured engine to its WAL,
//!   snapshots, recovery, transactions, and the background WAL
//!   compactor
//! - [`BatchManager`]: async batch I/O with pooled contexts, worker
//!   threads, per-op callbacks in enqueue order, completion callbacks
//!
//! The consensus and replication layers above consume exactly this
//! surface plus the engine contract from `concord-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod database;

pub use batch::{
    BatchHandle, BatchManager, BatchOpKind, BatchOpResult, BatchStatus, CompletionCallback,
    OpCallback,
};
pub use database::{Database, DatabaseStats};
