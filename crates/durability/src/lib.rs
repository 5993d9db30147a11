//! Durability layer for ConcordKV
//!
//! This crate handles everything that touches disk for the in-memory
//! engines:
//!
//! - WAL: segmented append-only log, one CRC per entry, rotation on byte
//!   or entry thresholds, batched fsync
//! - Compaction: fold the log to the latest state per key, swap segments
//!   only after the successor is durable
//! - Snapshots: full and incremental, checksummed envelopes staged with
//!   write + fsync + rename
//! - Recovery: newest snapshot plus ordered WAL replay, stopping with
//!   `Corruption` at the first checksum mismatch
//!
//! The LSM engine has its own on-disk formats in `concord-lsm`; what it
//! shares with this crate is the WAL.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod recovery;
pub mod snapshot;
pub mod wal;

pub use format::{SegmentHeader, WalEntry, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC};
pub use recovery::{recover_engine, RecoveryStats};
pub use snapshot::{
    find_latest_snapshot, list_snapshots, read_envelope, restore_engine, write_full_snapshot,
    write_incremental_snapshot, SnapshotFileKind, SnapshotInfo, SNAPSHOT_HEADER_SIZE,
    SNAPSHOT_MAGIC,
};
pub use wal::{
    list_segments, read_all, read_segment, segment_path, CompactionResult, WalStats, WalWriter,
};
